use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Creates `dataset` with the given properties. Parents must exist.
pub fn create(dataset: &str, properties: &[(&str, &str)]) -> Result<(), Error> {
    let mut cmd = Dependency::Zfs.cmd();
    cmd.arg("create");
    for (key, value) in properties {
        cmd.arg("-o").arg(format!("{key}={value}"));
    }
    cmd.arg(dataset)
        .run_and_check()
        .with_context(|| format!("Failed to create dataset '{dataset}'"))
}

/// Every filesystem below and including `root`, parents before children.
pub fn list_recursive(root: &str) -> Result<Vec<String>, Error> {
    Ok(Dependency::Zfs
        .cmd()
        .arg("list")
        .arg("-H")
        .arg("-r")
        .arg("-o")
        .arg("name")
        .arg("-t")
        .arg("filesystem,volume")
        .arg(root)
        .output_and_check()
        .with_context(|| format!("Failed to list datasets of '{root}'"))?
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

pub fn get_property(dataset: &str, property: &str) -> Result<String, Error> {
    Ok(Dependency::Zfs
        .cmd()
        .arg("get")
        .arg("-H")
        .arg("-o")
        .arg("value")
        .arg(property)
        .arg(dataset)
        .output_and_check()
        .with_context(|| format!("Failed to read '{property}' of dataset '{dataset}'"))?
        .trim()
        .to_string())
}

pub fn is_mounted(dataset: &str) -> Result<bool, Error> {
    Ok(get_property(dataset, "mounted")? == "yes")
}

pub fn mount(dataset: &str) -> Result<(), Error> {
    Dependency::Zfs
        .cmd()
        .arg("mount")
        .arg(dataset)
        .run_and_check()
        .with_context(|| format!("Failed to mount dataset '{dataset}'"))
}

pub fn unmount(dataset: &str, force: bool) -> Result<(), Error> {
    let mut cmd = Dependency::Zfs.cmd();
    cmd.arg("unmount");
    if force {
        cmd.arg("-f");
    }
    cmd.arg(dataset)
        .run_and_check()
        .with_context(|| format!("Failed to unmount dataset '{dataset}'"))
}

pub fn destroy(dataset: &str) -> Result<(), Error> {
    Dependency::Zfs
        .cmd()
        .arg("destroy")
        .arg("-r")
        .arg(dataset)
        .run_and_check()
        .with_context(|| format!("Failed to destroy dataset '{dataset}'"))
}
