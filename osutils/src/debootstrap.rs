use std::path::Path;

use anyhow::{Context, Error};
use log::info;

use crate::dependencies::Dependency;

/// Installs a minimal `suite` tree from `mirror` into `root`, with
/// `include` added to the base package set.
pub fn run(suite: &str, root: &Path, mirror: &str, include: &[&str]) -> Result<(), Error> {
    info!(
        "Installing '{suite}' from '{mirror}' into '{}'",
        root.display()
    );
    let mut cmd = Dependency::Debootstrap.cmd();
    cmd.arg("--arch=amd64");
    if !include.is_empty() {
        cmd.arg(format!("--include={}", include.join(",")));
    }
    cmd.arg(suite)
        .arg(root)
        .arg(mirror)
        .run_and_check()
        .with_context(|| format!("Failed to bootstrap '{suite}' into '{}'", root.display()))
}
