use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

pub fn run(device_path: &Path, label: &str) -> Result<(), Error> {
    Dependency::Mkswap
        .cmd()
        .arg("--force")
        .arg("--label")
        .arg(label)
        .arg(device_path)
        .run_and_check()
        .with_context(|| format!("Failed to create swap on '{}'", device_path.display()))
}

/// Disables swap on `device_path`. A device that is not in use as swap is not
/// an error.
pub fn swapoff(device_path: &Path) -> Result<(), Error> {
    let output = Dependency::Swapoff
        .cmd()
        .arg(device_path)
        .output()
        .with_context(|| format!("Failed to run swapoff on '{}'", device_path.display()))?;
    if !output.success() && !output.error_output().contains("Invalid argument") {
        output
            .check()
            .with_context(|| format!("Failed to disable swap on '{}'", device_path.display()))?;
    }
    Ok(())
}
