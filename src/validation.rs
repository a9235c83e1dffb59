//! Preflight checks run before anything is written to a drive.

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info};

use mirroot_api::error::{
    ExecutionEnvironmentError, MirrootError, PreconditionError, ReportError,
};
use osutils::dependencies::{Dependency, DependencyError, DependencyResultExt};

const EFI_FIRMWARE_DIR: &str = "/sys/firmware/efi";

pub fn check_root() -> Result<(), MirrootError> {
    if !nix::unistd::geteuid().is_root() {
        return Err(MirrootError::new(
            ExecutionEnvironmentError::MissingRequiredPermissions,
        ));
    }
    Ok(())
}

/// Boot entries can only be registered when the installer itself booted
/// through UEFI.
pub fn check_uefi() -> Result<(), MirrootError> {
    if !Path::new(EFI_FIRMWARE_DIR).is_dir() {
        return Err(MirrootError::new(ExecutionEnvironmentError::NotUefi));
    }
    Ok(())
}

pub fn check_dependencies(dependencies: &[Dependency]) -> Result<(), MirrootError> {
    locate_dependencies(dependencies, Dependency::path)
}

fn locate_dependencies(
    dependencies: &[Dependency],
    locate: impl Fn(&Dependency) -> Result<PathBuf, Box<DependencyError>>,
) -> Result<(), MirrootError> {
    for dependency in dependencies {
        let path = locate(dependency).message(format!("'{dependency}' is required"))?;
        debug!("Found '{dependency}' at '{}'", path.display());
    }
    Ok(())
}

/// Everything `install` needs from the host.
pub fn check_install_environment() -> Result<(), MirrootError> {
    check_root()?;
    check_uefi()?;
    check_dependencies(Dependency::INSTALL)
}

/// Whether an operator's answer matches the word they were asked to type.
pub fn confirmation_matches(answer: &str, expected: &str) -> bool {
    answer.trim() == expected
}

/// Shows `summary` and asks the operator to type `expected` to go ahead.
/// `assume_yes` skips the prompt.
pub fn confirm_destruction(
    summary: &[String],
    expected: &str,
    assume_yes: bool,
) -> Result<(), MirrootError> {
    for line in summary {
        info!("{line}");
    }
    if assume_yes {
        info!("Confirmation skipped");
        return Ok(());
    }

    let answer: String = dialoguer::Input::new()
        .with_prompt(format!(
            "All data on these drives will be destroyed. Type '{expected}' to continue"
        ))
        .allow_empty(true)
        .interact_text()
        .context("Failed to read confirmation")
        .structured(PreconditionError::ConfirmationDeclined)?;

    if !confirmation_matches(&answer, expected) {
        return Err(MirrootError::new(PreconditionError::ConfirmationDeclined));
    }
    Ok(())
}

/// Asks a yes/no question, answering `default` when there is no terminal.
pub fn ask_yes_no(prompt: &str, default: bool) -> bool {
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .wait_for_newline(true)
        .interact()
        .unwrap_or(default)
}
