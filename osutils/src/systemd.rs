use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Enables `unit` in the tree rooted at `root` without talking to a running
/// systemd.
pub fn enable_offline(root: &Path, unit: &str) -> Result<(), Error> {
    Dependency::Systemctl
        .cmd()
        .arg("--root")
        .arg(root)
        .arg("enable")
        .arg(unit)
        .run_and_check()
        .with_context(|| format!("Failed to enable '{unit}' in '{}'", root.display()))
}

/// Disables `unit` on the running system.
pub fn disable(unit: &str) -> Result<(), Error> {
    Dependency::Systemctl
        .cmd()
        .arg("disable")
        .arg(unit)
        .run_and_check()
        .with_context(|| format!("Failed to disable '{unit}'"))
}

/// Schedules `systemctl reboot` after `delay` (a systemd time span such as
/// `15s`) in a transient timer unit, so the caller can exit cleanly first.
pub fn schedule_reboot(delay: &str) -> Result<(), Error> {
    Dependency::SystemdRun
        .cmd()
        .arg(format!("--on-active={delay}"))
        .arg("--timer-property=AccuracySec=1s")
        .arg("systemctl")
        .arg("reboot")
        .run_and_check()
        .with_context(|| format!("Failed to schedule a reboot in {delay}"))
}
