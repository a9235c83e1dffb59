use std::{path::Path, thread, time::Duration};

use anyhow::{bail, Context, Error};
use log::debug;

use crate::dependencies::Dependency;

pub fn settle() -> Result<(), Error> {
    Dependency::Udevadm
        .cmd()
        .arg("settle")
        .run_and_check()
        .context("Failed to settle udev")
}

pub fn trigger() -> Result<(), Error> {
    Dependency::Udevadm
        .cmd()
        .arg("trigger")
        .run_and_check()
        .context("Failed to trigger udev")
}

/// Waits for every path in `nodes` to appear, settling udev before each
/// check. Gives up after `attempts` rounds spaced `delay` apart.
pub fn wait_for_nodes<P: AsRef<Path>>(
    nodes: &[P],
    attempts: usize,
    delay: Duration,
) -> Result<(), Error> {
    for attempt in 1..=attempts {
        settle()?;
        let missing: Vec<&Path> = nodes
            .iter()
            .map(AsRef::as_ref)
            .filter(|node| !node.exists())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        debug!(
            "Waiting for device nodes ({attempt}/{attempts}): {}",
            missing
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        thread::sleep(delay);
    }

    bail!(
        "Device nodes did not appear after {attempts} attempts: {}",
        nodes
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )
}
