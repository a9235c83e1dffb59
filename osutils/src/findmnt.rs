//! Typed queries of `findmnt --json`.
//!
//! `findmnt` reads `/proc/self/mountinfo` and can print it as JSON, which is
//! easier to rely on than parsing the mount table by hand. Only the columns in
//! `FINDMNT_COLUMNS` are requested.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::Deserialize;

use crate::dependencies::Dependency;

const FINDMNT_COLUMNS: &str = "TARGET,SOURCE,FSTYPE,UUID";

#[derive(Debug, Deserialize)]
struct FindMnt {
    filesystems: Vec<MountedFilesystem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MountedFilesystem {
    pub target: PathBuf,

    /// Block device, or dataset name for ZFS.
    pub source: String,

    pub fstype: String,

    /// Filesystem UUID; the volume id for FAT.
    pub uuid: Option<String>,
}

/// The filesystem mounted exactly at `mount_point`, if any.
pub fn mounted_at(mount_point: impl AsRef<Path>) -> Result<Option<MountedFilesystem>, Error> {
    let output = Dependency::Findmnt
        .cmd()
        .arg("--json")
        .arg("--output")
        .arg(FINDMNT_COLUMNS)
        .arg("--mountpoint")
        .arg(mount_point.as_ref())
        .output()
        .context("Failed to run findmnt")?;

    // Exit status 1 with no output means nothing is mounted there.
    if !output.success() && output.output().trim().is_empty() {
        return Ok(None);
    }
    let json = output.check_output().with_context(|| {
        format!(
            "Failed to query mounts at '{}'",
            mount_point.as_ref().display()
        )
    })?;

    Ok(parse(&json)?.into_iter().last())
}

fn parse(json: &str) -> Result<Vec<MountedFilesystem>, Error> {
    Ok(serde_json::from_str::<FindMnt>(json)
        .context("Failed to parse findmnt output")?
        .filesystems)
}
