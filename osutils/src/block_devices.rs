use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};

/// Directory of stable, serial-derived disk symlinks.
pub const DISK_BY_ID_DIR: &str = "/dev/disk/by-id";

/// Prefixes of by-id links that carry no model or serial, such as WWN or
/// EUI identifiers.
const OPAQUE_ID_PREFIXES: &[&str] = &["wwn-", "nvme-eui.", "nvme-nvme.", "dm-", "md-", "lvm-"];

/// Returns the most descriptive symlink in `/dev/disk/by-id` pointing at the
/// whole disk `disk`, or `None` when the disk has no model/serial link (for
/// example a virtual disk).
pub fn stable_disk_path(disk: impl AsRef<Path>) -> Result<Option<PathBuf>, Error> {
    stable_disk_path_in(disk, DISK_BY_ID_DIR)
}

fn stable_disk_path_in(
    disk: impl AsRef<Path>,
    directory: impl AsRef<Path>,
) -> Result<Option<PathBuf>, Error> {
    if !directory.as_ref().exists() {
        return Ok(None);
    }
    let target = disk.as_ref().canonicalize().with_context(|| {
        format!(
            "Failed to canonicalize disk path '{}'",
            disk.as_ref().display()
        )
    })?;

    let mut links = symlinks_for_target(&target, directory.as_ref())?
        .into_iter()
        .filter(|link| {
            link.file_name()
                .map(|name| {
                    let name = name.to_string_lossy();
                    !name.contains("-part")
                        && !OPAQUE_ID_PREFIXES
                            .iter()
                            .any(|prefix| name.starts_with(prefix))
                })
                .unwrap_or_default()
        })
        .collect::<Vec<_>>();
    links.sort();

    Ok(links.into_iter().next())
}

/// Returns every symlink in `directory` whose canonical path is `target`.
pub fn symlinks_for_target(
    target: impl AsRef<Path>,
    directory: impl AsRef<Path>,
) -> Result<Vec<PathBuf>, Error> {
    Ok(fs::read_dir(directory.as_ref())
        .with_context(|| format!("Failed to list '{}'", directory.as_ref().display()))?
        .flatten()
        .filter(|f| {
            f.file_type()
                .ok()
                .map(|t| t.is_symlink())
                .unwrap_or_default()
        })
        .map(|entry| entry.path())
        .filter(|path| {
            path.canonicalize()
                .map(|p| p == target.as_ref())
                .unwrap_or_default()
        })
        .collect())
}

/// Path of partition number `number` on `disk`, following the kernel's and
/// udev's naming rules.
pub fn partition_path(disk: impl AsRef<Path>, number: usize) -> PathBuf {
    let disk = disk.as_ref().to_string_lossy();
    if disk.starts_with(DISK_BY_ID_DIR) || disk.starts_with("/dev/disk/by-path") {
        PathBuf::from(format!("{disk}-part{number}"))
    } else if disk.ends_with(|c: char| c.is_ascii_digit()) {
        // nvme0n1, mmcblk0, loop0
        PathBuf::from(format!("{disk}p{number}"))
    } else {
        PathBuf::from(format!("{disk}{number}"))
    }
}
