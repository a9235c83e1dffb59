use std::path::Path;

use anyhow::{ensure, Context, Error};

use crate::dependencies::Dependency;

/// Formats `device_path` as FAT32 with a fixed volume label and volume id.
/// `volume_id` is 8 hexadecimal digits.
pub fn vfat(device_path: &Path, label: &str, volume_id: &str) -> Result<(), Error> {
    ensure!(
        volume_id.len() == 8 && volume_id.chars().all(|c| c.is_ascii_hexdigit()),
        "Invalid FAT volume id '{volume_id}'"
    );
    Dependency::MkfsVfat
        .cmd()
        .arg("-F")
        .arg("32")
        .arg("-n")
        .arg(label)
        .arg("-i")
        .arg(volume_id)
        .arg(device_path)
        .run_and_check()
        .with_context(|| format!("Failed to format '{}' as FAT32", device_path.display()))
}

/// The volume id as `blkid` and `/dev/disk/by-uuid` show it, e.g. `84A0-088E`.
pub fn vfat_uuid(volume_id: &str) -> String {
    let upper = volume_id.to_ascii_uppercase();
    match (upper.get(..4), upper.get(4..)) {
        (Some(high), Some(low)) if !low.is_empty() => format!("{high}-{low}"),
        _ => upper,
    }
}
