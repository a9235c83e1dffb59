use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use mirroot_api::constants::{ESP_EFI_DIRECTORY, ESP_MOUNT_POINT_PATH};
use osutils::{mkfs, path};

/// Runtime directory below which sync targets are mounted.
pub const ESP_SYNC_MOUNT_DIR: &str = "/run/mirroot/esp";

/// FAT volume id shared by every ESP of a host: the first 32 bits of
/// `SHA-256("mirroot-esp:" + hostname)` as 8 lowercase hex digits.
pub fn volume_id(hostname: &str) -> String {
    let digest = Sha256::digest(format!("mirroot-esp:{hostname}").as_bytes());
    hex::encode(&digest[..4])
}

/// The volume id as `/dev/disk/by-uuid` and `findmnt` show it.
pub fn volume_uuid(hostname: &str) -> String {
    mkfs::vfat_uuid(&volume_id(hostname))
}

/// Turns a `XXXX-XXXX` filesystem UUID back into the id `mkfs.vfat -i`
/// takes.
pub fn volume_id_from_uuid(uuid: &str) -> Option<String> {
    let id: String = uuid.chars().filter(|c| *c != '-').collect();
    (id.len() == 8 && id.chars().all(|c| c.is_ascii_hexdigit())).then(|| id.to_ascii_lowercase())
}

/// Where the primary ESP is mounted in the tree at `root`.
pub fn primary_mount_point(root: &Path) -> PathBuf {
    path::join_relative(root, ESP_MOUNT_POINT_PATH)
}

/// Where a sync target on `device` is mounted in the tree at `root`.
pub fn sync_mount_point(root: &Path, device: &Path) -> PathBuf {
    let name = device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "esp".into());
    path::join_relative(root, Path::new(ESP_SYNC_MOUNT_DIR).join(name))
}

/// The bootloader folder of the drive labelled `label`, relative to the ESP
/// root.
pub fn bootloader_dir(label: &str) -> PathBuf {
    Path::new(ESP_EFI_DIRECTORY).join(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_id_deterministic() {
        let id = volume_id("web-01");
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, volume_id("web-01"));
        assert_ne!(id, volume_id("web-02"));
        assert_eq!(volume_uuid("web-01"), mkfs::vfat_uuid(&id));
    }

    #[test]
    fn test_volume_id_from_uuid() {
        assert_eq!(volume_id_from_uuid("84A0-088E").as_deref(), Some("84a0088e"));
        assert_eq!(volume_id_from_uuid(&volume_uuid("h")), Some(volume_id("h")));
        assert_eq!(volume_id_from_uuid("5c3b2a3f-2c5e-4a2e"), None);
    }

    #[test]
    fn test_mount_points() {
        assert_eq!(
            primary_mount_point(Path::new("/mnt/mirroot")),
            Path::new("/mnt/mirroot/boot/efi")
        );
        assert_eq!(
            sync_mount_point(
                Path::new("/"),
                Path::new("/dev/disk/by-id/nvme-Samsung_SSD_970_S4EWNX0R123456-part1")
            ),
            Path::new("/run/mirroot/esp/nvme-Samsung_SSD_970_S4EWNX0R123456-part1")
        );
        assert_eq!(bootloader_dir("Samsung-SSD-970-3456"), Path::new("EFI/Samsung-SSD-970-3456"));
    }
}
