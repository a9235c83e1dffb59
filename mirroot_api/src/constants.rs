use const_format::formatcp;

/// Directory holding every session log and session record.
pub const MIRROOT_LOG_DIR: &str = "/var/log/mirroot";

/// Configuration file picked up by `install` when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mirroot/install.yaml";

/// Where the new root is assembled during installation. Passed to
/// `zpool create -R` so every dataset mounts below it.
pub const TARGET_ROOT_PATH: &str = "/mnt/mirroot";

pub const DEFAULT_POOL_NAME: &str = "rpool";
pub const DEFAULT_ROOT_DATASET: &str = "ubuntu";

pub const ESP_MOUNT_POINT_PATH: &str = "/boot/efi";
pub const ESP_EFI_DIRECTORY: &str = "EFI";
pub const ESP_VOLUME_NAME: &str = "EFI";

/// Stable device links used for drive identity.
pub const DISK_BY_ID_DIR: &str = "/dev/disk/by-id";

/// Longest label most firmware boot menus display in full.
pub const MAX_DRIVE_LABEL_LEN: usize = 20;

pub const MIRROOT_CONFIG_DIR: &str = "/etc/mirroot";
pub const FIRSTBOOT_TICKET_PATH: &str = formatcp!("{MIRROOT_CONFIG_DIR}/firstboot.ticket");
pub const FIRSTBOOT_ENTRY_ID: &str = "mirroot-firstboot";
pub const FIRSTBOOT_UNIT_NAME: &str = "mirroot-firstboot.service";
pub const FIRSTBOOT_WANTED_BY: &str = "multi-user.target";
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";
pub const FIRSTBOOT_WANTS_LINK_PATH: &str =
    formatcp!("{SYSTEMD_UNIT_DIR}/{FIRSTBOOT_WANTED_BY}.wants/{FIRSTBOOT_UNIT_NAME}");

pub const GRUB_SCRIPT_DIR: &str = "/etc/grub.d";
pub const FIRSTBOOT_GRUB_SCRIPT_PATH: &str = formatcp!("{GRUB_SCRIPT_DIR}/09_mirroot_firstboot");
pub const FIRSTBOOT_GRUB_DEFAULTS_NAME: &str = "99-mirroot-firstboot";
pub const GRUB_DEFAULTS_PATH: &str = "/etc/default/grub";
pub const GRUB_CFG_PATH: &str = "/boot/grub/grub.cfg";

/// Kernel parameter that makes the initramfs import the pool even when it was
/// last owned by another host.
pub const FORCE_IMPORT_PARAM: &str = "zfs_force";

pub const MIRROOT_BINARY_INSTALL_PATH: &str = "/usr/local/sbin/mirroot";
pub const KERNEL_POSTINST_HOOK_PATH: &str = "/etc/kernel/postinst.d/zz-mirroot-sync-esp";
pub const RECOVERY_DOCUMENT_PATH: &str = "/root/mirroot-recovery.md";

/// Scratch directory used by the first-boot write probe.
pub const WRITE_PROBE_DIR: &str = "/var/lib/mirroot";

/// Delay before the single post-revert reboot, leaving time to flush logs.
pub const REBOOT_DELAY: &str = "15s";
