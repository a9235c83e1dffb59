pub mod block_devices;
pub mod chroot;
pub mod debootstrap;
pub mod dependencies;
pub mod efibootmgr;
pub mod files;
pub mod findmnt;
pub mod grub;
pub mod grub_mkconfig;
pub mod lsblk;
pub mod mkfs;
pub mod mkswap;
pub mod mount;
pub mod partition_types;
pub mod path;
pub mod rsync;
pub mod sfdisk;
pub mod systemd;
pub mod tree_digest;
pub mod udevadm;
pub mod wipefs;
pub mod zfs;
pub mod zpool;
