//! Keeps every ESP of the mirror identical to the one in use and bootable on
//! its own.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::{debug, info, warn};

use mirroot_api::error::{MirrootError, MirrootResultExt, ReportError, SynchronizationError};
use osutils::{
    block_devices,
    chroot::ChrootEnvironment,
    efibootmgr,
    findmnt::{self, MountedFilesystem},
    files,
    grub_mkconfig::GrubInstall,
    lsblk::{self, BlockDevice, BlockDeviceType},
    mount, path, rsync, tree_digest, udevadm,
};

use crate::engine::{boot::esp, storage::identity};

/// One ESP of the mirror set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EspMember {
    /// Partition device.
    pub device: PathBuf,

    /// Bootloader folder name and firmware menu label of the drive.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub primary: EspMember,
    pub targets: Vec<EspMember>,
}

/// The host operations ESP synchronization needs.
pub trait MirrorHost {
    /// Root of the tree whose ESPs are synced, `/` on a running system.
    fn root(&self) -> &Path;

    /// The ESP mounted at `<root>/boot/efi`.
    fn primary(&self) -> Result<Option<MountedFilesystem>, Error>;

    /// Every ESP partition carrying the filesystem UUID `uuid`.
    fn members(&self, uuid: &str) -> Result<Vec<EspMember>, Error>;

    fn mount(&self, device: &Path, target: &Path) -> Result<(), Error>;
    fn unmount(&self, target: &Path) -> Result<(), Error>;

    fn mirror_tree(&self, source: &Path, destination: &Path, excludes: &[&Path])
        -> Result<(), Error>;
    fn digest(&self, root: &Path, excludes: &[&Path]) -> Result<String, Error>;

    /// Installs the bootloader into the ESP mounted at `efi_directory` under
    /// `label`, replacing any firmware entry with the same label.
    fn install_bootloader(&self, efi_directory: &Path, label: &str) -> Result<(), Error>;
}

/// Replicates the primary ESP to every other member of its mirror set, then
/// installs the bootloader to each member under that member's own label.
pub fn sync_esps(host: &dyn MirrorHost) -> Result<SyncReport, MirrootError> {
    let primary_mount = esp::primary_mount_point(host.root());
    let primary_fs = host
        .primary()
        .structured(SynchronizationError::DiscoverMembers)?
        .structured(SynchronizationError::NoPrimaryEsp {
            path: primary_mount.display().to_string(),
        })?;
    let uuid = primary_fs
        .uuid
        .as_deref()
        .structured(SynchronizationError::DiscoverMembers)
        .message(format!(
            "ESP at '{}' has no filesystem UUID",
            primary_mount.display()
        ))?;

    let members = host
        .members(uuid)
        .structured(SynchronizationError::DiscoverMembers)?;
    let (primary, targets): (Vec<EspMember>, Vec<EspMember>) = members
        .into_iter()
        .partition(|m| same_device(&m.device, Path::new(&primary_fs.source)));
    let primary = primary
        .into_iter()
        .next()
        .structured(SynchronizationError::DiscoverMembers)
        .message(format!(
            "Mounted ESP '{}' is not among the partitions with UUID {uuid}",
            primary_fs.source
        ))?;

    if targets.is_empty() {
        warn!("ESP mirror is degraded: '{}' has no peer", primary.device.display());
    }

    // Every member's own bootloader folder stays out of the copy.
    let folders: Vec<PathBuf> = std::iter::once(&primary)
        .chain(&targets)
        .map(|m| esp::bootloader_dir(&m.label))
        .collect();
    let excludes: Vec<&Path> = folders.iter().map(PathBuf::as_path).collect();

    for target in &targets {
        sync_member(host, &primary_mount, target, &excludes)?;
    }

    host.install_bootloader(&primary_mount, &primary.label)
        .structured(SynchronizationError::InstallBootloader {
            label: primary.label.clone(),
        })?;

    info!(
        "ESP mirror in sync: primary '{}', {} target(s)",
        primary.label,
        targets.len()
    );
    Ok(SyncReport { primary, targets })
}

fn sync_member(
    host: &dyn MirrorHost,
    primary_mount: &Path,
    target: &EspMember,
    excludes: &[&Path],
) -> Result<(), MirrootError> {
    let mount_point = esp::sync_mount_point(host.root(), &target.device);
    let target_name = target.device.display().to_string();
    host.mount(&target.device, &mount_point)
        .structured(SynchronizationError::SyncEsp {
            target: target_name.clone(),
        })?;

    let result = copy_and_verify(host, primary_mount, &mount_point, target, excludes);

    let unmounted = host
        .unmount(&mount_point)
        .structured(SynchronizationError::SyncEsp {
            target: target_name,
        });
    match (result, unmounted) {
        (Err(e), Err(secondary)) => Err(e.secondary_error_context(secondary)),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn copy_and_verify(
    host: &dyn MirrorHost,
    primary_mount: &Path,
    mount_point: &Path,
    target: &EspMember,
    excludes: &[&Path],
) -> Result<(), MirrootError> {
    let target_name = target.device.display().to_string();
    debug!("Copying ESP to '{target_name}'");
    host.mirror_tree(primary_mount, mount_point, excludes)
        .structured(SynchronizationError::SyncEsp {
            target: target_name.clone(),
        })?;

    let expected = host
        .digest(primary_mount, excludes)
        .structured(SynchronizationError::SyncEsp {
            target: target_name.clone(),
        })?;
    let actual = host
        .digest(mount_point, excludes)
        .structured(SynchronizationError::SyncEsp {
            target: target_name.clone(),
        })?;
    if expected != actual {
        return Err(MirrootError::new(SynchronizationError::EspDrift {
            target: target_name,
        }));
    }

    host.install_bootloader(mount_point, &target.label)
        .structured(SynchronizationError::InstallBootloader {
            label: target.label.clone(),
        })
}

fn same_device(a: &Path, b: &Path) -> bool {
    a == b
        || match (a.canonicalize(), b.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
}

/// Real tools on the running system, or on the tree at `root` when a chroot
/// is given, in which case the bootloader is installed from inside it.
pub struct SystemMirrorHost<'a> {
    root: PathBuf,
    chroot: Option<&'a ChrootEnvironment>,
}

impl SystemMirrorHost<'static> {
    pub fn running() -> Self {
        SystemMirrorHost {
            root: PathBuf::from("/"),
            chroot: None,
        }
    }
}

impl<'a> SystemMirrorHost<'a> {
    pub fn in_chroot(chroot: &'a ChrootEnvironment) -> Self {
        SystemMirrorHost {
            root: chroot.root().to_path_buf(),
            chroot: Some(chroot),
        }
    }
}

impl MirrorHost for SystemMirrorHost<'_> {
    fn root(&self) -> &Path {
        &self.root
    }

    fn primary(&self) -> Result<Option<MountedFilesystem>, Error> {
        findmnt::mounted_at(esp::primary_mount_point(&self.root))
    }

    fn members(&self, uuid: &str) -> Result<Vec<EspMember>, Error> {
        // Freshly formatted partitions are only visible once udev caught up.
        if let Err(e) = udevadm::settle() {
            warn!("{e:?}");
        }
        let devices = lsblk::run(None)?;
        let mut members = Vec::new();
        for partition in esp_partitions(&devices, uuid) {
            let disk = partition
                .parent_kernel_name
                .clone()
                .with_context(|| format!("No disk for '{}'", partition.name.display()))?;
            let stable = block_devices::stable_disk_path(&disk)?.unwrap_or(disk);
            let label = identity::drive_label(&stable)
                .unstructured(format!("Failed to label '{}'", stable.display()))?;
            members.push(EspMember {
                device: partition.name.clone(),
                label,
            });
        }
        Ok(members)
    }

    fn mount(&self, device: &Path, target: &Path) -> Result<(), Error> {
        files::create_dirs(target)?;
        mount::mount(device, target, Some("vfat"), &[])
    }

    fn unmount(&self, target: &Path) -> Result<(), Error> {
        mount::umount(target, false)
    }

    fn mirror_tree(
        &self,
        source: &Path,
        destination: &Path,
        excludes: &[&Path],
    ) -> Result<(), Error> {
        rsync::mirror_tree(source, destination, excludes)
    }

    fn digest(&self, root: &Path, excludes: &[&Path]) -> Result<String, Error> {
        tree_digest::digest(root, excludes)
    }

    fn install_bootloader(&self, efi_directory: &Path, label: &str) -> Result<(), Error> {
        let removed = efibootmgr::list_and_parse_bootmgr_entries()?
            .delete_entries_with_label(label)?;
        debug!("Removed {removed} stale boot entries labelled '{label}'");

        match self.chroot {
            None => GrubInstall {
                efi_directory: efi_directory.to_path_buf(),
                bootloader_id: label.into(),
            }
            .run(),
            Some(chroot) => {
                let inner = path::within_root(chroot.root(), efi_directory).with_context(|| {
                    format!(
                        "'{}' is outside of '{}'",
                        efi_directory.display(),
                        chroot.root().display()
                    )
                })?;
                let install = GrubInstall {
                    efi_directory: inner,
                    bootloader_id: label.into(),
                };
                chroot
                    .run("grub-install", install.args())
                    .unstructured(format!("Failed to install GRUB as '{label}'"))
            }
        }
    }
}

/// Partitions of `devices` (searched recursively) formatted FAT with
/// filesystem UUID `uuid`.
fn esp_partitions<'d>(devices: &'d [BlockDevice], uuid: &str) -> Vec<&'d BlockDevice> {
    let mut found = Vec::new();
    for device in devices {
        let is_member = device.device_type == BlockDeviceType::Part
            && device.fstype.as_deref() == Some("vfat")
            && device
                .uuid
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(uuid));
        if is_member {
            found.push(device);
        }
        found.extend(esp_partitions(&device.children, uuid));
    }
    found
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    use std::{cell::RefCell, collections::HashSet};

    use anyhow::bail;

    /// Records every operation. Digests are the same everywhere unless a
    /// mount point is listed in `drifted`.
    pub struct FakeMirrorHost {
        pub root: tempfile::TempDir,
        pub primary: Option<MountedFilesystem>,
        pub members: Vec<EspMember>,
        pub drifted: HashSet<PathBuf>,
        pub failing_install: HashSet<String>,
        pub calls: RefCell<Vec<String>>,
    }

    impl FakeMirrorHost {
        pub fn new(members: &[(&str, &str)]) -> Self {
            let root = tempfile::tempdir().unwrap();
            let primary = members.first().map(|(device, _)| MountedFilesystem {
                target: esp::primary_mount_point(root.path()),
                source: device.to_string(),
                fstype: "vfat".into(),
                uuid: Some("84A0-088E".into()),
            });
            FakeMirrorHost {
                root,
                primary,
                members: members
                    .iter()
                    .map(|(device, label)| EspMember {
                        device: device.into(),
                        label: label.to_string(),
                    })
                    .collect(),
                drifted: HashSet::new(),
                failing_install: HashSet::new(),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn call(&self, call: String) {
            self.calls.borrow_mut().push(call);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        /// `path` relative to the fake root, for readable assertions.
        pub fn rel(&self, path: &Path) -> String {
            path::within_root(self.root.path(), path)
                .unwrap_or_else(|| path.to_path_buf())
                .display()
                .to_string()
        }
    }

    impl MirrorHost for FakeMirrorHost {
        fn root(&self) -> &Path {
            self.root.path()
        }

        fn primary(&self) -> Result<Option<MountedFilesystem>, Error> {
            Ok(self.primary.clone())
        }

        fn members(&self, _uuid: &str) -> Result<Vec<EspMember>, Error> {
            Ok(self.members.clone())
        }

        fn mount(&self, device: &Path, target: &Path) -> Result<(), Error> {
            self.call(format!("mount {} {}", device.display(), self.rel(target)));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> Result<(), Error> {
            self.call(format!("unmount {}", self.rel(target)));
            Ok(())
        }

        fn mirror_tree(
            &self,
            source: &Path,
            destination: &Path,
            excludes: &[&Path],
        ) -> Result<(), Error> {
            self.call(format!(
                "copy {} {} excluding {}",
                self.rel(source),
                self.rel(destination),
                excludes
                    .iter()
                    .map(|e| e.display().to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ));
            Ok(())
        }

        fn digest(&self, root: &Path, _excludes: &[&Path]) -> Result<String, Error> {
            Ok(if self.drifted.contains(root) {
                "drifted".into()
            } else {
                "same".into()
            })
        }

        fn install_bootloader(&self, efi_directory: &Path, label: &str) -> Result<(), Error> {
            self.call(format!("grub-install {} {label}", self.rel(efi_directory)));
            if self.failing_install.contains(label) {
                bail!("grub-install failed");
            }
            Ok(())
        }
    }
}
