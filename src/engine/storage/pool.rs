use std::path::{Path, PathBuf};

use anyhow::Error;
use log::{debug, info};

use mirroot_api::{
    config::StorageConfiguration,
    error::{DestructiveError, MirrootError, ReportError},
};
use osutils::{
    zfs,
    zpool::{self, PoolCreate, PoolStatus},
};

use super::{
    inspect::DriveSpec,
    ladder::{Ladder, LadderOutcome},
};

/// Read-only queries about pools and datasets.
pub trait PoolInspector {
    /// Names of every imported pool.
    fn pools(&self) -> Result<Vec<String>, Error>;

    /// Whether `pool` is imported.
    fn exists(&self, pool: &str) -> Result<bool, Error>;

    fn status(&self, pool: &str) -> Result<Option<PoolStatus>, Error>;

    /// Every dataset of `pool`, parents before children.
    fn datasets(&self, pool: &str) -> Result<Vec<String>, Error>;
}

/// Pool and dataset mutations.
pub trait PoolOperator: PoolInspector {
    /// Returns whether a label was found and cleared.
    fn clear_label(&self, device: &Path) -> Result<bool, Error>;
    fn create(&self, request: &PoolCreate) -> Result<(), Error>;
    fn set_property(&self, pool: &str, property: &str, value: &str) -> Result<(), Error>;
    fn create_dataset(&self, dataset: &str, properties: &[(&str, &str)]) -> Result<(), Error>;
    fn mount_dataset(&self, dataset: &str) -> Result<(), Error>;
    fn unmount_dataset(&self, dataset: &str) -> Result<(), Error>;
    fn destroy_dataset(&self, dataset: &str) -> Result<(), Error>;
    fn destroy(&self, pool: &str, force: bool) -> Result<(), Error>;
    fn export(&self, pool: &str, force: bool) -> Result<(), Error>;
    fn import(&self, pool: &str, force: bool) -> Result<(), Error>;
    fn replace(&self, pool: &str, old: &str, new: &Path) -> Result<(), Error>;
}

/// `zpool` and `zfs` on the host.
#[derive(Debug, Default)]
pub struct ZfsTools;

impl PoolInspector for ZfsTools {
    fn pools(&self) -> Result<Vec<String>, Error> {
        zpool::list()
    }

    fn exists(&self, pool: &str) -> Result<bool, Error> {
        zpool::exists(pool)
    }

    fn status(&self, pool: &str) -> Result<Option<PoolStatus>, Error> {
        zpool::status(pool)
    }

    fn datasets(&self, pool: &str) -> Result<Vec<String>, Error> {
        zfs::list_recursive(pool)
    }
}

impl PoolOperator for ZfsTools {
    fn clear_label(&self, device: &Path) -> Result<bool, Error> {
        zpool::labelclear(device)
    }

    fn create(&self, request: &PoolCreate) -> Result<(), Error> {
        request.run()
    }

    fn set_property(&self, pool: &str, property: &str, value: &str) -> Result<(), Error> {
        zpool::set_property(pool, property, value)
    }

    fn create_dataset(&self, dataset: &str, properties: &[(&str, &str)]) -> Result<(), Error> {
        zfs::create(dataset, properties)
    }

    fn mount_dataset(&self, dataset: &str) -> Result<(), Error> {
        if !zfs::is_mounted(dataset)? {
            zfs::mount(dataset)?;
        }
        Ok(())
    }

    fn unmount_dataset(&self, dataset: &str) -> Result<(), Error> {
        if zfs::is_mounted(dataset)? {
            zfs::unmount(dataset, true)?;
        }
        Ok(())
    }

    fn destroy_dataset(&self, dataset: &str) -> Result<(), Error> {
        zfs::destroy(dataset)
    }

    fn destroy(&self, pool: &str, force: bool) -> Result<(), Error> {
        zpool::destroy(pool, force)
    }

    fn export(&self, pool: &str, force: bool) -> Result<(), Error> {
        zpool::export(pool, force)
    }

    fn import(&self, pool: &str, force: bool) -> Result<(), Error> {
        zpool::import(pool, force, None, None)
    }

    fn replace(&self, pool: &str, old: &str, new: &Path) -> Result<(), Error> {
        zpool::replace(pool, old, new)
    }
}

/// Pool features chosen from the drives' media class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityProfile {
    pub ashift: u8,
    pub autotrim: bool,
}

impl CapabilityProfile {
    /// 4 KiB alignment always; trim only when neither drive spins.
    pub fn for_drives(a: &DriveSpec, b: &DriveSpec) -> Self {
        Self {
            ashift: 12,
            autotrim: !a.rotational && !b.rotational,
        }
    }
}

/// A two-way mirror pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    pub members: [PathBuf; 2],
    pub profile: CapabilityProfile,
}

impl PoolSpec {
    /// The `zpool create` call for this pool. The property set is what the
    /// initramfs and GRUB rely on when importing the pool.
    pub fn create_request(&self, altroot: &Path) -> PoolCreate {
        let owned = |pairs: &[(&str, &str)]| -> Vec<(String, String)> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        let ashift = self.profile.ashift.to_string();
        let autotrim = if self.profile.autotrim { "on" } else { "off" };

        PoolCreate {
            name: self.name.clone(),
            pool_properties: owned(&[
                ("ashift", ashift.as_str()),
                ("autotrim", autotrim),
                ("cachefile", "none"),
                ("compatibility", "grub2"),
            ]),
            filesystem_properties: owned(&[
                ("acltype", "posixacl"),
                ("xattr", "sa"),
                ("compression", "lz4"),
                ("normalization", "formD"),
                ("relatime", "on"),
                ("canmount", "off"),
                ("mountpoint", "/"),
            ]),
            altroot: Some(altroot.to_path_buf()),
            mirror: self.members.to_vec(),
        }
    }
}

/// Creates the pool on partitions that already match the plan.
pub fn provision(
    ops: &dyn PoolOperator,
    spec: &PoolSpec,
    altroot: &Path,
) -> Result<(), MirrootError> {
    for member in &spec.members {
        if ops
            .clear_label(member)
            .structured(DestructiveError::ClearPoolLabels)?
        {
            info!("Cleared stale pool label on '{}'", member.display());
        }
    }

    info!(
        "Creating pool '{}' (ashift={}, autotrim={})",
        spec.name, spec.profile.ashift, spec.profile.autotrim
    );
    ops.create(&spec.create_request(altroot))
        .structured(DestructiveError::CreatePool {
            pool: spec.name.clone(),
        })?;

    // `zpool create` has been seen to exit 0 without leaving a usable pool.
    if !ops
        .exists(&spec.name)
        .structured(DestructiveError::CreatePool {
            pool: spec.name.clone(),
        })?
    {
        return Err(MirrootError::new(DestructiveError::PoolNotPresent {
            pool: spec.name.clone(),
        }));
    }

    ops.set_property(&spec.name, "cachefile", "none")
        .structured(DestructiveError::SetPoolProperty {
            pool: spec.name.clone(),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    pub name: String,
    pub properties: Vec<(String, String)>,

    /// Root datasets are `canmount=noauto` and must be mounted by hand.
    pub mount: bool,
}

impl DatasetSpec {
    fn new(name: String, properties: &[(&str, &str)]) -> Self {
        Self {
            name,
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            mount: false,
        }
    }
}

/// Datasets of a new pool in creation order.
pub fn dataset_layout(storage: &StorageConfiguration) -> Vec<DatasetSpec> {
    let pool = &storage.pool_name;
    let mut layout = vec![
        DatasetSpec::new(
            format!("{pool}/ROOT"),
            &[("canmount", "off"), ("mountpoint", "none")],
        ),
        DatasetSpec {
            mount: true,
            ..DatasetSpec::new(
                storage.root_dataset_name(),
                &[("canmount", "noauto"), ("mountpoint", "/")],
            )
        },
        DatasetSpec::new(format!("{pool}/home"), &[]),
        DatasetSpec::new(format!("{pool}/var"), &[("canmount", "off")]),
        DatasetSpec::new(format!("{pool}/var/log"), &[]),
    ];
    layout.extend(storage.extra_datasets.iter().map(|extra| {
        DatasetSpec::new(
            format!("{pool}/{}", extra.name),
            &[("mountpoint", extra.mount_point.display().to_string().as_str())],
        )
    }));
    layout
}

/// Creates every dataset of `layout` that does not exist yet.
pub fn create_datasets(
    ops: &dyn PoolOperator,
    pool: &str,
    layout: &[DatasetSpec],
) -> Result<(), MirrootError> {
    let existing = ops
        .datasets(pool)
        .structured(DestructiveError::CreateDataset {
            dataset: pool.to_string(),
        })?;

    for dataset in layout {
        if existing.contains(&dataset.name) {
            debug!("Dataset '{}' already exists", dataset.name);
        } else {
            let properties: Vec<(&str, &str)> = dataset
                .properties
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            ops.create_dataset(&dataset.name, &properties)
                .structured(DestructiveError::CreateDataset {
                    dataset: dataset.name.clone(),
                })?;
            info!("Created dataset '{}'", dataset.name);
        }
        if dataset.mount {
            ops.mount_dataset(&dataset.name)
                .structured(DestructiveError::CreateDataset {
                    dataset: dataset.name.clone(),
                })?;
        }
    }
    Ok(())
}

/// Removes `pool` from the system. Succeeds without doing anything when the
/// pool is not imported, so calling it twice is harmless.
pub fn destroy(ops: &dyn PoolOperator, pool: &str) -> Result<LadderOutcome, MirrootError> {
    Ladder::new(format!("Destroying pool '{pool}'"))
        .strategy("destroy datasets bottom-up", || destroy_children(ops, pool))
        .strategy("destroy", || ops.destroy(pool, false))
        .strategy("export", || ops.export(pool, false))
        .strategy("force import and destroy", || {
            if let Err(e) = ops.export(pool, true) {
                debug!("Forced export of '{pool}' failed: {e:?}");
            }
            ops.import(pool, true)?;
            ops.destroy(pool, true)
        })
        .run(|| Ok(!ops.exists(pool)?))
        .structured(DestructiveError::DestroyPool {
            pool: pool.to_string(),
        })
}

fn destroy_children(ops: &dyn PoolOperator, pool: &str) -> Result<(), Error> {
    let datasets = ops.datasets(pool)?;
    for dataset in datasets.iter().rev().filter(|d| d.as_str() != pool) {
        ops.unmount_dataset(dataset)?;
        ops.destroy_dataset(dataset)?;
    }
    Ok(())
}

/// Exports `pool`, unmounting its datasets. Used when a session hands the
/// pool back, so it is never destroyed here.
pub fn export(ops: &dyn PoolOperator, pool: &str) -> Result<LadderOutcome, MirrootError> {
    Ladder::new(format!("Exporting pool '{pool}'"))
        .strategy("export", || ops.export(pool, false))
        .strategy("forced export", || ops.export(pool, true))
        .run(|| Ok(!ops.exists(pool)?))
        .structured(DestructiveError::ExportPool {
            pool: pool.to_string(),
        })
}


#[cfg(test)]
mod tests {
    use super::{test_utils::FakePools, *};

    use std::ffi::OsString;

    use mirroot_api::{
        config::ExtraDataset,
        error::ErrorKind,
        primitives::bytes::{ByteCount, GIB},
    };

    fn drive(rotational: bool) -> DriveSpec {
        DriveSpec {
            path: "/dev/sda".into(),
            node: "/dev/sda".into(),
            label: "Disk-sda".into(),
            size: ByteCount(500 * GIB),
            rotational,
        }
    }

    fn spec() -> PoolSpec {
        PoolSpec {
            name: "rpool".into(),
            members: ["/dev/sda3".into(), "/dev/sdb3".into()],
            profile: CapabilityProfile::for_drives(&drive(false), &drive(false)),
        }
    }

    #[test]
    fn test_capability_profile() {
        assert!(CapabilityProfile::for_drives(&drive(false), &drive(false)).autotrim);
        assert!(!CapabilityProfile::for_drives(&drive(false), &drive(true)).autotrim);
        assert!(!CapabilityProfile::for_drives(&drive(true), &drive(true)).autotrim);
        assert_eq!(
            CapabilityProfile::for_drives(&drive(true), &drive(true)).ashift,
            12
        );
    }

    #[test]
    fn test_create_request() {
        let args = spec().create_request(Path::new("/mnt/mirroot")).args();
        let args: Vec<String> = args
            .iter()
            .map(|a: &OsString| a.to_string_lossy().into_owned())
            .collect();
        let joined = args.join(" ");
        assert!(joined.starts_with("create -f -o ashift=12 -o autotrim=on -o cachefile=none -o compatibility=grub2"));
        assert!(joined.contains("-O normalization=formD"));
        assert!(joined.contains("-O canmount=off -O mountpoint=/"));
        assert!(joined.ends_with("-R /mnt/mirroot rpool mirror /dev/sda3 /dev/sdb3"));
    }

    #[test]
    fn test_provision() {
        let pools = FakePools::default();
        pools.labelled.borrow_mut().insert("/dev/sdb3".into());

        provision(&pools, &spec(), Path::new("/mnt/mirroot")).unwrap();
        assert_eq!(
            pools.calls(),
            [
                "labelclear /dev/sda3",
                "labelclear /dev/sdb3",
                "create rpool",
                "set rpool cachefile=none",
            ]
        );
        assert!(pools.labelled.borrow().is_empty());
    }

    #[test]
    fn test_provision_phantom_pool() {
        let pools = FakePools {
            phantom_create: true,
            ..Default::default()
        };
        let err = provision(&pools, &spec(), Path::new("/mnt/mirroot")).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Destructive(DestructiveError::PoolNotPresent {
                pool: "rpool".into()
            })
        );
        assert!(!pools.calls().iter().any(|c| c.starts_with("set")));
    }

    #[test]
    fn test_destroy_nonexistent_pool() {
        let pools = FakePools::default();
        assert_eq!(
            destroy(&pools, "nonexistent-pool").unwrap(),
            LadderOutcome::AlreadySatisfied
        );
        assert!(pools.calls().is_empty());
    }

    #[test]
    fn test_destroy_idempotent() {
        let pools = FakePools::default().with_pool("rpool");
        pools
            .pools
            .borrow_mut()
            .get_mut("rpool")
            .unwrap()
            .extend(["rpool/ROOT".to_string(), "rpool/ROOT/ubuntu".to_string()]);

        assert_eq!(
            destroy(&pools, "rpool").unwrap(),
            LadderOutcome::SatisfiedBy("destroy")
        );
        assert_eq!(
            pools.calls(),
            [
                "unmount rpool/ROOT/ubuntu",
                "destroy-dataset rpool/ROOT/ubuntu",
                "unmount rpool/ROOT",
                "destroy-dataset rpool/ROOT",
                "destroy rpool",
            ]
        );
        assert_eq!(
            destroy(&pools, "rpool").unwrap(),
            LadderOutcome::AlreadySatisfied
        );
    }

    #[test]
    fn test_destroy_falls_back_to_export() {
        let pools = FakePools::default()
            .with_pool("rpool")
            .failing("destroy");
        assert_eq!(
            destroy(&pools, "rpool").unwrap(),
            LadderOutcome::SatisfiedBy("export")
        );
    }

    #[test]
    fn test_destroy_last_resort() {
        let pools = FakePools::default()
            .with_pool("rpool")
            .failing("destroy")
            .failing("export")
            .failing("export-force");
        assert_eq!(
            destroy(&pools, "rpool").unwrap(),
            LadderOutcome::SatisfiedBy("force import and destroy")
        );
        assert!(pools.calls().contains(&"destroy-force rpool".to_string()));
    }

    #[test]
    fn test_destroy_gives_up() {
        let pools = FakePools::default()
            .with_pool("rpool")
            .failing("destroy")
            .failing("destroy-force")
            .failing("export")
            .failing("export-force");
        let err = destroy(&pools, "rpool").unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Destructive(DestructiveError::DestroyPool {
                pool: "rpool".into()
            })
        );
    }

    #[test]
    fn test_export_forced_fallback() {
        let pools = FakePools::default().with_pool("rpool").failing("export");
        assert_eq!(
            export(&pools, "rpool").unwrap(),
            LadderOutcome::SatisfiedBy("forced export")
        );
        assert!(!pools.exists("rpool").unwrap());
    }

    #[test]
    fn test_dataset_layout_and_creation() {
        let storage = StorageConfiguration {
            extra_datasets: vec![ExtraDataset {
                name: "srv".into(),
                mount_point: "/srv".into(),
            }],
            ..Default::default()
        };
        let layout = dataset_layout(&storage);
        let names: Vec<&str> = layout.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "rpool/ROOT",
                "rpool/ROOT/ubuntu",
                "rpool/home",
                "rpool/var",
                "rpool/var/log",
                "rpool/srv"
            ]
        );
        assert!(layout[1].mount);
        assert_eq!(
            layout[5].properties,
            [("mountpoint".to_string(), "/srv".to_string())]
        );

        let pools = FakePools::default().with_pool("rpool");
        create_datasets(&pools, "rpool", &layout).unwrap();
        // Second run only remounts the root dataset.
        create_datasets(&pools, "rpool", &layout).unwrap();
        let calls = pools.calls();
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("create-dataset")).count(),
            6
        );
        assert_eq!(
            calls
                .iter()
                .filter(|c| *c == "mount rpool/ROOT/ubuntu")
                .count(),
            2
        );
    }
}
