use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Error};
use log::{debug, info};

use mirroot_api::{
    error::{MirrootError, PreconditionError, ReportError},
    primitives::bytes::ByteCount,
};
use osutils::{
    block_devices,
    lsblk::{self, BlockDeviceType},
    mkfs, mkswap,
    sfdisk::{SfDisk, SfScript},
    udevadm, wipefs,
};

use super::identity;

/// Polling budget for partition nodes after a table was rewritten.
const NODE_WAIT_ATTEMPTS: usize = 20;
const NODE_WAIT_DELAY: Duration = Duration::from_millis(500);

/// What the host reports about a block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescription {
    /// Kernel node, e.g. `/dev/nvme0n1`.
    pub node: PathBuf,

    /// `/dev/disk/by-id` link with model and serial, when one exists.
    pub stable_path: Option<PathBuf>,

    pub size: u64,
    pub rotational: bool,
    pub device_type: BlockDeviceType,

    /// Mount points of the device and its partitions.
    pub mount_points: Vec<PathBuf>,

    /// Disk holding this device, for partitions.
    pub parent: Option<PathBuf>,

    /// Filesystem UUID as `blkid` reports it.
    pub fs_uuid: Option<String>,
}

/// Narrow view of the host's block devices.
pub trait DiskInspector {
    /// Describes the device at `path`. Fails when it is not a block device.
    fn describe(&self, path: &Path) -> Result<DiskDescription, Error>;

    /// Current partition table of `disk`, `None` when it has none.
    fn partition_table(&self, disk: &Path) -> Result<Option<SfDisk>, Error>;
}

/// Partition table and filesystem mutations.
pub trait DiskOperator: DiskInspector {
    /// Replaces the partition table of `disk`.
    fn write_table(&self, disk: &Path, script: &SfScript) -> Result<(), Error>;

    /// Waits for `nodes` to show up after a table change.
    fn wait_for_nodes(&self, nodes: &[PathBuf]) -> Result<(), Error>;

    fn format_vfat(&self, device: &Path, label: &str, volume_id: &str) -> Result<(), Error>;
    fn format_swap(&self, device: &Path, label: &str) -> Result<(), Error>;
    fn swapoff(&self, device: &Path) -> Result<(), Error>;

    /// Erases every signature on `device`.
    fn wipe(&self, device: &Path) -> Result<(), Error>;
}

/// Backed by `lsblk`, `sfdisk`, `/dev/disk/by-id` and the mkfs tools.
#[derive(Debug, Default)]
pub struct SystemDisks;

impl DiskInspector for SystemDisks {
    fn describe(&self, path: &Path) -> Result<DiskDescription, Error> {
        let device = lsblk::get(path)?;
        let node = device.kname.clone().unwrap_or_else(|| device.name.clone());
        let stable_path = match device.device_type {
            BlockDeviceType::Disk => block_devices::stable_disk_path(&node)
                .with_context(|| format!("Failed to find stable path of '{}'", node.display()))?,
            _ => None,
        };
        Ok(DiskDescription {
            stable_path,
            size: device.size,
            rotational: device.rotational,
            device_type: device.device_type.clone(),
            mount_points: device
                .mount_points()
                .into_iter()
                .map(Path::to_path_buf)
                .collect(),
            parent: device.parent_kernel_name.clone(),
            fs_uuid: device.uuid.clone(),
            node,
        })
    }

    fn partition_table(&self, disk: &Path) -> Result<Option<SfDisk>, Error> {
        SfDisk::get_info(disk)
    }
}

impl DiskOperator for SystemDisks {
    fn write_table(&self, disk: &Path, script: &SfScript) -> Result<(), Error> {
        script.apply(disk)
    }

    fn wait_for_nodes(&self, nodes: &[PathBuf]) -> Result<(), Error> {
        udevadm::wait_for_nodes(nodes, NODE_WAIT_ATTEMPTS, NODE_WAIT_DELAY)
    }

    fn format_vfat(&self, device: &Path, label: &str, volume_id: &str) -> Result<(), Error> {
        mkfs::vfat(device, label, volume_id)
    }

    fn format_swap(&self, device: &Path, label: &str) -> Result<(), Error> {
        mkswap::run(device, label)
    }

    fn swapoff(&self, device: &Path) -> Result<(), Error> {
        mkswap::swapoff(device)
    }

    fn wipe(&self, device: &Path) -> Result<(), Error> {
        wipefs::all(device)
    }
}

/// A target drive as captured at session start. Never refreshed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSpec {
    /// Path every later step addresses the drive by: the by-id link when
    /// available, the kernel node otherwise.
    pub path: PathBuf,

    pub node: PathBuf,

    /// Bootloader folder name and boot menu title of this drive.
    pub label: String,

    pub size: ByteCount,
    pub rotational: bool,
}

impl DriveSpec {
    /// Inspects `path` and checks that it names a whole disk that nothing is
    /// using.
    pub fn capture<I>(inspector: &I, path: &Path) -> Result<Self, MirrootError>
    where
        I: DiskInspector + ?Sized,
    {
        let path_str = path.display().to_string();
        if !path.exists() {
            return Err(MirrootError::new(PreconditionError::DriveNotFound {
                path: path_str,
            }));
        }

        let description = inspector
            .describe(path)
            .structured(PreconditionError::InspectDrive {
                path: path_str.clone(),
            })?;
        debug!("Drive '{path_str}': {description:?}");

        match description.device_type {
            BlockDeviceType::Disk => {}
            BlockDeviceType::Part => {
                return Err(MirrootError::new(PreconditionError::PartitionGiven {
                    path: path_str,
                }))
            }
            _ => {
                return Err(MirrootError::new(PreconditionError::DriveNotFound {
                    path: path_str,
                }))
            }
        }

        if let Some(mount_point) = description.mount_points.first() {
            return Err(MirrootError::new(PreconditionError::DriveInUse {
                path: path_str,
                mount_point: mount_point.display().to_string(),
            }));
        }

        let path = description
            .stable_path
            .clone()
            .unwrap_or_else(|| description.node.clone());
        let label = identity::drive_label(&path)?;
        info!(
            "Captured drive '{}' ({}, {}) as '{label}'",
            path.display(),
            ByteCount(description.size),
            if description.rotational { "rotational" } else { "solid state" }
        );

        Ok(DriveSpec {
            path,
            node: description.node,
            label,
            size: ByteCount(description.size),
            rotational: description.rotational,
        })
    }

    /// Captures both drives of a pair and rejects two paths naming one disk.
    pub fn capture_pair<I>(inspector: &I, a: &Path, b: &Path) -> Result<(Self, Self), MirrootError>
    where
        I: DiskInspector + ?Sized,
    {
        let a = Self::capture(inspector, a)?;
        let b = Self::capture(inspector, b)?;
        if a.node == b.node {
            return Err(MirrootError::new(PreconditionError::SameDrive {
                path: a.node.display().to_string(),
            }));
        }
        Ok((a, b))
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    use std::{
        cell::RefCell,
        collections::{HashMap, HashSet},
    };

    use anyhow::bail;

    /// Serves canned descriptions keyed by the path asked for. Every mutating
    /// call is appended to `calls`.
    #[derive(Default)]
    pub struct FakeDisks {
        pub disks: HashMap<PathBuf, DiskDescription>,
        pub tables: RefCell<HashMap<PathBuf, SfDisk>>,
        pub calls: RefCell<Vec<String>>,

        /// Operations (by call name) that fail without effect.
        pub failing: HashSet<&'static str>,
    }

    impl FakeDisks {
        pub fn with_disk(mut self, path: &Path, description: DiskDescription) -> Self {
            self.disks.insert(path.to_path_buf(), description);
            self
        }

        pub fn with_table(self, disk: &Path, table: SfDisk) -> Self {
            self.tables.borrow_mut().insert(disk.to_path_buf(), table);
            self
        }

        pub fn failing(mut self, op: &'static str) -> Self {
            self.failing.insert(op);
            self
        }

        fn call(&self, op: &'static str, detail: impl std::fmt::Display) -> Result<(), Error> {
            self.calls.borrow_mut().push(format!("{op} {detail}"));
            if self.failing.contains(op) {
                bail!("{op} failed");
            }
            Ok(())
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl DiskInspector for FakeDisks {
        fn describe(&self, path: &Path) -> Result<DiskDescription, Error> {
            match self.disks.get(path) {
                Some(d) => Ok(d.clone()),
                None => bail!("no such device '{}'", path.display()),
            }
        }

        fn partition_table(&self, disk: &Path) -> Result<Option<SfDisk>, Error> {
            Ok(self.tables.borrow().get(disk).cloned())
        }
    }

    impl DiskOperator for FakeDisks {
        fn write_table(&self, disk: &Path, _script: &SfScript) -> Result<(), Error> {
            self.call("partition", disk.display())
        }

        fn wait_for_nodes(&self, nodes: &[PathBuf]) -> Result<(), Error> {
            self.call("wait", nodes.len())
        }

        fn format_vfat(&self, device: &Path, label: &str, volume_id: &str) -> Result<(), Error> {
            self.call("mkfs.vfat", format!("{} {label} {volume_id}", device.display()))
        }

        fn format_swap(&self, device: &Path, label: &str) -> Result<(), Error> {
            self.call("mkswap", format!("{} {label}", device.display()))
        }

        fn swapoff(&self, device: &Path) -> Result<(), Error> {
            self.call("swapoff", device.display())
        }

        fn wipe(&self, device: &Path) -> Result<(), Error> {
            self.call("wipefs", device.display())
        }
    }

    pub fn disk(node: &str, stable: Option<&str>, size: u64) -> DiskDescription {
        DiskDescription {
            node: node.into(),
            stable_path: stable.map(PathBuf::from),
            size,
            rotational: false,
            device_type: BlockDeviceType::Disk,
            mount_points: Vec::new(),
            parent: None,
            fs_uuid: None,
        }
    }
}
