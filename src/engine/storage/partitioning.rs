use std::path::PathBuf;

use log::{debug, info};
use strum_macros::{Display, IntoStaticStr};

use mirroot_api::{
    error::{DestructiveError, InternalError, MirrootError, PreconditionError, ReportError},
    primitives::bytes::{ByteCount, GIB, MIB},
};
use osutils::{
    block_devices,
    partition_types::PartitionType,
    sfdisk::{SfDisk, SfScript},
};

use super::inspect::{DiskOperator, DriveSpec};

/// Every partition starts on a 1 MiB boundary.
const ALIGNMENT: u64 = MIB;

/// Space kept free for the primary GPT at the start and the backup GPT at
/// the end of the drive.
const GPT_RESERVED: u64 = 2 * MIB;

/// Smallest pool region worth installing onto.
pub const MIN_POOL_SIZE: ByteCount = ByteCount::from_gib(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum PartitionRole {
    Esp,
    Swap,
    Pool,
}

impl PartitionRole {
    pub fn partition_type(&self) -> PartitionType {
        match self {
            Self::Esp => PartitionType::Esp,
            Self::Swap => PartitionType::Swap,
            Self::Pool => PartitionType::Zfs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    pub role: PartitionRole,
    pub size: ByteCount,

    /// This entry takes what the other roles leave of the smaller drive of
    /// the pair.
    pub fills_remainder: bool,
}

/// Ordered layout of one drive. The two plans of a pair differ only in
/// `disk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub disk: PathBuf,
    pub entries: Vec<PlannedPartition>,
}

/// Partition device paths of a realized plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealizedLayout {
    pub disk: PathBuf,
    pub esp: PathBuf,
    pub swap: Option<PathBuf>,
    pub pool: PathBuf,
}

impl PartitionPlan {
    /// Same roles and sizes in the same order, ignoring the disk.
    pub fn is_structurally_equal(&self, other: &PartitionPlan) -> bool {
        self.entries == other.entries
    }

    pub fn entry(&self, role: PartitionRole) -> Option<&PlannedPartition> {
        self.entries.iter().find(|e| e.role == role)
    }

    /// 1-based partition number of `role`.
    pub fn number(&self, role: PartitionRole) -> Option<usize> {
        self.entries.iter().position(|e| e.role == role).map(|i| i + 1)
    }

    pub fn script(&self) -> SfScript {
        self.entries.iter().fold(SfScript::new(), |script, entry| {
            script.with_partition(
                Some(entry.size.bytes()),
                entry.role.partition_type(),
                <&str>::from(entry.role),
            )
        })
    }

    /// Device path of every planned partition, in table order.
    pub fn partition_paths(&self) -> Vec<PathBuf> {
        (1..=self.entries.len())
            .map(|n| block_devices::partition_path(&self.disk, n))
            .collect()
    }

    pub fn layout(&self) -> Result<RealizedLayout, MirrootError> {
        let path = |role| {
            self.number(role)
                .map(|n| block_devices::partition_path(&self.disk, n))
        };
        Ok(RealizedLayout {
            disk: self.disk.clone(),
            esp: path(PartitionRole::Esp)
                .structured(InternalError::Internal("Partition plan has no ESP"))?,
            swap: path(PartitionRole::Swap),
            pool: path(PartitionRole::Pool)
                .structured(InternalError::Internal("Partition plan has no pool region"))?,
        })
    }

    /// Whether the table on disk already is this plan: same count, order,
    /// types and sizes.
    pub fn matches(&self, table: &SfDisk) -> bool {
        table.partitions.len() == self.entries.len()
            && table
                .partitions
                .iter()
                .zip(&self.entries)
                .all(|(existing, planned)| {
                    existing.partition_type == planned.role.partition_type()
                        && existing.size == planned.size.bytes()
                })
    }
}

/// Computes the layout shared by both drives of a pair. The pool region is
/// sized from the smaller drive, so either drive can stand in for the other.
pub fn plan_pair(
    a: &DriveSpec,
    b: &DriveSpec,
    esp_size: ByteCount,
    swap_size: ByteCount,
) -> Result<(PartitionPlan, PartitionPlan), MirrootError> {
    let smaller = if a.size <= b.size { a } else { b };
    let entries = plan_entries(smaller, esp_size, swap_size)?;

    Ok((
        PartitionPlan {
            disk: a.path.clone(),
            entries: entries.clone(),
        },
        PartitionPlan {
            disk: b.path.clone(),
            entries,
        },
    ))
}

/// Copies the layout of a surviving pool member's disk onto `drive`, the
/// replacement for a failed member.
pub fn plan_from_table(drive: &DriveSpec, survivor: &SfDisk) -> Result<PartitionPlan, MirrootError> {
    let mut entries = Vec::with_capacity(survivor.partitions.len());
    for partition in &survivor.partitions {
        let role = match partition.partition_type {
            PartitionType::Esp => PartitionRole::Esp,
            PartitionType::Swap => PartitionRole::Swap,
            PartitionType::Zfs => PartitionRole::Pool,
            _ => {
                return Err(MirrootError::new(InternalError::Internal(
                    "Surviving drive carries a partition mirroot did not create",
                )))
            }
        };
        entries.push(PlannedPartition {
            role,
            size: ByteCount(partition.size),
            fills_remainder: role == PartitionRole::Pool,
        });
    }

    let plan = PartitionPlan {
        disk: drive.path.clone(),
        entries,
    };
    // Both the ESP and the pool must be present for a layout to be usable.
    plan.layout()?;

    let required = plan.entries.iter().map(|e| e.size.bytes()).sum::<u64>() + GPT_RESERVED;
    if drive.size.bytes() < required {
        return Err(MirrootError::new(PreconditionError::DriveTooSmall {
            path: drive.path.display().to_string(),
            required,
            actual: drive.size.bytes(),
        }));
    }
    Ok(plan)
}

fn plan_entries(
    drive: &DriveSpec,
    esp_size: ByteCount,
    swap_size: ByteCount,
) -> Result<Vec<PlannedPartition>, MirrootError> {
    let esp = esp_size.align_up(ALIGNMENT);
    let swap = swap_size.align_up(ALIGNMENT);
    let usable = drive.size.bytes().saturating_sub(GPT_RESERVED);
    let usable = ByteCount(usable).align_down(ALIGNMENT).bytes();
    let fixed = esp.bytes() + swap.bytes();
    let required = fixed + MIN_POOL_SIZE.bytes() + GPT_RESERVED;

    if usable < fixed + MIN_POOL_SIZE.bytes() {
        return Err(MirrootError::new(PreconditionError::DriveTooSmall {
            path: drive.path.display().to_string(),
            required,
            actual: drive.size.bytes(),
        }));
    }

    let mut entries = vec![PlannedPartition {
        role: PartitionRole::Esp,
        size: esp,
        fills_remainder: false,
    }];
    if !swap.is_zero() {
        entries.push(PlannedPartition {
            role: PartitionRole::Swap,
            size: swap,
            fills_remainder: false,
        });
    }
    entries.push(PlannedPartition {
        role: PartitionRole::Pool,
        size: ByteCount(usable - fixed),
        fills_remainder: true,
    });

    debug!(
        "Planned layout from '{}': {}",
        drive.path.display(),
        entries
            .iter()
            .map(|e| format!("{}={}", e.role, e.size))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(entries)
}

/// Writes `plan` to its disk unless the disk already carries it, then waits
/// for every partition node.
pub fn realize(
    disks: &dyn DiskOperator,
    plan: &PartitionPlan,
) -> Result<RealizedLayout, MirrootError> {
    let disk = plan.disk.display().to_string();
    let current = disks
        .partition_table(&plan.disk)
        .structured(DestructiveError::PartitionDrive { path: disk.clone() })?;

    if current.as_ref().is_some_and(|table| plan.matches(table)) {
        info!("Drive '{disk}' already carries the planned layout, not repartitioning");
    } else {
        info!("Partitioning '{disk}'");
        disks
            .write_table(&plan.disk, &plan.script())
            .structured(DestructiveError::PartitionDrive { path: disk.clone() })?;
    }

    disks
        .wait_for_nodes(&plan.partition_paths())
        .structured(DestructiveError::PartitionNodesMissing { path: disk })?;
    plan.layout()
}

/// One-line summary of `plan` shown to the operator before confirmation.
pub fn describe(plan: &PartitionPlan) -> String {
    plan.entries
        .iter()
        .map(|e| {
            if e.size.bytes() >= GIB {
                format!("{}: {:.1} GiB", e.role, e.size.bytes() as f64 / GIB as f64)
            } else {
                format!("{}: {} MiB", e.role, e.size.bytes() / MIB)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
