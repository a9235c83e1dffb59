//! Substitutes a new drive for a failed pool member.

use std::path::{Path, PathBuf};

use log::{info, warn};

use mirroot_api::error::{
    MirrootError, MirrootResultExt, PreconditionError, ReportError, SynchronizationError,
};
use osutils::{
    block_devices, files,
    partition_types::PartitionType,
    path::join_relative,
    zpool::{PoolMember, PoolStatus},
};

use crate::engine::{
    boot::esp,
    storage::{
        self,
        inspect::{DiskOperator, DriveSpec},
        partitioning::{self, PartitionRole, RealizedLayout},
        pool::PoolOperator,
    },
};

const FSTAB_PATH: &str = "/etc/fstab";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub layout: RealizedLayout,

    /// The member that was replaced, by the name the pool reported.
    pub replaced: String,

    /// `zpool status` scan line right after the replacement.
    pub scan: Option<String>,

    /// Partition number of swap on both drives, if the layout has swap.
    pub swap_number: Option<usize>,
}

/// Returns the member named `failed` and a healthy member to copy the layout
/// from. Refuses unless the pool itself reports `failed` as failed.
pub fn check_replaceable<'s>(
    status: &'s PoolStatus,
    failed: &str,
) -> Result<(&'s PoolMember, &'s PoolMember), MirrootError> {
    let member = status.member(failed).structured(SynchronizationError::MemberNotFailed {
        member: failed.into(),
        state: format!("not a member of pool '{}'", status.name),
    })?;
    if !member.state.is_failed() {
        return Err(MirrootError::new(SynchronizationError::MemberNotFailed {
            member: failed.into(),
            state: member.state.to_string(),
        }));
    }

    let survivor = status
        .members
        .iter()
        .find(|m| m.name != member.name && !m.state.is_failed())
        .structured(SynchronizationError::NoSurvivor)?;
    Ok((member, survivor))
}

/// Partitions `new` like the surviving member's drive, recreates its ESP and
/// swap, substitutes its pool partition for `failed` and confirms the pool
/// took the new partition in. Does not wait for the resilver to finish.
pub fn replace_drive(
    disks: &dyn DiskOperator,
    ops: &dyn PoolOperator,
    pool: &str,
    failed: &str,
    new: &DriveSpec,
) -> Result<ReplaceOutcome, MirrootError> {
    let status = query(ops, pool)?;
    let (member, survivor) = check_replaceable(&status, failed)?;
    let replaced = member.name.clone();
    info!(
        "Replacing '{}' ({}) in pool '{pool}' with '{}', copying the layout of '{}'",
        member.path(),
        member.state,
        new.path.display(),
        survivor.name
    );

    let new_name = new.path.display().to_string();
    let survivor_disk = disks
        .describe(Path::new(&survivor.name))
        .ok()
        .and_then(|d| d.parent)
        .structured(SynchronizationError::NoSurvivor)
        .message(format!("Cannot find the disk holding '{}'", survivor.name))?;
    let new_description = disks
        .describe(&new.path)
        .structured(PreconditionError::InspectDrive {
            path: new_name.clone(),
        })?;
    if new_description.node == survivor_disk {
        return Err(MirrootError::new(PreconditionError::SameDrive {
            path: survivor_disk.display().to_string(),
        }));
    }

    let table = disks
        .partition_table(&survivor_disk)
        .ok()
        .flatten()
        .structured(SynchronizationError::NoSurvivor)
        .message(format!(
            "Cannot read the partition table of '{}'",
            survivor_disk.display()
        ))?;
    let volume_id = table
        .partitions
        .iter()
        .find(|p| p.partition_type == PartitionType::Esp)
        .and_then(|p| disks.describe(&p.node).ok())
        .and_then(|d| d.fs_uuid)
        .and_then(|uuid| esp::volume_id_from_uuid(&uuid))
        .structured(SynchronizationError::DiscoverMembers)
        .message("Cannot read the volume id of the surviving ESP")?;

    let plan = partitioning::plan_from_table(new, &table)?;
    info!("Partitioning '{new_name}': {}", partitioning::describe(&plan));
    let layout = partitioning::realize(disks, &plan)?;
    storage::format_esps(disks, &[&layout], &volume_id)?;
    storage::format_swap(disks, &[(&layout, new.label.as_str())])?;

    if let Err(e) = ops.clear_label(&layout.pool) {
        warn!("{e:?}");
    }
    ops.replace(pool, &replaced, &layout.pool)
        .structured(SynchronizationError::ReplaceMember {
            new: layout.pool.display().to_string(),
        })?;

    let after = query(ops, pool)?;
    if !after.replacement_started(&layout.pool.to_string_lossy()) {
        return Err(MirrootError::new(SynchronizationError::ResilverNotStarted {
            new: layout.pool.display().to_string(),
        }));
    }
    info!(
        "Resilver started: {}",
        after.scan.as_deref().unwrap_or("in progress")
    );

    Ok(ReplaceOutcome {
        layout,
        replaced: member.path().to_string(),
        scan: after.scan,
        swap_number: plan.number(PartitionRole::Swap),
    })
}

fn query(ops: &dyn PoolOperator, pool: &str) -> Result<PoolStatus, MirrootError> {
    ops.status(pool)
        .structured(SynchronizationError::QueryPool { pool: pool.into() })?
        .structured(SynchronizationError::QueryPool { pool: pool.into() })
}

/// The disk a partition path belongs to, by naming rules alone. Works for
/// devices that no longer exist.
pub fn disk_of(partition: &str) -> PathBuf {
    if let Some((disk, _)) = partition.rsplit_once("-part") {
        return PathBuf::from(disk);
    }
    let trimmed = partition.trim_end_matches(|c: char| c.is_ascii_digit());
    match trimmed.strip_suffix('p') {
        Some(disk) if disk.ends_with(|c: char| c.is_ascii_digit()) => PathBuf::from(disk),
        _ => PathBuf::from(trimmed),
    }
}

/// Points the swap line of the replaced drive at the new drive's swap.
/// Returns whether anything changed.
pub fn update_swap_reference(
    root: &Path,
    replaced: &str,
    swap_number: usize,
    new_swap: &Path,
) -> Result<bool, MirrootError> {
    let old_swap = block_devices::partition_path(disk_of(replaced), swap_number);
    let fstab_path = join_relative(root, FSTAB_PATH);
    if !fstab_path.exists() {
        return Ok(false);
    }
    let contents =
        std::fs::read_to_string(&fstab_path).structured(SynchronizationError::UpdateReferences)?;
    let (updated, changed) = replace_fstab_source(&contents, &old_swap, new_swap);
    if changed {
        files::write_file_atomic(&fstab_path, 0o644, updated.as_bytes())
            .structured(SynchronizationError::UpdateReferences)?;
        info!(
            "Swap entry '{}' now points to '{}'",
            old_swap.display(),
            new_swap.display()
        );
    }
    Ok(changed)
}

fn replace_fstab_source(contents: &str, old: &Path, new: &Path) -> (String, bool) {
    let old = old.display().to_string();
    let mut changed = false;
    let mut updated = String::with_capacity(contents.len());
    for line in contents.lines() {
        match line.split_whitespace().next() {
            Some(source) if source == old => {
                updated += &line.replacen(&old, &new.display().to_string(), 1);
                changed = true;
            }
            _ => updated += line,
        }
        updated.push('\n');
    }
    (updated, changed)
}
