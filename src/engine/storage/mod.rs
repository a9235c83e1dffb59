use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use mirroot_api::{
    constants::ESP_VOLUME_NAME,
    error::{DestructiveError, MirrootError, ReportError},
};
use osutils::{block_devices, mkfs, zpool::PoolStatus};

pub mod identity;
pub mod inspect;
pub mod ladder;
pub mod partitioning;
pub mod pool;

use inspect::{DiskOperator, DriveSpec};
use partitioning::RealizedLayout;
use pool::PoolOperator;

/// Formats the ESP of every layout with the same volume label and id, so
/// firmware and `fstab` see one logical volume whichever drive boots.
pub fn format_esps(
    disks: &dyn DiskOperator,
    layouts: &[&RealizedLayout],
    volume_id: &str,
) -> Result<(), MirrootError> {
    for layout in layouts {
        info!(
            "Formatting ESP '{}' (volume id {})",
            layout.esp.display(),
            mkfs::vfat_uuid(volume_id)
        );
        disks
            .format_vfat(&layout.esp, ESP_VOLUME_NAME, volume_id)
            .structured(DestructiveError::FormatEsp {
                path: layout.esp.display().to_string(),
            })?;
    }
    Ok(())
}

/// Creates swap on every layout that has a swap partition. Each drive keeps
/// its own swap area, labelled after the drive.
pub fn format_swap(
    disks: &dyn DiskOperator,
    layouts: &[(&RealizedLayout, &str)],
) -> Result<(), MirrootError> {
    for (layout, label) in layouts {
        let Some(swap) = &layout.swap else {
            continue;
        };
        debug!("Creating swap on '{}'", swap.display());
        disks
            .format_swap(swap, &format!("swap-{label}"))
            .structured(DestructiveError::FormatSwap {
                path: swap.display().to_string(),
            })?;
    }
    Ok(())
}

/// Every path a partition of `drive` may be known by: nodes from the current
/// table plus the by-id and kernel names of the first `count` partitions.
pub fn partition_aliases(drive: &DriveSpec, table_nodes: &[PathBuf], count: usize) -> Vec<PathBuf> {
    let mut aliases: Vec<PathBuf> = table_nodes.to_vec();
    for number in 1..=count {
        for disk in [&drive.path, &drive.node] {
            let alias = block_devices::partition_path(disk, number);
            if !aliases.contains(&alias) {
                aliases.push(alias);
            }
        }
    }
    aliases
}

/// Names of the pools with at least one member among `partitions`.
pub fn pools_using(statuses: &[PoolStatus], partitions: &[PathBuf]) -> Vec<String> {
    statuses
        .iter()
        .filter(|status| {
            partitions
                .iter()
                .any(|p| status.member(&p.to_string_lossy()).is_some())
        })
        .map(|status| status.name.clone())
        .collect()
}

/// Removes pools living on `drives`, then erases every signature of the
/// drives' partitions and of the drives themselves.
pub fn wipe_drives(
    disks: &dyn DiskOperator,
    ops: &dyn PoolOperator,
    drives: &[&DriveSpec],
) -> Result<(), MirrootError> {
    let mut partitions = Vec::new();
    for drive in drives {
        let table = disks
            .partition_table(&drive.path)
            .structured(DestructiveError::WipeDrive {
                path: drive.path.display().to_string(),
            })?;
        let nodes: Vec<PathBuf> = table
            .iter()
            .flat_map(|t| t.partitions.iter().map(|p| p.node.clone()))
            .collect();
        let count = nodes.len();
        partitions.push((drive, nodes.clone(), partition_aliases(drive, &nodes, count)));
    }

    let aliases: Vec<PathBuf> = partitions
        .iter()
        .flat_map(|(_, _, aliases)| aliases.iter().cloned())
        .collect();
    let statuses = pool_statuses(ops)?;
    for pool in pools_using(&statuses, &aliases) {
        warn!("Pool '{pool}' lives on a drive being wiped, destroying it");
        pool::destroy(ops, &pool)?;
    }

    for (drive, nodes, _) in &partitions {
        for node in nodes {
            wipe_partition(disks, ops, node)?;
        }
        info!("Wiping drive '{}'", drive.path.display());
        disks.wipe(&drive.path).structured(DestructiveError::WipeDrive {
            path: drive.path.display().to_string(),
        })?;
    }
    Ok(())
}

fn pool_statuses(ops: &dyn PoolOperator) -> Result<Vec<PoolStatus>, MirrootError> {
    let pools = ops
        .pools()
        .structured(DestructiveError::WipeDrive {
            path: "pools".into(),
        })?;
    let mut statuses = Vec::new();
    for pool in pools {
        if let Some(status) = ops
            .status(&pool)
            .structured(DestructiveError::DestroyPool { pool: pool.clone() })?
        {
            statuses.push(status);
        }
    }
    Ok(statuses)
}

fn wipe_partition(
    disks: &dyn DiskOperator,
    ops: &dyn PoolOperator,
    node: &Path,
) -> Result<(), MirrootError> {
    if let Err(e) = disks.swapoff(node) {
        warn!("{e:?}");
    }
    match ops.clear_label(node) {
        Ok(true) => info!("Cleared pool label on '{}'", node.display()),
        Ok(false) => {}
        Err(e) => warn!("{e:?}"),
    }
    disks.wipe(node).structured(DestructiveError::WipeDrive {
        path: node.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use osutils::zpool::{PoolMember, VdevState};

    use mirroot_api::primitives::bytes::{ByteCount, GIB};

    fn drive() -> DriveSpec {
        DriveSpec {
            path: "/dev/disk/by-id/nvme-Samsung_SSD_970_S4EWNX0R123456".into(),
            node: "/dev/nvme0n1".into(),
            label: "Samsung-SSD-970-3456".into(),
            size: ByteCount(500 * GIB),
            rotational: false,
        }
    }

    fn status(name: &str, members: &[&str]) -> PoolStatus {
        PoolStatus {
            name: name.into(),
            state: VdevState::Online,
            scan: None,
            members: members
                .iter()
                .map(|m| PoolMember {
                    name: m.to_string(),
                    state: VdevState::Online,
                    was: None,
                    resilvering: false,
                })
                .collect(),
        }
    }

    #[test]
    fn test_partition_aliases() {
        let aliases = partition_aliases(&drive(), &["/dev/nvme0n1p1".into()], 2);
        assert_eq!(
            aliases,
            [
                PathBuf::from("/dev/nvme0n1p1"),
                PathBuf::from("/dev/disk/by-id/nvme-Samsung_SSD_970_S4EWNX0R123456-part1"),
                PathBuf::from("/dev/disk/by-id/nvme-Samsung_SSD_970_S4EWNX0R123456-part2"),
                PathBuf::from("/dev/nvme0n1p2"),
            ]
        );
    }

    #[test]
    fn test_pools_using() {
        let aliases = partition_aliases(&drive(), &[], 3);
        let statuses = [
            status(
                "rpool",
                &[
                    "/dev/disk/by-id/nvme-Samsung_SSD_970_S4EWNX0R123456-part3",
                    "/dev/disk/by-id/nvme-Samsung_SSD_970_S4EWNX0R999999-part3",
                ],
            ),
            status("tank", &["/dev/sdc1", "/dev/sdd1"]),
        ];
        assert_eq!(pools_using(&statuses, &aliases), ["rpool"]);
    }
}
