use log::debug;

use mirroot_api::{
    error::{MirrootError, ReportError, SynchronizationError},
    status::{EspMemberReport, PoolMemberReport, PoolReport, StatusReport},
};
use osutils::zpool::PoolStatus;

use super::{boot::bootstrap, mirror::sync::MirrorHost, storage::pool::PoolInspector};

/// Gathers pool health, ESP mirror membership and the bootstrap ticket of the
/// system rooted at `host.root()`.
pub fn collect(
    pools: &dyn PoolInspector,
    host: &dyn MirrorHost,
    pool: &str,
) -> Result<StatusReport, MirrootError> {
    let pool = pools
        .status(pool)
        .structured(SynchronizationError::QueryPool { pool: pool.into() })?
        .map(pool_report);

    let mut esp_members = Vec::new();
    let primary = host
        .primary()
        .structured(SynchronizationError::DiscoverMembers)?;
    match primary.as_ref().and_then(|p| p.uuid.as_deref()) {
        Some(uuid) => {
            for member in host
                .members(uuid)
                .structured(SynchronizationError::DiscoverMembers)?
            {
                let is_primary = primary
                    .as_ref()
                    .is_some_and(|p| p.source == member.device.to_string_lossy());
                esp_members.push(EspMemberReport {
                    device: member.device,
                    label: member.label,
                    primary: is_primary,
                });
            }
        }
        None => debug!("No ESP mounted, skipping mirror membership"),
    }

    Ok(StatusReport {
        pool,
        esp_members,
        bootstrap_ticket: bootstrap::read_ticket(host.root())?,
    })
}

fn pool_report(status: PoolStatus) -> PoolReport {
    PoolReport {
        name: status.name,
        health: status.state.to_string(),
        members: status
            .members
            .into_iter()
            .map(|m| PoolMemberReport {
                state: if m.resilvering {
                    format!("{} (resilvering)", m.state)
                } else {
                    m.state.to_string()
                },
                device: m.was.unwrap_or(m.name),
            })
            .collect(),
        scan: status.scan,
    }
}
