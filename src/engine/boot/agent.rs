//! The first-boot agent: validates the boot that used the forced import, then
//! retracts the safety net and reboots once into the plain configuration.
//!
//! Any validation failure leaves every artifact in place so the next boot
//! forces the import again.

use std::{io::Write, path::Path};

use anyhow::{Context, Error};
use log::{error, info, warn};

use mirroot_api::{
    constants::{
        ESP_MOUNT_POINT_PATH, FIRSTBOOT_UNIT_NAME, GRUB_CFG_PATH, REBOOT_DELAY, WRITE_PROBE_DIR,
    },
    error::{BootstrapError, FirstBootValidationError, MirrootError, ReportError},
    status::{BootstrapTicket, FirstBootPhase},
};
use osutils::{
    files,
    findmnt::{self, MountedFilesystem},
    grub::GrubConfig,
    grub_mkconfig, systemd,
    zpool::{self, PoolStatus},
};

use crate::engine::mirror::sync::{self, SystemMirrorHost};

use super::bootstrap;

/// What the agent needs from the booted system.
pub trait FirstBootHost {
    fn read_ticket(&self) -> Result<Option<BootstrapTicket>, MirrootError>;
    fn pool_status(&self, pool: &str) -> Result<Option<PoolStatus>, Error>;
    fn mounted_at(&self, path: &Path) -> Result<Option<MountedFilesystem>, Error>;

    /// Writes, syncs, reads back and removes a scratch file.
    fn write_probe(&self) -> Result<(), Error>;

    fn retract_menu(&self) -> Result<(), MirrootError>;

    /// Regenerates grub.cfg and returns what was written.
    fn regenerate_boot_config(&self) -> Result<GrubConfig, Error>;

    fn sync_mirror(&self) -> Result<(), MirrootError>;
    fn disable_agent(&self) -> Result<(), Error>;
    fn remove_ticket(&self) -> Result<(), MirrootError>;
    fn schedule_reboot(&self) -> Result<(), Error>;
}

/// Runs the agent to the furthest phase it can reach. Without an open ticket
/// there is nothing to do and the system is already in steady state.
pub fn run(host: &dyn FirstBootHost) -> Result<FirstBootPhase, MirrootError> {
    let Some(ticket) = host.read_ticket()? else {
        info!("No bootstrap ticket is open, nothing to do");
        return Ok(FirstBootPhase::SteadyState);
    };
    info!(
        "Bootstrap ticket for pool '{}' issued at {}",
        ticket.pool, ticket.created_at
    );
    let mut phase = FirstBootPhase::BootedWithForce;

    validate(host, &ticket)?;
    advance(&mut phase, FirstBootPhase::Validated);

    revert(host, &ticket)?;
    advance(&mut phase, FirstBootPhase::Reverted);

    host.schedule_reboot()
        .structured(BootstrapError::ScheduleReboot)?;
    info!("Rebooting in {REBOOT_DELAY} into the steady-state configuration");
    advance(&mut phase, FirstBootPhase::SteadyState);
    Ok(phase)
}

fn advance(phase: &mut FirstBootPhase, to: FirstBootPhase) {
    info!("First boot: {phase} -> {to}");
    *phase = to;
}

/// Checks, in order: the pool is imported, `/` comes from it, the ESP is
/// mounted and the root filesystem accepts writes.
pub fn validate(host: &dyn FirstBootHost, ticket: &BootstrapTicket) -> Result<(), MirrootError> {
    let pool_missing = || FirstBootValidationError::PoolMissing {
        pool: ticket.pool.clone(),
    };
    let status = host
        .pool_status(&ticket.pool)
        .structured(pool_missing())?
        .structured(pool_missing())?;
    if status.state.is_failed() {
        return Err(MirrootError::new(pool_missing()));
    }
    if status.members.iter().any(|m| m.state.is_failed()) {
        warn!("Pool '{}' is {}, continuing", status.name, status.state);
    }

    let root_not_mounted = || FirstBootValidationError::RootNotMounted {
        pool: ticket.pool.clone(),
    };
    let root = host
        .mounted_at(Path::new("/"))
        .structured(root_not_mounted())?
        .structured(root_not_mounted())?;
    if root.fstype != "zfs" || root.source != ticket.root_dataset {
        error!(
            "'/' is '{}' ({}), expected '{}'",
            root.source, root.fstype, ticket.root_dataset
        );
        return Err(MirrootError::new(root_not_mounted()));
    }

    let esp_not_mounted = || FirstBootValidationError::EspNotMounted {
        path: ESP_MOUNT_POINT_PATH.into(),
    };
    let esp = host
        .mounted_at(Path::new(ESP_MOUNT_POINT_PATH))
        .structured(esp_not_mounted())?
        .structured(esp_not_mounted())?;
    if esp.fstype != "vfat" {
        return Err(MirrootError::new(esp_not_mounted()));
    }

    host.write_probe()
        .structured(FirstBootValidationError::WriteProbe {
            path: WRITE_PROBE_DIR.into(),
        })?;
    info!("First boot validated");
    Ok(())
}

/// Retracts the forced-import entry and proves it gone, syncs the ESP mirror
/// once, then disables the agent and closes the ticket.
fn revert(host: &dyn FirstBootHost, ticket: &BootstrapTicket) -> Result<(), MirrootError> {
    host.retract_menu()?;
    let config = host
        .regenerate_boot_config()
        .structured(BootstrapError::RegenerateBootConfig)?;
    bootstrap::verify_reverted(&config, &ticket.entry_id)?;
    match &ticket.prior_default {
        Some(default) => info!("Default boot entry restored to '{default}'"),
        None => info!("Default boot entry restored"),
    }

    // A broken mirror must not keep the safety net armed forever.
    if let Err(e) = host.sync_mirror() {
        error!("ESP synchronization failed, run 'mirroot sync-esp' manually: {e:?}");
    }

    host.disable_agent()
        .structured(BootstrapError::DisableAgent)?;
    host.remove_ticket()
}

/// The booted system itself.
#[derive(Debug, Default)]
pub struct SystemFirstBootHost;

impl FirstBootHost for SystemFirstBootHost {
    fn read_ticket(&self) -> Result<Option<BootstrapTicket>, MirrootError> {
        bootstrap::read_ticket(Path::new("/"))
    }

    fn pool_status(&self, pool: &str) -> Result<Option<PoolStatus>, Error> {
        zpool::status(pool)
    }

    fn mounted_at(&self, path: &Path) -> Result<Option<MountedFilesystem>, Error> {
        findmnt::mounted_at(path)
    }

    fn write_probe(&self) -> Result<(), Error> {
        const PROBE: &[u8] = b"mirroot write probe\n";
        files::create_dirs(WRITE_PROBE_DIR)?;
        let mut probe = tempfile::NamedTempFile::new_in(WRITE_PROBE_DIR)
            .with_context(|| format!("Failed to create a file in '{WRITE_PROBE_DIR}'"))?;
        probe.write_all(PROBE).context("Failed to write probe")?;
        probe.as_file().sync_all().context("Failed to sync probe")?;
        let read = std::fs::read(probe.path()).context("Failed to read probe back")?;
        if read != PROBE {
            anyhow::bail!("Probe read back differs from what was written");
        }
        probe.close().context("Failed to remove probe")
    }

    fn retract_menu(&self) -> Result<(), MirrootError> {
        bootstrap::retract_menu(Path::new("/"))
    }

    fn regenerate_boot_config(&self) -> Result<GrubConfig, Error> {
        grub_mkconfig::regenerate(GRUB_CFG_PATH)?;
        GrubConfig::read(GRUB_CFG_PATH)
    }

    fn sync_mirror(&self) -> Result<(), MirrootError> {
        sync::sync_esps(&SystemMirrorHost::running()).map(|_| ())
    }

    fn disable_agent(&self) -> Result<(), Error> {
        systemd::disable(FIRSTBOOT_UNIT_NAME)
    }

    fn remove_ticket(&self) -> Result<(), MirrootError> {
        bootstrap::remove_ticket(Path::new("/"))
    }

    fn schedule_reboot(&self) -> Result<(), Error> {
        systemd::schedule_reboot(REBOOT_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    use anyhow::bail;
    use chrono::Utc;
    use indoc::indoc;

    use mirroot_api::error::{ErrorKind, SynchronizationError};
    use osutils::zpool::VdevState;

    struct FakeHost {
        ticket: Option<BootstrapTicket>,
        pool_state: Option<VdevState>,
        root: Option<MountedFilesystem>,
        esp: Option<MountedFilesystem>,
        probe_fails: bool,
        regenerated: &'static str,
        sync_fails: bool,
        calls: RefCell<Vec<&'static str>>,
    }

    impl Default for FakeHost {
        fn default() -> Self {
            FakeHost {
                ticket: Some(BootstrapTicket {
                    pool: "rpool".into(),
                    root_dataset: "rpool/ROOT/ubuntu".into(),
                    entry_id: "mirroot-firstboot".into(),
                    prior_default: None,
                    created_at: Utc::now(),
                }),
                pool_state: Some(VdevState::Online),
                root: Some(mounted("/", "rpool/ROOT/ubuntu", "zfs")),
                esp: Some(mounted("/boot/efi", "/dev/sda1", "vfat")),
                probe_fails: false,
                regenerated: REVERTED_CFG,
                sync_fails: false,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    const REVERTED_CFG: &str = indoc! {"
        menuentry 'Ubuntu' --id gnulinux-simple {
            linux /ROOT/ubuntu@/boot/vmlinuz root=ZFS=rpool/ROOT/ubuntu ro quiet
        }
    "};

    const STILL_FORCED_CFG: &str = indoc! {"
        menuentry 'First boot' --id mirroot-firstboot {
            linux /ROOT/ubuntu@/boot/vmlinuz root=ZFS=rpool/ROOT/ubuntu ro zfs_force=1
        }
    "};

    fn mounted(target: &str, source: &str, fstype: &str) -> MountedFilesystem {
        MountedFilesystem {
            target: target.into(),
            source: source.into(),
            fstype: fstype.into(),
            uuid: None,
        }
    }

    impl FakeHost {
        fn call(&self, name: &'static str) {
            self.calls.borrow_mut().push(name);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.borrow().clone()
        }
    }

    impl FirstBootHost for FakeHost {
        fn read_ticket(&self) -> Result<Option<BootstrapTicket>, MirrootError> {
            Ok(self.ticket.clone())
        }

        fn pool_status(&self, pool: &str) -> Result<Option<PoolStatus>, Error> {
            Ok(self.pool_state.clone().map(|state| PoolStatus {
                name: pool.into(),
                state,
                scan: None,
                members: Vec::new(),
            }))
        }

        fn mounted_at(&self, path: &Path) -> Result<Option<MountedFilesystem>, Error> {
            Ok(if path == Path::new("/") {
                self.root.clone()
            } else {
                self.esp.clone()
            })
        }

        fn write_probe(&self) -> Result<(), Error> {
            self.call("probe");
            if self.probe_fails {
                bail!("read-only file system");
            }
            Ok(())
        }

        fn retract_menu(&self) -> Result<(), MirrootError> {
            self.call("retract");
            Ok(())
        }

        fn regenerate_boot_config(&self) -> Result<GrubConfig, Error> {
            self.call("regenerate");
            Ok(GrubConfig::parse(self.regenerated))
        }

        fn sync_mirror(&self) -> Result<(), MirrootError> {
            self.call("sync");
            if self.sync_fails {
                return Err(MirrootError::new(SynchronizationError::DiscoverMembers));
            }
            Ok(())
        }

        fn disable_agent(&self) -> Result<(), Error> {
            self.call("disable");
            Ok(())
        }

        fn remove_ticket(&self) -> Result<(), MirrootError> {
            self.call("remove-ticket");
            Ok(())
        }

        fn schedule_reboot(&self) -> Result<(), Error> {
            self.call("reboot");
            Ok(())
        }
    }

    #[test]
    fn test_validated_boot_reverts_and_reboots_once() {
        let host = FakeHost::default();
        assert_eq!(run(&host).unwrap(), FirstBootPhase::SteadyState);
        assert_eq!(
            host.calls(),
            ["probe", "retract", "regenerate", "sync", "disable", "remove-ticket", "reboot"]
        );
    }

    #[test]
    fn test_root_not_mounted_keeps_safety_net() {
        let host = FakeHost {
            root: Some(mounted("/", "/dev/sda2", "ext4")),
            ..Default::default()
        };
        let err = run(&host).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::FirstBootValidation(FirstBootValidationError::RootNotMounted {
                pool: "rpool".into()
            })
        );
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_validation_order() {
        let host = FakeHost {
            pool_state: None,
            root: None,
            ..Default::default()
        };
        assert!(matches!(
            run(&host).unwrap_err().kind(),
            ErrorKind::FirstBootValidation(FirstBootValidationError::PoolMissing { .. })
        ));

        let host = FakeHost {
            esp: None,
            probe_fails: true,
            ..Default::default()
        };
        assert!(matches!(
            run(&host).unwrap_err().kind(),
            ErrorKind::FirstBootValidation(FirstBootValidationError::EspNotMounted { .. })
        ));
        assert!(host.calls().is_empty());

        let host = FakeHost {
            probe_fails: true,
            ..Default::default()
        };
        assert!(matches!(
            run(&host).unwrap_err().kind(),
            ErrorKind::FirstBootValidation(FirstBootValidationError::WriteProbe { .. })
        ));
        assert_eq!(host.calls(), ["probe"]);
    }

    #[test]
    fn test_forced_entry_surviving_regeneration_blocks_cleanup() {
        let host = FakeHost {
            regenerated: STILL_FORCED_CFG,
            ..Default::default()
        };
        let err = run(&host).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Bootstrap(BootstrapError::ForcedImportStillPresent)
        );
        assert_eq!(host.calls(), ["probe", "retract", "regenerate"]);
    }

    #[test]
    fn test_sync_failure_does_not_block_revert() {
        let host = FakeHost {
            sync_fails: true,
            ..Default::default()
        };
        assert_eq!(run(&host).unwrap(), FirstBootPhase::SteadyState);
        assert!(host.calls().contains(&"reboot"));
    }

    #[test]
    fn test_no_ticket() {
        let host = FakeHost {
            ticket: None,
            ..Default::default()
        };
        assert_eq!(run(&host).unwrap(), FirstBootPhase::SteadyState);
        assert!(host.calls().is_empty());
    }
}
