//! The installation steps behind each checkpoint of a session, bound to the
//! real system.

use std::path::PathBuf;

use chrono::Utc;
use log::{debug, info, warn};

use mirroot_api::{
    constants::{ESP_MOUNT_POINT_PATH, GRUB_CFG_PATH, MIRROOT_LOG_DIR},
    error::{
        ConfigurationError, InternalError, MirrootError, MirrootResultExt, PreconditionError,
        ReportError,
    },
    status::LedgerResource,
};
use osutils::{
    chroot::ChrootEnvironment, files, findmnt, grub::GrubConfig, grub_mkconfig, mount,
};

use crate::{config, validation};

use super::{
    boot::{
        bootstrap,
        templates::{Fstab, FstabEntry},
    },
    context::EngineContext,
    mirror::sync::{self, SystemMirrorHost},
    recovery::{RecoveryDocument, RecoveryDrive},
    session::{InstallSteps, Ledger},
    storage::{
        self,
        inspect::{DiskOperator, DriveSpec},
        partitioning::{self, PartitionPlan, RealizedLayout},
        pool::{self, CapabilityProfile, PoolOperator, PoolSpec},
    },
    system::{DebootstrapProvisioner, OsProvisioner},
};

/// Checkpoint steps of `mirroot install`.
pub struct SystemInstallSteps<'a> {
    ctx: &'a EngineContext,
    disks: &'a dyn DiskOperator,
    ops: &'a dyn PoolOperator,
    provisioner: Option<DebootstrapProvisioner>,
    drives: Vec<DriveSpec>,
    plans: Vec<PartitionPlan>,
    layouts: Vec<RealizedLayout>,
    chroot: Option<ChrootEnvironment>,
}

impl<'a> SystemInstallSteps<'a> {
    pub fn new(
        ctx: &'a EngineContext,
        disks: &'a dyn DiskOperator,
        ops: &'a dyn PoolOperator,
    ) -> Self {
        Self {
            ctx,
            disks,
            ops,
            provisioner: None,
            drives: Vec::new(),
            plans: Vec::new(),
            layouts: Vec::new(),
            chroot: None,
        }
    }

    fn chroot(&self) -> Result<&ChrootEnvironment, MirrootError> {
        self.chroot
            .as_ref()
            .structured(InternalError::Internal("Chroot environment is not active"))
    }

    fn provisioner(&self) -> Result<&DebootstrapProvisioner, MirrootError> {
        self.provisioner
            .as_ref()
            .structured(InternalError::Internal("System provisioner is not set up"))
    }

    fn pair(&self) -> Result<(&DriveSpec, &DriveSpec), MirrootError> {
        match self.drives.as_slice() {
            [a, b] => Ok((a, b)),
            _ => Err(MirrootError::internal("Drives have not been captured")),
        }
    }

    fn realized(&self) -> Result<(&RealizedLayout, &RealizedLayout), MirrootError> {
        match self.layouts.as_slice() {
            [a, b] => Ok((a, b)),
            _ => Err(MirrootError::internal("Drives have not been partitioned")),
        }
    }

    fn fstab(&self) -> Fstab {
        let mut entries = vec![FstabEntry::esp(
            &self.ctx.volume_uuid(),
            ESP_MOUNT_POINT_PATH,
        )];
        entries.extend(
            self.layouts
                .iter()
                .filter_map(|l| l.swap.as_ref())
                .map(|swap| FstabEntry::swap(&swap.display().to_string())),
        );
        Fstab { entries }
    }

    fn recovery_document(&self) -> RecoveryDocument {
        RecoveryDocument {
            hostname: self.ctx.hostname.clone(),
            pool: self.ctx.pool_name().into(),
            root_dataset: self.ctx.root_dataset(),
            datasets: pool::dataset_layout(&self.ctx.config.storage)
                .into_iter()
                .map(|d| d.name)
                .collect(),
            esp_uuid: self.ctx.volume_uuid(),
            drives: self
                .drives
                .iter()
                .zip(&self.layouts)
                .map(|(drive, layout)| RecoveryDrive::new(drive, layout))
                .collect(),
            log_path: self.ctx.log_path.clone(),
            generated_at: Utc::now(),
        }
    }

    /// Writes the recovery document to every location that exists so far.
    fn write_recovery_document(&self) -> Result<(), MirrootError> {
        let document = self.recovery_document();
        let [installer, target] = self.ctx.recovery_document_paths();
        document.write(&installer)?;
        if self.ctx.target_root.join("root").is_dir() {
            document.write(&target)?;
        }
        Ok(())
    }
}

impl InstallSteps for SystemInstallSteps<'_> {
    fn validate(&mut self) -> Result<(), MirrootError> {
        validation::check_install_environment()?;
        config::validate(&self.ctx.config, &self.ctx.hostname)?;

        let [a, b] = &self.ctx.drives;
        let (a, b) = DriveSpec::capture_pair(self.disks, a, b)?;
        let storage = &self.ctx.config.storage;
        let (plan_a, plan_b) =
            partitioning::plan_pair(&a, &b, storage.esp_size, storage.swap_size)?;
        if !plan_a.is_structurally_equal(&plan_b) {
            return Err(MirrootError::internal("Drive layouts differ"));
        }

        self.drives = vec![a, b];
        self.plans = vec![plan_a, plan_b];
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), MirrootError> {
        let pool = self.ctx.pool_name();
        if !self.ctx.prewipe
            && self
                .ops
                .exists(pool)
                .structured(PreconditionError::PoolExists { pool: pool.into() })?
        {
            return Err(MirrootError::new(PreconditionError::PoolExists {
                pool: pool.into(),
            }));
        }

        let target = &self.ctx.target_root;
        let prepare_error = || ConfigurationError::PrepareMountPoint {
            path: target.display().to_string(),
        };
        if findmnt::mounted_at(target)
            .structured(prepare_error())?
            .is_some()
        {
            return Err(MirrootError::new(prepare_error()))
                .message("Something is already mounted at the target root");
        }
        files::create_dirs(target).structured(prepare_error())?;

        let mut summary = vec![format!(
            "Installing '{}' onto pool '{pool}'",
            self.ctx.hostname
        )];
        for (drive, plan) in self.drives.iter().zip(&self.plans) {
            summary.push(format!(
                "  {} ({}): {}",
                drive.path.display(),
                drive.label,
                partitioning::describe(plan)
            ));
        }
        validation::confirm_destruction(&summary, &self.ctx.hostname, self.ctx.assume_yes)
    }

    fn partition(&mut self) -> Result<(), MirrootError> {
        if self.ctx.prewipe {
            let drives: Vec<&DriveSpec> = self.drives.iter().collect();
            storage::wipe_drives(self.disks, self.ops, &drives)?;
        }

        let mut layouts = Vec::with_capacity(self.plans.len());
        for plan in &self.plans {
            layouts.push(partitioning::realize(self.disks, plan)?);
        }
        storage::format_esps(
            self.disks,
            &layouts.iter().collect::<Vec<_>>(),
            &self.ctx.volume_id(),
        )?;
        let swaps: Vec<_> = layouts
            .iter()
            .zip(&self.drives)
            .map(|(layout, drive)| (layout, drive.label.as_str()))
            .collect();
        storage::format_swap(self.disks, &swaps)?;
        self.layouts = layouts;

        // From here on an operator may need it to recover by hand.
        self.write_recovery_document()
    }

    fn create_pools(&mut self, ledger: &mut Ledger) -> Result<(), MirrootError> {
        let (a, b) = self.pair()?;
        let (layout_a, layout_b) = self.realized()?;
        let spec = PoolSpec {
            name: self.ctx.pool_name().into(),
            members: [layout_a.pool.clone(), layout_b.pool.clone()],
            profile: CapabilityProfile::for_drives(a, b),
        };
        // Exporting a pool that was never created is a no-op.
        ledger.acquire(LedgerResource::PoolsCreated);
        pool::provision(self.ops, &spec, &self.ctx.target_root)
    }

    fn create_datasets(&mut self, ledger: &mut Ledger) -> Result<(), MirrootError> {
        ledger.acquire(LedgerResource::MountsActive);
        let layout = pool::dataset_layout(&self.ctx.config.storage);
        pool::create_datasets(self.ops, self.ctx.pool_name(), &layout)?;

        let (primary, _) = self.realized()?;
        let esp_mount = self.ctx.esp_mount_point();
        let mount_error = || ConfigurationError::Mount {
            path: esp_mount.display().to_string(),
        };
        mount::ensure_mount_directory(&esp_mount).structured(mount_error())?;
        mount::mount(&primary.esp, &esp_mount, Some("vfat"), &["umask=0077"])
            .structured(mount_error())?;
        info!(
            "Mounted primary ESP '{}' at '{}'",
            primary.esp.display(),
            esp_mount.display()
        );
        Ok(())
    }

    fn configure_system(&mut self) -> Result<(), MirrootError> {
        let provisioner = DebootstrapProvisioner {
            hostname: self.ctx.hostname.clone(),
            os: self.ctx.config.os.clone(),
            fstab: self.fstab(),
            binary: self.ctx.binary.clone(),
        };
        provisioner.install_base(&self.ctx.target_root)?;
        provisioner.configure_files(&self.ctx.target_root)?;
        self.provisioner = Some(provisioner);
        Ok(())
    }

    fn configure_chroot(&mut self, ledger: &mut Ledger) -> Result<(), MirrootError> {
        ledger.acquire(LedgerResource::ChrootActive);
        self.chroot = Some(ChrootEnvironment::enter(&self.ctx.target_root)?);
        self.provisioner()?.configure_chroot(self.chroot()?)
    }

    fn finalize(&mut self) -> Result<(), MirrootError> {
        let chroot = self.chroot()?;
        chroot.run("update-initramfs", ["-c", "-k", "all"])?;

        if let Some(name) = self.ctx.log_path.file_name() {
            let copy = self.ctx.in_target(PathBuf::from(MIRROOT_LOG_DIR).join(name));
            // The copy is a snapshot; the session keeps logging to the original.
            if let Err(e) = files::copy_file_mode(&self.ctx.log_path, &copy, 0o600) {
                warn!("Failed to copy the session log into the new system: {e:?}");
            }
        }
        self.write_recovery_document()
    }

    fn configure_first_boot(&mut self) -> Result<(), MirrootError> {
        let root = &self.ctx.target_root;
        let ticket = bootstrap::arm(root, self.ctx.pool_name(), &self.ctx.root_dataset())?;

        let chroot = self.chroot()?;
        chroot.run("grub-mkconfig", grub_mkconfig::mkconfig_args(GRUB_CFG_PATH))?;
        let config = GrubConfig::read(self.ctx.in_target(GRUB_CFG_PATH))
            .structured(mirroot_api::error::BootstrapError::ReadBootConfig)?;
        bootstrap::verify_armed(&config, &ticket.entry_id)?;
        info!("Boot configuration forces the pool import on first boot");

        let report = sync::sync_esps(&SystemMirrorHost::in_chroot(chroot))?;
        debug!("ESP mirror: {report:?}");
        Ok(())
    }

    fn release_chroot(&mut self) -> Result<(), MirrootError> {
        match self.chroot.as_mut() {
            Some(chroot) => {
                chroot.release()?;
                self.chroot = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn unmount(&mut self) -> Result<(), MirrootError> {
        let target = &self.ctx.target_root;
        let unmount_error = || ConfigurationError::Unmount {
            path: target.display().to_string(),
        };
        let esp_mount = self.ctx.esp_mount_point();
        if findmnt::mounted_at(&esp_mount)
            .structured(unmount_error())?
            .is_some()
        {
            mount::umount_or_detach(&esp_mount).structured(unmount_error())?;
        }
        // Datasets below the target are unmounted by the export.
        Ok(())
    }

    fn export_pools(&mut self) -> Result<(), MirrootError> {
        let outcome = pool::export(self.ops, self.ctx.pool_name())?;
        debug!("Export of '{}': {outcome:?}", self.ctx.pool_name());
        Ok(())
    }
}
