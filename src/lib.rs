use std::path::Path;

use log::{error, info, warn};

use mirroot_api::{
    error::{ConfigurationError, ErrorKind, MirrootError, MirrootResultExt, ReportError},
    status::InstallState,
};
use osutils::dependencies::Dependency;

pub mod cli;
mod config;
mod engine;
mod logging;
pub mod validation;

use cli::Commands;
use engine::{
    boot::agent::{self, SystemFirstBootHost},
    context::EngineContext,
    install::SystemInstallSteps,
    mirror::{
        replace,
        sync::{self, SystemMirrorHost},
    },
    session::{InstallSteps, Session},
    status,
    storage::{
        self,
        inspect::{DriveSpec, SystemDisks},
        pool::ZfsTools,
    },
};

pub use engine::interrupt::InterruptFlag;
pub use logging::{
    multilog::MultiLogger,
    session_log::{session_log_path, SessionLog},
};

/// Mirroot version as provided by environment variables at build time
pub const MIRROOT_VERSION: &str = match option_env!("MIRROOT_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Done = 0,
    SetupFailed = 1,
    /// Nothing was changed.
    PreconditionFailed = 2,
    /// Something was changed; the recovery document and log stay in place.
    Failed = 3,
    /// First boot did not validate; the forced import stays armed.
    FirstBootBlocked = 4,
}

impl ExitKind {
    pub fn for_error(error: &MirrootError) -> Self {
        match error.kind() {
            kind if kind.is_precondition() => ExitKind::PreconditionFailed,
            ErrorKind::FirstBootValidation(_) => ExitKind::FirstBootBlocked,
            _ => ExitKind::Failed,
        }
    }
}

/// What happens to the new system once installation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Completion {
    /// Release the chroot, unmount and export the pool.
    Finalize,
    /// Release the chroot only.
    KeepMounted,
    Ask,
}

impl Completion {
    fn from_flags(finalize: bool, keep_mounted: bool, assume_yes: bool) -> Self {
        if keep_mounted {
            Completion::KeepMounted
        } else if finalize || assume_yes {
            Completion::Finalize
        } else {
            Completion::Ask
        }
    }
}

/// Runs one mirroot command. `log_path` is the session log of this run.
pub fn run(command: &Commands, log_path: &Path, interrupt: InterruptFlag) -> Result<(), MirrootError> {
    info!("Mirroot version: {MIRROOT_VERSION}");
    match command {
        Commands::Install {
            hostname,
            drive_a,
            drive_b,
            config: config_path,
            prewipe,
            timezone,
            yes,
            finalize,
            keep_mounted,
            error,
        } => {
            let res = (|| -> Result<(), MirrootError> {
                let mut config = config::load(config_path.as_deref())?;
                config::apply_overrides(
                    &mut config,
                    &config::Overrides {
                        timezone: timezone.clone(),
                    },
                );
                let binary = std::env::current_exe().structured(ConfigurationError::CopyBinary)?;
                let mut ctx = EngineContext::new(
                    config,
                    hostname.clone(),
                    [drive_a.clone(), drive_b.clone()],
                    log_path.to_path_buf(),
                    binary,
                );
                ctx.prewipe = *prewipe;
                ctx.assume_yes = *yes;
                install(
                    &ctx,
                    interrupt,
                    Completion::from_flags(*finalize, *keep_mounted, *yes),
                )
            })();

            if let (Some(error_path), Err(e)) = (error, &res) {
                write_error(error_path, e);
            }
            res
        }

        Commands::Wipe {
            drive_a,
            drive_b,
            yes,
        } => wipe(drive_a, drive_b, *yes),

        Commands::FirstBoot => {
            let phase = agent::run(&SystemFirstBootHost)?;
            info!("First boot finished in phase '{phase}'");
            Ok(())
        }

        Commands::SyncEsp => {
            validation::check_root()?;
            validation::check_dependencies(Dependency::SYNC)?;
            let report = sync::sync_esps(&SystemMirrorHost::running())?;
            info!(
                "ESP '{}' replicated to {} member(s)",
                report.primary.device.display(),
                report.targets.len()
            );
            Ok(())
        }

        Commands::ReplaceDrive {
            failed,
            new,
            pool,
            yes,
        } => replace_drive(failed, new, pool.as_deref(), *yes),

        Commands::Status { pool } => {
            let pool = match pool {
                Some(pool) => pool.clone(),
                None => config::load(None)?.storage.pool_name,
            };
            let report = status::collect(&ZfsTools, &SystemMirrorHost::running(), &pool)?;
            let yaml = serde_yaml::to_string(&report)
                .structured(mirroot_api::error::InternalError::Internal(
                    "Failed to serialize the status report",
                ))?;
            print!("{yaml}");
            Ok(())
        }
    }
}

fn install(
    ctx: &EngineContext,
    interrupt: InterruptFlag,
    completion: Completion,
) -> Result<(), MirrootError> {
    let mut session = Session::new(
        "install",
        Some(ctx.hostname.clone()),
        ctx.drives.to_vec(),
        &ctx.log_path,
        interrupt,
    )
    .with_record();

    let disks = SystemDisks;
    let ops = ZfsTools;
    let mut steps = SystemInstallSteps::new(ctx, &disks, &ops);

    if let Err(e) = session.run(&mut steps) {
        let checkpoint = session.state();
        error!(
            "Installation stopped after checkpoint '{checkpoint}'. Session log: '{}'",
            session.log_path().display()
        );
        // The failed step is the one after the last checkpoint.
        let [installer, _] = ctx.recovery_document_paths();
        if checkpoint.next().is_some_and(InstallState::is_destructive) && installer.exists() {
            error!("Recovery instructions: '{}'", installer.display());
        }
        return Err(e);
    }

    info!("Installation of '{}' completed", ctx.hostname);
    let completion = match completion {
        Completion::Ask => {
            if validation::ask_yes_no(
                &format!(
                    "Unmount '{}' and export pool '{}' now?",
                    ctx.target_root.display(),
                    ctx.pool_name()
                ),
                true,
            ) {
                Completion::Finalize
            } else {
                Completion::KeepMounted
            }
        }
        other => other,
    };

    steps.release_chroot()?;
    match completion {
        Completion::Finalize => {
            steps.unmount()?;
            steps.export_pools()?;
            info!("Pool '{}' exported, the system is ready to boot", ctx.pool_name());
        }
        _ => info!(
            "New system left mounted at '{}'; export pool '{}' before rebooting",
            ctx.target_root.display(),
            ctx.pool_name()
        ),
    }
    Ok(())
}

fn wipe(drive_a: &Path, drive_b: &Path, assume_yes: bool) -> Result<(), MirrootError> {
    validation::check_root()?;
    validation::check_dependencies(Dependency::WIPE)?;

    let disks = SystemDisks;
    let ops = ZfsTools;
    let (a, b) = DriveSpec::capture_pair(&disks, drive_a, drive_b)?;
    let summary: Vec<String> = [&a, &b]
        .iter()
        .map(|d| format!("Wiping {} ({}, {})", d.path.display(), d.label, d.size))
        .collect();
    validation::confirm_destruction(&summary, "wipe", assume_yes)?;

    storage::wipe_drives(&disks, &ops, &[&a, &b])?;
    info!("Drives wiped");
    Ok(())
}

fn replace_drive(
    failed: &str,
    new: &Path,
    pool: Option<&str>,
    assume_yes: bool,
) -> Result<(), MirrootError> {
    validation::check_root()?;
    validation::check_dependencies(Dependency::REPLACE)?;

    let pool = match pool {
        Some(pool) => pool.to_string(),
        None => config::load(None)?.storage.pool_name,
    };
    let disks = SystemDisks;
    let ops = ZfsTools;
    let new = DriveSpec::capture(&disks, new)?;
    validation::confirm_destruction(
        &[format!(
            "Replacing '{failed}' in pool '{pool}' with {} ({}, {})",
            new.path.display(),
            new.label,
            new.size
        )],
        "replace",
        assume_yes,
    )?;

    let outcome = replace::replace_drive(&disks, &ops, &pool, failed, &new)?;
    info!("Partitions of '{}': {:?}", new.path.display(), outcome.layout);

    // The new ESP is blank until the mirror is synced onto it.
    let report = sync::sync_esps(&SystemMirrorHost::running())
        .message("Drive replaced but its ESP could not be synchronized")?;
    info!("ESP replicated to {} member(s)", report.targets.len());

    if let (Some(number), Some(swap)) = (outcome.swap_number, &outcome.layout.swap) {
        replace::update_swap_reference(Path::new("/"), &outcome.replaced, number, swap)?;
    }
    info!(
        "Resilver of pool '{pool}' is running: {}",
        outcome.scan.as_deref().unwrap_or("see 'zpool status'")
    );
    Ok(())
}

/// Writes `error` as YAML to `path` for whoever started mirroot.
fn write_error(path: &Path, error: &MirrootError) {
    let yaml = match serde_yaml::to_string(error) {
        Ok(yaml) => yaml,
        Err(e) => {
            warn!("Failed to serialize error: {e}");
            return;
        }
    };
    if let Err(e) = std::fs::write(path, yaml) {
        error!("Failed to write error to file: {e}");
    }
}
