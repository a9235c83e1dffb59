//! The first-boot safety net: a forced-import boot entry that only exists
//! while a ticket is open and the agent that retracts it is enabled.

use std::path::Path;

use chrono::Utc;
use log::{debug, info};

use mirroot_api::{
    constants::{
        FIRSTBOOT_ENTRY_ID, FIRSTBOOT_GRUB_DEFAULTS_NAME, FIRSTBOOT_GRUB_SCRIPT_PATH,
        FIRSTBOOT_TICKET_PATH, FIRSTBOOT_UNIT_NAME, FORCE_IMPORT_PARAM,
        GRUB_DEFAULTS_PATH, SYSTEMD_UNIT_DIR,
    },
    error::{BootstrapError, MirrootError, ReportError},
    status::BootstrapTicket,
};
use osutils::{
    files,
    grub::GrubConfig,
    grub_mkconfig::{self, GrubMkConfigScript},
    path::join_relative,
    systemd,
};

use super::templates::{FirstBootMenuScript, FirstBootUnit};

const FIRSTBOOT_ENTRY_TITLE: &str = "First boot (forced pool import)";

/// Issues a ticket for the system at `root`: writes every artifact and
/// enables the agent. The caller regenerates the boot configuration and
/// checks it with `verify_armed`.
pub fn arm(root: &Path, pool: &str, root_dataset: &str) -> Result<BootstrapTicket, MirrootError> {
    let prior_default = grub_mkconfig::read_default(join_relative(root, GRUB_DEFAULTS_PATH))
        .structured(BootstrapError::WriteDefaults)?;
    let ticket = BootstrapTicket {
        pool: pool.into(),
        root_dataset: root_dataset.into(),
        entry_id: FIRSTBOOT_ENTRY_ID.into(),
        prior_default,
        created_at: Utc::now(),
    };

    write_artifacts(root, &ticket)?;
    systemd::enable_offline(root, FIRSTBOOT_UNIT_NAME).structured(BootstrapError::EnableAgent)?;
    info!("Bootstrap ticket issued for pool '{pool}'");
    Ok(ticket)
}

/// Writes the menu script, the defaults fragment selecting its entry, the
/// agent unit and the ticket itself, in that order.
pub fn write_artifacts(root: &Path, ticket: &BootstrapTicket) -> Result<(), MirrootError> {
    let script = FirstBootMenuScript {
        entry_id: ticket.entry_id.clone(),
        title: FIRSTBOOT_ENTRY_TITLE.into(),
        pool: ticket.pool.clone(),
        root_dataset: ticket.root_dataset.clone(),
    };
    files::write_file(
        join_relative(root, FIRSTBOOT_GRUB_SCRIPT_PATH),
        0o755,
        script.render().as_bytes(),
    )
    .structured(BootstrapError::WriteMenuScript)?;

    let mut defaults = GrubMkConfigScript::new(FIRSTBOOT_GRUB_DEFAULTS_NAME).with_root(root);
    defaults.set_default(&ticket.entry_id);
    defaults.write().structured(BootstrapError::WriteDefaults)?;

    let unit = FirstBootUnit::default();
    files::write_file(
        join_relative(root, Path::new(SYSTEMD_UNIT_DIR).join(unit.name())),
        0o644,
        unit.render().as_bytes(),
    )
    .structured(BootstrapError::WriteAgentUnit)?;

    let yaml = serde_yaml::to_string(ticket).structured(BootstrapError::WriteTicket)?;
    files::write_file_atomic(
        join_relative(root, FIRSTBOOT_TICKET_PATH),
        0o644,
        yaml.as_bytes(),
    )
    .structured(BootstrapError::WriteTicket)
}

pub fn read_ticket(root: &Path) -> Result<Option<BootstrapTicket>, MirrootError> {
    let path = join_relative(root, FIRSTBOOT_TICKET_PATH);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).structured(BootstrapError::ReadTicket)?;
    serde_yaml::from_str(&contents)
        .structured(BootstrapError::ReadTicket)
        .map(Some)
}

/// Fails unless the regenerated configuration carries the forced-import entry
/// with the force parameter on its kernel command line.
pub fn verify_armed(config: &GrubConfig, entry_id: &str) -> Result<(), MirrootError> {
    match config.entry(entry_id) {
        Some(entry) if entry.has_param(FORCE_IMPORT_PARAM) => {
            debug!("Boot entry '{entry_id}' forces the pool import");
            Ok(())
        }
        _ => Err(MirrootError::new(BootstrapError::ForcedImportEntryMissing {
            entry: entry_id.into(),
        })),
    }
}

/// Fails while any entry still forces the import.
pub fn verify_reverted(config: &GrubConfig, entry_id: &str) -> Result<(), MirrootError> {
    if config.entry(entry_id).is_some() || !config.entries_with_param(FORCE_IMPORT_PARAM).is_empty()
    {
        return Err(MirrootError::new(BootstrapError::ForcedImportStillPresent));
    }
    Ok(())
}

/// Removes the menu script and the defaults fragment. With the fragment gone
/// `GRUB_DEFAULT` falls back to the selection recorded in the ticket.
pub fn retract_menu(root: &Path) -> Result<(), MirrootError> {
    let fragment = GrubMkConfigScript::new(FIRSTBOOT_GRUB_DEFAULTS_NAME).with_root(root);
    for path in [
        join_relative(root, FIRSTBOOT_GRUB_SCRIPT_PATH),
        fragment.file_path(),
    ] {
        if files::remove_file_if_exists(&path).structured(BootstrapError::RemoveArtifacts)? {
            debug!("Removed '{}'", path.display());
        }
    }
    Ok(())
}

pub fn remove_ticket(root: &Path) -> Result<(), MirrootError> {
    files::remove_file_if_exists(join_relative(root, FIRSTBOOT_TICKET_PATH))
        .structured(BootstrapError::RemoveArtifacts)
        .map(|_| ())
}
