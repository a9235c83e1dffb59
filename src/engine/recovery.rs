//! The recovery document: what an operator needs to finish or undo an
//! installation by hand.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;

use mirroot_api::{
    constants::{ESP_MOUNT_POINT_PATH, FIRSTBOOT_UNIT_NAME, MIRROOT_BINARY_INSTALL_PATH},
    error::{ConfigurationError, MirrootError, ReportError},
};
use osutils::files;

use super::storage::{inspect::DriveSpec, partitioning::RealizedLayout};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDrive {
    pub path: PathBuf,
    pub label: String,
    pub esp: PathBuf,
    pub swap: Option<PathBuf>,
    pub pool: PathBuf,
}

impl RecoveryDrive {
    pub fn new(drive: &DriveSpec, layout: &RealizedLayout) -> Self {
        Self {
            path: drive.path.clone(),
            label: drive.label.clone(),
            esp: layout.esp.clone(),
            swap: layout.swap.clone(),
            pool: layout.pool.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryDocument {
    pub hostname: String,
    pub pool: String,
    pub root_dataset: String,
    pub datasets: Vec<String>,

    /// Volume id shared by every ESP, as `XXXX-XXXX`.
    pub esp_uuid: String,

    pub drives: Vec<RecoveryDrive>,
    pub log_path: PathBuf,
    pub generated_at: DateTime<Utc>,
}

impl RecoveryDocument {
    pub fn render(&self) -> String {
        let mut doc = String::new();
        doc += &format!("# mirroot recovery notes for `{}`\n\n", self.hostname);
        doc += &format!("Generated {}.\n", self.generated_at.to_rfc3339());
        doc += &format!("Session log: `{}`\n\n", self.log_path.display());

        doc += "## Drives\n\n";
        doc += "| Drive | Label | ESP | Swap | Pool |\n";
        doc += "|---|---|---|---|---|\n";
        for drive in &self.drives {
            doc += &format!(
                "| `{}` | `{}` | `{}` | {} | `{}` |\n",
                drive.path.display(),
                drive.label,
                drive.esp.display(),
                drive
                    .swap
                    .as_ref()
                    .map(|s| format!("`{}`", s.display()))
                    .unwrap_or_else(|| "none".into()),
                drive.pool.display()
            );
        }

        doc += &format!("\nEvery ESP is FAT32 with volume id `{}`.\n", self.esp_uuid);
        doc += &format!("\n## Pool `{}`\n\n", self.pool);
        for dataset in &self.datasets {
            doc += &format!("- `{dataset}`\n");
        }

        doc += "\n## Manual commands\n\n";
        doc += "Import the pool from a live system, even if it was last used by another host:\n\n";
        doc += &format!("    zpool import -f -N -R /mnt {}\n", self.pool);
        doc += &format!("    zfs mount {}\n", self.root_dataset);
        doc += "    zfs mount -a\n\n";
        doc += "Mount the ESP:\n\n";
        doc += &format!(
            "    mount UUID={} /mnt{ESP_MOUNT_POINT_PATH}\n\n",
            self.esp_uuid
        );
        doc += "Re-run first-boot validation and cleanup on the installed system:\n\n";
        doc += &format!("    systemctl start {FIRSTBOOT_UNIT_NAME}\n");
        doc += &format!("    {MIRROOT_BINARY_INSTALL_PATH} first-boot\n\n");
        doc += "Copy the primary ESP to every other drive and reinstall the bootloaders:\n\n";
        doc += &format!("    {MIRROOT_BINARY_INSTALL_PATH} sync-esp\n\n");
        doc += "Replace a failed drive:\n\n";
        doc += &format!(
            "    {MIRROOT_BINARY_INSTALL_PATH} replace-drive --failed <member> --new /dev/disk/by-id/<new-drive>\n"
        );
        doc
    }

    pub fn write(&self, path: &Path) -> Result<(), MirrootError> {
        files::write_file(path, 0o600, self.render().as_bytes())
            .structured(ConfigurationError::WriteRecoveryDocument)?;
        info!("Wrote recovery document '{}'", path.display());
        Ok(())
    }
}
