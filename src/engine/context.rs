use std::path::{Path, PathBuf};

use mirroot_api::{
    config::InstallConfiguration,
    constants::{RECOVERY_DOCUMENT_PATH, TARGET_ROOT_PATH},
};
use osutils::path::join_relative;

use super::boot::esp;

/// Everything an installation session is asked to do, fixed before the
/// session starts.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub config: InstallConfiguration,

    /// Host name of the new system. Also seeds the ESP volume id.
    pub hostname: String,

    /// The two drives as given on the command line.
    pub drives: [PathBuf; 2],

    /// Destroy pools and signatures found on the drives before partitioning.
    pub prewipe: bool,

    /// Skip interactive confirmations.
    pub assume_yes: bool,

    /// Where the new root is assembled.
    pub target_root: PathBuf,

    /// Log of the running session, copied into the new system.
    pub log_path: PathBuf,

    /// The running mirroot executable.
    pub binary: PathBuf,
}

impl EngineContext {
    pub fn new(
        config: InstallConfiguration,
        hostname: String,
        drives: [PathBuf; 2],
        log_path: PathBuf,
        binary: PathBuf,
    ) -> Self {
        Self {
            config,
            hostname,
            drives,
            prewipe: false,
            assume_yes: false,
            target_root: TARGET_ROOT_PATH.into(),
            log_path,
            binary,
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.config.storage.pool_name
    }

    /// Full name of the dataset mounted at `/`.
    pub fn root_dataset(&self) -> String {
        self.config.storage.root_dataset_name()
    }

    pub fn volume_id(&self) -> String {
        esp::volume_id(&self.hostname)
    }

    pub fn volume_uuid(&self) -> String {
        esp::volume_uuid(&self.hostname)
    }

    pub fn esp_mount_point(&self) -> PathBuf {
        esp::primary_mount_point(&self.target_root)
    }

    /// Recovery document locations: the installer's and the new system's.
    pub fn recovery_document_paths(&self) -> [PathBuf; 2] {
        [
            PathBuf::from(RECOVERY_DOCUMENT_PATH),
            join_relative(&self.target_root, RECOVERY_DOCUMENT_PATH),
        ]
    }

    pub fn in_target(&self, path: impl AsRef<Path>) -> PathBuf {
        join_relative(&self.target_root, path)
    }
}
