//! Loading the installation configuration and applying command-line
//! overrides on top of it.

use std::path::Path;

use log::{debug, info};

use mirroot_api::{
    config::{self, InstallConfiguration},
    constants::DEFAULT_CONFIG_PATH,
    error::{MirrootError, PreconditionError, ReportError},
};

/// Values given on the command line that take precedence over the file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Overrides {
    pub timezone: Option<String>,
}

/// Reads the configuration from `path`, or from the default location when
/// no path is given. A missing default file means all defaults.
pub fn load(path: Option<&Path>) -> Result<InstallConfiguration, MirrootError> {
    let (path, explicit) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG_PATH), false),
    };
    if !explicit && !path.exists() {
        debug!("No configuration at '{}', using defaults", path.display());
        return Ok(InstallConfiguration::default());
    }

    let contents =
        std::fs::read_to_string(path).structured(PreconditionError::LoadConfiguration {
            path: path.display().to_string(),
        })?;
    let config = InstallConfiguration::from_yaml(&contents)
        .structured(PreconditionError::ParseConfiguration)?;
    info!("Loaded configuration from '{}'", path.display());
    Ok(config)
}

pub fn apply_overrides(config: &mut InstallConfiguration, overrides: &Overrides) {
    if let Some(timezone) = &overrides.timezone {
        debug!("Timezone '{timezone}' from the command line");
        config.os.timezone = timezone.clone();
    }
}

/// Checks the configuration together with the host name of the new system.
pub fn validate(config: &InstallConfiguration, hostname: &str) -> Result<(), MirrootError> {
    config::validate_hostname(hostname)
        .and_then(|()| config.validate())
        .map_err(|e| MirrootError::new(PreconditionError::InvalidConfiguration(e)))
}
