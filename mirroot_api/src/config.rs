use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    constants::{DEFAULT_POOL_NAME, DEFAULT_ROOT_DATASET},
    primitives::bytes::ByteCount,
};

/// Smallest ESP that still formats as FAT32 with room for two bootloaders.
pub const MIN_ESP_SIZE: ByteCount = ByteCount::from_mib(64);

/// Installation parameters. Every field has a default so an empty document is
/// a valid configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallConfiguration {
    #[serde(default)]
    pub storage: StorageConfiguration,

    #[serde(default)]
    pub os: OsConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageConfiguration {
    /// Size of the EFI system partition on each drive.
    #[serde(default = "StorageConfiguration::default_esp_size")]
    pub esp_size: ByteCount,

    /// Size of the swap partition on each drive. Zero disables swap.
    #[serde(default = "StorageConfiguration::default_swap_size")]
    pub swap_size: ByteCount,

    #[serde(default = "StorageConfiguration::default_pool_name")]
    pub pool_name: String,

    /// Name of the root dataset below `<pool>/ROOT`.
    #[serde(default = "StorageConfiguration::default_root_dataset")]
    pub root_dataset: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_datasets: Vec<ExtraDataset>,
}

impl Default for StorageConfiguration {
    fn default() -> Self {
        Self {
            esp_size: Self::default_esp_size(),
            swap_size: Self::default_swap_size(),
            pool_name: Self::default_pool_name(),
            root_dataset: Self::default_root_dataset(),
            extra_datasets: Vec::new(),
        }
    }
}

impl StorageConfiguration {
    fn default_esp_size() -> ByteCount {
        ByteCount::from_gib(1)
    }

    fn default_swap_size() -> ByteCount {
        ByteCount::from_gib(8)
    }

    fn default_pool_name() -> String {
        DEFAULT_POOL_NAME.into()
    }

    fn default_root_dataset() -> String {
        DEFAULT_ROOT_DATASET.into()
    }

    /// Full name of the dataset mounted at `/`.
    pub fn root_dataset_name(&self) -> String {
        format!("{}/ROOT/{}", self.pool_name, self.root_dataset)
    }
}

/// An additional dataset created below the pool and mounted at a fixed path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtraDataset {
    /// Dataset name relative to the pool, e.g. `srv/data`.
    pub name: String,
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OsConfiguration {
    #[serde(default = "OsConfiguration::default_suite")]
    pub suite: String,

    #[serde(default = "OsConfiguration::default_mirror")]
    pub mirror: String,

    #[serde(default = "OsConfiguration::default_timezone")]
    pub timezone: String,

    #[serde(default = "OsConfiguration::default_locale")]
    pub locale: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_packages: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserConfiguration>,
}

impl Default for OsConfiguration {
    fn default() -> Self {
        Self {
            suite: Self::default_suite(),
            mirror: Self::default_mirror(),
            timezone: Self::default_timezone(),
            locale: Self::default_locale(),
            extra_packages: Vec::new(),
            user: None,
        }
    }
}

impl OsConfiguration {
    fn default_suite() -> String {
        "noble".into()
    }

    fn default_mirror() -> String {
        "http://archive.ubuntu.com/ubuntu".into()
    }

    fn default_timezone() -> String {
        "UTC".into()
    }

    fn default_locale() -> String {
        "en_US.UTF-8".into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserConfiguration {
    pub name: String,

    /// Hash in crypt(3) format. The account is locked when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
}

/// Reasons a configuration is rejected.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidConfigurationError {
    #[error("'{hostname}' is not a valid host name")]
    InvalidHostname { hostname: String },
    #[error("'{name}' is not a valid pool name")]
    InvalidPoolName { name: String },
    #[error("'{name}' is not a valid dataset name")]
    InvalidDatasetName { name: String },
    #[error("Mount point '{}' of dataset '{name}' is not absolute", mount_point.display())]
    MountPointNotAbsolute { name: String, mount_point: PathBuf },
    #[error("Mount point '{}' is used more than once", mount_point.display())]
    DuplicateMountPoint { mount_point: PathBuf },
    #[error("EFI system partition size {size} is below the minimum of {minimum}")]
    EspTooSmall { size: String, minimum: String },
    #[error("'{name}' is not a valid user name")]
    InvalidUserName { name: String },
    #[error("'{timezone}' is not a valid timezone")]
    InvalidTimezone { timezone: String },
}

fn hostname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("valid regex")
    })
}

fn dataset_component_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:-]+$").expect("valid regex"))
}

fn user_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"))
}

/// Checks that `hostname` is a single RFC 1123 label.
pub fn validate_hostname(hostname: &str) -> Result<(), InvalidConfigurationError> {
    if hostname_re().is_match(hostname) {
        Ok(())
    } else {
        Err(InvalidConfigurationError::InvalidHostname {
            hostname: hostname.into(),
        })
    }
}

/// Pool names must start with a letter and must not collide with vdev
/// keywords.
pub fn validate_pool_name(name: &str) -> Result<(), InvalidConfigurationError> {
    const RESERVED: [&str; 6] = ["mirror", "raidz", "draid", "spare", "log", "cache"];
    let valid = name.starts_with(|c: char| c.is_ascii_alphabetic())
        && dataset_component_re().is_match(name)
        && !RESERVED.iter().any(|r| name.starts_with(r));
    if valid {
        Ok(())
    } else {
        Err(InvalidConfigurationError::InvalidPoolName { name: name.into() })
    }
}

fn validate_dataset_name(name: &str) -> Result<(), InvalidConfigurationError> {
    if name.split('/').all(|c| dataset_component_re().is_match(c)) {
        Ok(())
    } else {
        Err(InvalidConfigurationError::InvalidDatasetName { name: name.into() })
    }
}

fn validate_timezone(timezone: &str) -> Result<(), InvalidConfigurationError> {
    let path = Path::new(timezone);
    let valid = !timezone.is_empty()
        && path.is_relative()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(InvalidConfigurationError::InvalidTimezone {
            timezone: timezone.into(),
        })
    }
}

impl InstallConfiguration {
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        // An empty file deserializes to unit, not to an empty mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        let storage = &self.storage;
        validate_pool_name(&storage.pool_name)?;
        validate_dataset_name(&storage.root_dataset)?;

        if storage.esp_size < MIN_ESP_SIZE {
            return Err(InvalidConfigurationError::EspTooSmall {
                size: storage.esp_size.to_string(),
                minimum: MIN_ESP_SIZE.to_string(),
            });
        }

        // These are created by mirroot itself.
        let mut mount_points: HashSet<PathBuf> = ["/", "/home", "/var/log", "/boot/efi"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        for dataset in &storage.extra_datasets {
            validate_dataset_name(&dataset.name)?;
            if !dataset.mount_point.is_absolute() {
                return Err(InvalidConfigurationError::MountPointNotAbsolute {
                    name: dataset.name.clone(),
                    mount_point: dataset.mount_point.clone(),
                });
            }
            if !mount_points.insert(dataset.mount_point.clone()) {
                return Err(InvalidConfigurationError::DuplicateMountPoint {
                    mount_point: dataset.mount_point.clone(),
                });
            }
        }

        validate_timezone(&self.os.timezone)?;

        if let Some(user) = &self.os.user {
            if !user_name_re().is_match(&user.name) || user.name == "root" {
                return Err(InvalidConfigurationError::InvalidUserName {
                    name: user.name.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    #[test]
    fn test_defaults() {
        let config = InstallConfiguration::from_yaml("").unwrap();
        assert_eq!(config, InstallConfiguration::default());
        assert_eq!(config.storage.esp_size, ByteCount::from_gib(1));
        assert_eq!(config.storage.swap_size, ByteCount::from_gib(8));
        assert_eq!(config.storage.root_dataset_name(), "rpool/ROOT/ubuntu");
        assert_eq!(config.os.timezone, "UTC");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full() {
        let config = InstallConfiguration::from_yaml(indoc! {r#"
            storage:
              espSize: 512M
              swapSize: 0
              poolName: tank
              rootDataset: jammy
              extraDatasets:
                - name: srv
                  mountPoint: /srv
            os:
              suite: jammy
              timezone: Europe/Berlin
              extraPackages: [vim]
              user:
                name: ops
                sshAuthorizedKeys:
                  - ssh-ed25519 AAAA ops@example
        "#})
        .unwrap();

        assert_eq!(config.storage.esp_size, ByteCount::from_mib(512));
        assert!(config.storage.swap_size.is_zero());
        assert_eq!(config.storage.root_dataset_name(), "tank/ROOT/jammy");
        assert_eq!(config.storage.extra_datasets[0].mount_point, Path::new("/srv"));
        assert_eq!(config.os.locale, "en_US.UTF-8");
        assert_eq!(config.os.user.as_ref().unwrap().name, "ops");
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_fields_rejected() {
        InstallConfiguration::from_yaml("storage:\n  espsize: 1G\n").unwrap_err();
        InstallConfiguration::from_yaml("network: {}\n").unwrap_err();
    }

    #[test]
    fn test_validate_hostname() {
        validate_hostname("zfs-host01").unwrap();
        validate_hostname("a").unwrap();
        let long = "a".repeat(64);
        for bad in ["", "-host", "host-", "host_name", "host.example.com", long.as_str()] {
            assert_eq!(
                validate_hostname(bad).unwrap_err(),
                InvalidConfigurationError::InvalidHostname {
                    hostname: bad.to_string()
                }
            );
        }
    }

    #[test]
    fn test_validate_pool_name() {
        validate_pool_name("rpool").unwrap();
        validate_pool_name("tank_2").unwrap();
        validate_pool_name("1pool").unwrap_err();
        validate_pool_name("mirror0").unwrap_err();
        validate_pool_name("r pool").unwrap_err();
    }

    #[test]
    fn test_validate_rejections() {
        let mut config = InstallConfiguration::default();
        config.storage.esp_size = ByteCount::from_mib(16);
        assert!(matches!(
            config.validate().unwrap_err(),
            InvalidConfigurationError::EspTooSmall { .. }
        ));

        let mut config = InstallConfiguration::default();
        config.storage.extra_datasets.push(ExtraDataset {
            name: "logs".into(),
            mount_point: "/var/log".into(),
        });
        assert_eq!(
            config.validate().unwrap_err(),
            InvalidConfigurationError::DuplicateMountPoint {
                mount_point: "/var/log".into()
            }
        );

        let mut config = InstallConfiguration::default();
        config.storage.extra_datasets.push(ExtraDataset {
            name: "srv".into(),
            mount_point: "srv".into(),
        });
        assert!(matches!(
            config.validate().unwrap_err(),
            InvalidConfigurationError::MountPointNotAbsolute { .. }
        ));

        let mut config = InstallConfiguration::default();
        config.os.timezone = "../etc/passwd".into();
        assert!(matches!(
            config.validate().unwrap_err(),
            InvalidConfigurationError::InvalidTimezone { .. }
        ));

        let mut config = InstallConfiguration::default();
        config.os.user = Some(UserConfiguration {
            name: "root".into(),
            password_hash: None,
            ssh_authorized_keys: vec![],
        });
        assert!(matches!(
            config.validate().unwrap_err(),
            InvalidConfigurationError::InvalidUserName { .. }
        ));
    }
}
