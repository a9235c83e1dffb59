use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, IntoStaticStr};

/// Checkpoints of an installation session, in the only order they may be
/// reached.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, EnumIter,
    Display, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstallState {
    Starting,
    Validating,
    Preparing,
    Partitioning,
    PoolsCreating,
    PoolsCreatingDatasets,
    ConfiguringSystem,
    ChrootConfiguration,
    Finalizing,
    ConfiguringFirstBoot,
    Completed,
}

impl InstallState {
    /// The checkpoint that directly follows this one.
    pub fn next(self) -> Option<Self> {
        Self::iter().skip_while(|s| *s != self).nth(1)
    }

    /// Whether reaching this checkpoint means drives may already have been
    /// modified.
    pub fn is_destructive(self) -> bool {
        self >= InstallState::Partitioning
    }
}

/// A resource held by a session that must be released on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LedgerResource {
    PoolsCreated,
    MountsActive,
    ChrootActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOutcome {
    InProgress,
    Failed,
    Interrupted,
    Completed,
}

/// Persisted next to the session log after every checkpoint so an operator can
/// see where an interrupted or crashed session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default)]
    pub drives: Vec<PathBuf>,

    pub last_checkpoint: InstallState,

    pub outcome: SessionOutcome,

    /// Resources held at the time of writing, in acquisition order.
    #[serde(default)]
    pub ledger: Vec<LedgerResource>,

    pub log_path: PathBuf,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Marker describing an armed first-boot safety net. Its presence on disk,
/// together with an enabled agent, is what makes the forced-import entry
/// appear in the boot menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BootstrapTicket {
    pub pool: String,

    /// Dataset mounted at `/`.
    pub root_dataset: String,

    /// Menu entry id of the forced-import entry.
    pub entry_id: String,

    /// `GRUB_DEFAULT` in effect before the ticket was issued, if any was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_default: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Phases of the first-boot protocol as seen by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FirstBootPhase {
    Configured,
    BootedWithForce,
    Validated,
    Reverted,
    SteadyState,
}

/// Output of `mirroot status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolReport>,

    #[serde(default)]
    pub esp_members: Vec<EspMemberReport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_ticket: Option<BootstrapTicket>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolReport {
    pub name: String,
    pub health: String,
    pub members: Vec<PoolMemberReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMemberReport {
    pub device: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspMemberReport {
    pub device: PathBuf,
    pub label: String,
    pub primary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        let states: Vec<InstallState> = InstallState::iter().collect();
        assert_eq!(states.first(), Some(&InstallState::Starting));
        assert_eq!(states.last(), Some(&InstallState::Completed));
        for pair in states.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(InstallState::Completed.next(), None);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(InstallState::PoolsCreatingDatasets.to_string(), "pools_creating_datasets");
        assert_eq!(
            serde_yaml::to_string(&InstallState::ConfiguringFirstBoot).unwrap(),
            "configuring_first_boot\n"
        );
        assert_eq!(LedgerResource::ChrootActive.to_string(), "chroot-active");
    }

    #[test]
    fn test_destructive_boundary() {
        assert!(!InstallState::Preparing.is_destructive());
        assert!(InstallState::Partitioning.is_destructive());
        assert!(InstallState::Completed.is_destructive());
    }

    #[test]
    fn test_ticket_yaml() {
        let ticket = BootstrapTicket {
            pool: "rpool".into(),
            root_dataset: "rpool/ROOT/ubuntu".into(),
            entry_id: "mirroot-firstboot".into(),
            prior_default: None,
            created_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let yaml = serde_yaml::to_string(&ticket).unwrap();
        assert!(!yaml.contains("priorDefault"));
        assert_eq!(serde_yaml::from_str::<BootstrapTicket>(&yaml).unwrap(), ticket);
    }
}
