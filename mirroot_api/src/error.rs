use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::config::InvalidConfigurationError;

/// Arguments, drives or configuration were rejected before anything was
/// changed on disk.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum PreconditionError {
    #[error("Failed to load configuration file from '{path}'")]
    LoadConfiguration { path: String },
    #[error("Failed to parse configuration")]
    ParseConfiguration,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] InvalidConfigurationError),
    #[error("Drive '{path}' does not exist or is not a block device")]
    DriveNotFound { path: String },
    #[error("'{path}' is a partition, a whole disk is required")]
    PartitionGiven { path: String },
    #[error("Both drive arguments resolve to the same disk '{path}'")]
    SameDrive { path: String },
    #[error("Failed to inspect drive '{path}'")]
    InspectDrive { path: String },
    #[error("Drive '{path}' is too small: {required} bytes required, {actual} available")]
    DriveTooSmall {
        path: String,
        required: u64,
        actual: u64,
    },
    #[error("Drive '{path}' is mounted or in use at '{mount_point}'")]
    DriveInUse { path: String, mount_point: String },
    #[error("Pool '{pool}' is already imported and does not live on the target drives")]
    PoolExists { pool: String },
    #[error("Operator declined the destructive operation")]
    ConfirmationDeclined,
}

/// The environment mirroot runs in cannot carry out the operation.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionEnvironmentError {
    #[error("Selected operation requires root privileges")]
    MissingRequiredPermissions,
    #[error("Required binary '{binary}' was not found")]
    MissingBinary { binary: &'static str },
    #[error("System is not booted in UEFI mode")]
    NotUefi,
}

/// A step that rewrites drives or pools failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum DestructiveError {
    #[error("Failed to wipe drive '{path}'")]
    WipeDrive { path: String },
    #[error("Failed to partition drive '{path}'")]
    PartitionDrive { path: String },
    #[error("Partition device nodes of '{path}' did not appear in time")]
    PartitionNodesMissing { path: String },
    #[error("Failed to clear stale pool labels")]
    ClearPoolLabels,
    #[error("Failed to create pool '{pool}'")]
    CreatePool { pool: String },
    #[error("Pool '{pool}' is not present after creation")]
    PoolNotPresent { pool: String },
    #[error("Failed to set property on pool '{pool}'")]
    SetPoolProperty { pool: String },
    #[error("Failed to create dataset '{dataset}'")]
    CreateDataset { dataset: String },
    #[error("Pool '{pool}' is still present after every destroy strategy")]
    DestroyPool { pool: String },
    #[error("Failed to export pool '{pool}'")]
    ExportPool { pool: String },
    #[error("Failed to format EFI system partition '{path}'")]
    FormatEsp { path: String },
    #[error("Failed to format swap partition '{path}'")]
    FormatSwap { path: String },
}

/// Installing or configuring the new system failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigurationError {
    #[error("Failed to prepare mount point '{path}'")]
    PrepareMountPoint { path: String },
    #[error("Failed to mount '{path}'")]
    Mount { path: String },
    #[error("Failed to unmount '{path}'")]
    Unmount { path: String },
    #[error("Failed to mount special directory '{dir}' for chroot")]
    ChrootMountSpecialDir { dir: String },
    #[error("Failed to unmount special directory for chroot")]
    ChrootUnmountSpecialDir,
    #[error("Failed to run '{command}' inside the new root")]
    ChrootCommand { command: String },
    #[error("Failed to install the base system")]
    InstallBaseSystem,
    #[error("Failed to configure the new system")]
    ConfigureSystem,
    #[error("Failed to write '{path}'")]
    WriteFile { path: String },
    #[error("Failed to install the bootloader")]
    InstallBootloader,
    #[error("Failed to copy the mirroot binary into the new root")]
    CopyBinary,
    #[error("Failed to write the recovery document")]
    WriteRecoveryDocument,
    #[error("Failed to run '{binary}': {explanation}")]
    CommandFailed {
        binary: &'static str,
        explanation: String,
    },
    #[error("Failed to execute '{binary}'")]
    CommandCouldNotExecute { binary: &'static str },
}

/// The first-boot safety net could not be set up or torn down.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapError {
    #[error("Failed to write the first-boot menu script")]
    WriteMenuScript,
    #[error("Failed to write the first-boot default selection")]
    WriteDefaults,
    #[error("Failed to write the bootstrap ticket")]
    WriteTicket,
    #[error("Failed to read the bootstrap ticket")]
    ReadTicket,
    #[error("Failed to write the first-boot agent unit")]
    WriteAgentUnit,
    #[error("Failed to enable the first-boot agent")]
    EnableAgent,
    #[error("Failed to regenerate the boot configuration")]
    RegenerateBootConfig,
    #[error("Failed to read the boot configuration")]
    ReadBootConfig,
    #[error("Regenerated boot configuration has no forced-import entry '{entry}'")]
    ForcedImportEntryMissing { entry: String },
    #[error("Regenerated boot configuration still forces pool import")]
    ForcedImportStillPresent,
    #[error("Failed to remove first-boot artifacts")]
    RemoveArtifacts,
    #[error("Failed to disable the first-boot agent")]
    DisableAgent,
    #[error("Failed to schedule the reboot")]
    ScheduleReboot,
}

/// The first-boot agent refused to retract the safety net.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum FirstBootValidationError {
    #[error("No bootstrap ticket is open")]
    NoTicket,
    #[error("Pool '{pool}' is not imported")]
    PoolMissing { pool: String },
    #[error("Root filesystem is not mounted from pool '{pool}'")]
    RootNotMounted { pool: String },
    #[error("EFI system partition is not mounted at '{path}'")]
    EspNotMounted { path: String },
    #[error("Write probe in '{path}' failed")]
    WriteProbe { path: String },
}

/// Mirror maintenance failed or was refused.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SynchronizationError {
    #[error("Failed to query pool '{pool}'")]
    QueryPool { pool: String },
    #[error("No EFI system partition is mounted at '{path}'")]
    NoPrimaryEsp { path: String },
    #[error("Failed to discover EFI system partitions of the mirror")]
    DiscoverMembers,
    #[error("Failed to synchronize EFI system partition '{target}'")]
    SyncEsp { target: String },
    #[error("EFI system partition '{target}' differs from the primary after synchronization")]
    EspDrift { target: String },
    #[error("Failed to install the bootloader as '{label}'")]
    InstallBootloader { label: String },
    #[error("Pool member '{member}' is '{state}', refusing to replace a healthy member")]
    MemberNotFailed { member: String, state: String },
    #[error("Pool has no surviving member to copy the layout from")]
    NoSurvivor,
    #[error("Failed to substitute '{new}' into the pool")]
    ReplaceMember { new: String },
    #[error("Resilver onto '{new}' did not start")]
    ResilverNotStarted { new: String },
    #[error("Failed to update references to the replaced drive")]
    UpdateReferences,
}

/// An operator interrupt stopped the session.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptedError {
    #[error("Session interrupted by signal")]
    Signal,
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Caught panic: {0}")]
    Panic(String),
    #[error("Device path must not be empty")]
    EmptyDevicePath,
    #[error("Invalid session transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },
    #[error("Failed to persist the session record")]
    PersistSessionRecord,
}

/// Each variant of `ErrorKind` is one failure category. The category decides
/// the exit code and what the operator is told.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// Bad arguments, drives or configuration. Nothing was changed.
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// Missing privileges or tools. Nothing was changed.
    #[error(transparent)]
    ExecutionEnvironment(#[from] ExecutionEnvironmentError),

    /// Partitioning or pool manipulation failed.
    #[error(transparent)]
    Destructive(#[from] DestructiveError),

    /// Installing or configuring the new system failed.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The first-boot safety net could not be proven in place, or could not be
    /// removed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// First boot did not validate. The forced import stays armed.
    #[error(transparent)]
    FirstBootValidation(#[from] FirstBootValidationError),

    /// Mirror drift or an unsafe replacement request.
    #[error(transparent)]
    Synchronization(#[from] SynchronizationError),

    #[error(transparent)]
    Interrupted(#[from] InterruptedError),

    /// A bug in mirroot.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl ErrorKind {
    /// True for failures that are guaranteed to have happened before anything
    /// was written to a drive.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ErrorKind::Precondition(_) | ErrorKind::ExecutionEnvironment(_)
        )
    }
}

#[derive(Debug)]
struct MirrootErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct MirrootError(Box<MirrootErrorInner>);
impl MirrootError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        MirrootError(Box::new(MirrootErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        MirrootError(Box::new(MirrootErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn internal(msg: &'static str) -> Self {
        Self::new(InternalError::Internal(msg))
    }

    #[track_caller]
    pub fn secondary_error_context(mut self, secondary: MirrootError) -> Self {
        self.0.context.push((format!(
            "While handling the error, an additional error was caught: \n\n{secondary:?}\n\nThe earlier error:"
        ).into(), Location::caller()));
        self
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured MirrootError.
    fn structured(self, kind: K) -> Result<T, MirrootError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, MirrootError> {
        match self {
            Some(t) => Ok(t),
            None => Err(MirrootError::new(kind)),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, MirrootError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(MirrootError::with_source(kind, e.into())),
        }
    }
}

pub trait MirrootResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, MirrootError>;

    /// Convert the error into an unstructured error.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}

impl<T> MirrootResultExt<T> for Result<T, MirrootError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, MirrootError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Serialize for MirrootError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("mirroot-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Precondition(ref e) => state.serialize_field("error", e)?,
            ErrorKind::ExecutionEnvironment(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Destructive(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Configuration(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Bootstrap(ref e) => state.serialize_field("error", e)?,
            ErrorKind::FirstBootValidation(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Synchronization(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Interrupted(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{:?}", e)))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for MirrootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            let mut index = 0;
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use serde_yaml::Value;

    use super::*;

    #[test]
    fn test_error_serialize() {
        let e = std::fs::read("/non-existent-file")
            .context("failed to read file")
            .structured(PreconditionError::LoadConfiguration {
                path: "/non-existent-file".into(),
            })
            .unwrap_err();
        match serde_yaml::to_value(e).unwrap() {
            Value::Mapping(m) => {
                assert_eq!(m.len(), 5);
                assert_eq!(m["category"], Value::String("precondition".into()));
                assert!(matches!(m["cause"], Value::String(_)));
                assert_eq!(
                    m["message"],
                    Value::String(
                        "Failed to load configuration file from '/non-existent-file'".into()
                    )
                );
                match m["location"] {
                    Value::String(ref s) => assert!(s.contains("error.rs:")),
                    _ => panic!("location isn't string"),
                }
            }
            _ => panic!("value isn't mapping"),
        }
    }

    #[test]
    fn test_error_debug() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(InternalError::Internal("w"))
            .unwrap_err();
        assert_eq!(
            format!("{:?}", error),
            format!(
                "Internal error: w at {}:{}\n\nCaused by:\n    0: x\n       y\n    1: z\n",
                error.0.location.file(),
                error.0.location.line(),
            ),
        );
    }

    #[test]
    fn test_message_context() {
        let error = Err::<(), _>(MirrootError::new(BootstrapError::WriteTicket))
            .message("Failed to arm first boot")
            .unwrap_err();
        let rendered = format!("{error:?}");
        assert!(rendered.starts_with("Failed to write the bootstrap ticket at "));
        assert!(rendered.contains("Context:\n    0: Failed to arm first boot at "));
    }

    #[test]
    fn test_precondition_category() {
        assert!(MirrootError::new(PreconditionError::ConfirmationDeclined)
            .kind()
            .is_precondition());
        assert!(
            MirrootError::new(ExecutionEnvironmentError::MissingRequiredPermissions)
                .kind()
                .is_precondition()
        );
        assert!(!MirrootError::new(DestructiveError::ClearPoolLabels)
            .kind()
            .is_precondition());
        assert_eq!(
            <&str>::from(MirrootError::new(InterruptedError::Signal).kind()),
            "interrupted"
        );
    }
}
