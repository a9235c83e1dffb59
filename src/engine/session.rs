//! Installation session: a linear sequence of checkpoints plus a ledger of
//! resources to give back when the session does not complete.

use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, error, info, warn};

use mirroot_api::{
    error::{ErrorKind, InternalError, MirrootError, ReportError},
    status::{InstallState, LedgerResource, SessionOutcome, SessionRecord},
};
use osutils::files;

use super::interrupt::InterruptFlag;

/// Resources a session holds, in acquisition order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ledger {
    pools_created: bool,
    mounts_active: bool,
    chroot_active: bool,
}

impl Ledger {
    pub fn acquire(&mut self, resource: LedgerResource) {
        debug!("Ledger: acquired {resource}");
        *self.slot(resource) = true;
    }

    pub fn release(&mut self, resource: LedgerResource) {
        debug!("Ledger: released {resource}");
        *self.slot(resource) = false;
    }

    pub fn holds(&self, resource: LedgerResource) -> bool {
        match resource {
            LedgerResource::PoolsCreated => self.pools_created,
            LedgerResource::MountsActive => self.mounts_active,
            LedgerResource::ChrootActive => self.chroot_active,
        }
    }

    pub fn pools_created(&self) -> bool {
        self.pools_created
    }

    pub fn mounts_active(&self) -> bool {
        self.mounts_active
    }

    pub fn chroot_active(&self) -> bool {
        self.chroot_active
    }

    /// Held resources in acquisition order.
    pub fn held(&self) -> Vec<LedgerResource> {
        [
            LedgerResource::PoolsCreated,
            LedgerResource::MountsActive,
            LedgerResource::ChrootActive,
        ]
        .into_iter()
        .filter(|r| self.holds(*r))
        .collect()
    }

    fn slot(&mut self, resource: LedgerResource) -> &mut bool {
        match resource {
            LedgerResource::PoolsCreated => &mut self.pools_created,
            LedgerResource::MountsActive => &mut self.mounts_active,
            LedgerResource::ChrootActive => &mut self.chroot_active,
        }
    }
}

/// The component calls behind each checkpoint, plus the release of every
/// ledgered resource.
///
/// A step that acquires a resource marks it in `ledger` as soon as it holds
/// it, before doing anything else that could fail.
pub trait InstallSteps {
    fn validate(&mut self) -> Result<(), MirrootError>;
    fn prepare(&mut self) -> Result<(), MirrootError>;
    fn partition(&mut self) -> Result<(), MirrootError>;
    fn create_pools(&mut self, ledger: &mut Ledger) -> Result<(), MirrootError>;
    fn create_datasets(&mut self, ledger: &mut Ledger) -> Result<(), MirrootError>;
    fn configure_system(&mut self) -> Result<(), MirrootError>;
    fn configure_chroot(&mut self, ledger: &mut Ledger) -> Result<(), MirrootError>;
    fn finalize(&mut self) -> Result<(), MirrootError>;
    fn configure_first_boot(&mut self) -> Result<(), MirrootError>;

    fn release_chroot(&mut self) -> Result<(), MirrootError>;
    fn unmount(&mut self) -> Result<(), MirrootError>;
    fn export_pools(&mut self) -> Result<(), MirrootError>;
}

pub struct Session {
    state: InstallState,
    ledger: Ledger,
    interrupt: InterruptFlag,
    record: SessionRecord,
    record_path: Option<PathBuf>,
}

impl Session {
    pub fn new(
        command: &str,
        hostname: Option<String>,
        drives: Vec<PathBuf>,
        log_path: &Path,
        interrupt: InterruptFlag,
    ) -> Self {
        let now = Utc::now();
        Session {
            state: InstallState::Starting,
            ledger: Ledger::default(),
            interrupt,
            record: SessionRecord {
                command: command.into(),
                hostname,
                drives,
                last_checkpoint: InstallState::Starting,
                outcome: SessionOutcome::InProgress,
                ledger: Vec::new(),
                log_path: log_path.to_path_buf(),
                started_at: now,
                updated_at: now,
            },
            record_path: None,
        }
    }

    /// Persists the session record next to the session log after every
    /// checkpoint.
    pub fn with_record(mut self) -> Self {
        self.record_path = Some(self.record.log_path.with_extension("session.yaml"));
        self
    }

    pub fn state(&self) -> InstallState {
        self.state
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn log_path(&self) -> &Path {
        &self.record.log_path
    }

    pub fn record_path(&self) -> Option<&Path> {
        self.record_path.as_deref()
    }

    /// Moves to `to`, which must directly follow the current checkpoint.
    pub fn advance(&mut self, to: InstallState) -> Result<(), MirrootError> {
        if self.state.next() != Some(to) {
            return Err(MirrootError::new(InternalError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            }));
        }
        info!("Checkpoint: {to}");
        self.state = to;
        self.persist(SessionOutcome::InProgress);
        Ok(())
    }

    /// Drives `steps` from the current checkpoint to `completed`.
    ///
    /// Any error or interrupt unwinds the ledger in reverse acquisition order
    /// before returning. The session stays at the last checkpoint it reached.
    pub fn run(&mut self, steps: &mut dyn InstallSteps) -> Result<(), MirrootError> {
        let mut scope = CleanupScope {
            session: self,
            steps,
            armed: true,
        };

        match scope.session.drive(scope.steps) {
            Ok(()) => {
                scope.armed = false;
                let session = &mut *scope.session;
                // Completion hands every resource over to the caller.
                session.ledger = Ledger::default();
                session.persist(SessionOutcome::Completed);
                info!("Session completed");
                Ok(())
            }
            Err(e) => Err(scope.fail(e)),
        }
    }

    fn drive(&mut self, steps: &mut dyn InstallSteps) -> Result<(), MirrootError> {
        while let Some(next) = self.state.next() {
            self.interrupt.check()?;
            debug!("Running step for '{next}'");
            match next {
                InstallState::Starting => {}
                InstallState::Validating => steps.validate()?,
                InstallState::Preparing => steps.prepare()?,
                InstallState::Partitioning => steps.partition()?,
                InstallState::PoolsCreating => steps.create_pools(&mut self.ledger)?,
                InstallState::PoolsCreatingDatasets => steps.create_datasets(&mut self.ledger)?,
                InstallState::ConfiguringSystem => steps.configure_system()?,
                InstallState::ChrootConfiguration => steps.configure_chroot(&mut self.ledger)?,
                InstallState::Finalizing => steps.finalize()?,
                InstallState::ConfiguringFirstBoot => steps.configure_first_boot()?,
                InstallState::Completed => {}
            }
            // A step that was killed by the signal fails on its own; one that
            // finished still must not be followed by the next.
            self.interrupt.check()?;
            self.advance(next)?;
        }
        Ok(())
    }

    /// Releases every held resource: chroot binds, then mounts, then pools.
    /// Every release is attempted; the first failure is returned.
    pub fn unwind(&mut self, steps: &mut dyn InstallSteps) -> Result<(), MirrootError> {
        let held = self.ledger.held();
        if held.is_empty() {
            return Ok(());
        }
        info!(
            "Releasing {}",
            held.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut first_error: Option<MirrootError> = None;
        for resource in held.into_iter().rev() {
            let result = match resource {
                LedgerResource::ChrootActive => steps.release_chroot(),
                LedgerResource::MountsActive => steps.unmount(),
                LedgerResource::PoolsCreated => steps.export_pools(),
            };
            match result {
                Ok(()) => self.ledger.release(resource),
                Err(e) => {
                    error!("Failed to release {resource}: {e:?}");
                    first_error = Some(match first_error {
                        Some(first) => first.secondary_error_context(e),
                        None => e,
                    });
                }
            }
        }
        self.persist(SessionOutcome::InProgress);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn persist(&mut self, outcome: SessionOutcome) {
        self.record.last_checkpoint = self.state;
        self.record.outcome = outcome;
        self.record.ledger = self.ledger.held();
        self.record.updated_at = Utc::now();

        let Some(path) = &self.record_path else {
            return;
        };
        let result = serde_yaml::to_string(&self.record)
            .structured(InternalError::PersistSessionRecord)
            .and_then(|yaml| {
                files::write_file_atomic(path, 0o644, yaml.as_bytes())
                    .structured(InternalError::PersistSessionRecord)
            });
        // Losing the record must not take the installation down with it.
        if let Err(e) = result {
            warn!("{e:?}");
        }
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }
}

/// Unwinds the session when dropped armed, which only happens when a step
/// panics.
struct CleanupScope<'s> {
    session: &'s mut Session,
    steps: &'s mut dyn InstallSteps,
    armed: bool,
}

impl CleanupScope<'_> {
    fn fail(mut self, e: MirrootError) -> MirrootError {
        self.armed = false;
        let interrupted = matches!(e.kind(), ErrorKind::Interrupted(_))
            || self.session.interrupt.is_raised();
        error!(
            "Session {} after checkpoint '{}'. Session log: {}",
            if interrupted { "interrupted" } else { "failed" },
            self.session.state,
            self.session.record.log_path.display()
        );

        let e = match self.session.unwind(self.steps) {
            Ok(()) => e,
            Err(secondary) => e.secondary_error_context(secondary),
        };
        self.session.persist(if interrupted {
            SessionOutcome::Interrupted
        } else {
            SessionOutcome::Failed
        });
        e
    }
}

impl Drop for CleanupScope<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        error!(
            "Session aborted after checkpoint '{}', releasing resources",
            self.session.state
        );
        if let Err(e) = self.session.unwind(self.steps) {
            error!("Cleanup after abort failed: {e:?}");
        }
        self.session.persist(SessionOutcome::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::panic::{self, AssertUnwindSafe};

    use mirroot_api::error::{ConfigurationError, InterruptedError};
    use strum::IntoEnumIterator;

    /// Records every call; optionally fails or raises the interrupt flag at a
    /// given step.
    #[derive(Default)]
    struct FakeSteps {
        calls: Vec<&'static str>,
        fail_at: Option<&'static str>,
        interrupt_at: Option<(&'static str, InterruptFlag)>,
        panic_at: Option<&'static str>,
    }

    impl FakeSteps {
        fn step(&mut self, name: &'static str) -> Result<(), MirrootError> {
            self.calls.push(name);
            if let Some((at, flag)) = &self.interrupt_at {
                if *at == name {
                    flag.raise();
                }
            }
            if self.panic_at == Some(name) {
                panic!("step {name} panicked");
            }
            if self.fail_at == Some(name) {
                return Err(MirrootError::new(ConfigurationError::ConfigureSystem));
            }
            Ok(())
        }
    }

    impl InstallSteps for FakeSteps {
        fn validate(&mut self) -> Result<(), MirrootError> {
            self.step("validate")
        }
        fn prepare(&mut self) -> Result<(), MirrootError> {
            self.step("prepare")
        }
        fn partition(&mut self) -> Result<(), MirrootError> {
            self.step("partition")
        }
        fn create_pools(&mut self, ledger: &mut Ledger) -> Result<(), MirrootError> {
            ledger.acquire(LedgerResource::PoolsCreated);
            self.step("create_pools")
        }
        fn create_datasets(&mut self, ledger: &mut Ledger) -> Result<(), MirrootError> {
            ledger.acquire(LedgerResource::MountsActive);
            self.step("create_datasets")
        }
        fn configure_system(&mut self) -> Result<(), MirrootError> {
            self.step("configure_system")
        }
        fn configure_chroot(&mut self, ledger: &mut Ledger) -> Result<(), MirrootError> {
            ledger.acquire(LedgerResource::ChrootActive);
            self.step("configure_chroot")
        }
        fn finalize(&mut self) -> Result<(), MirrootError> {
            self.step("finalize")
        }
        fn configure_first_boot(&mut self) -> Result<(), MirrootError> {
            self.step("configure_first_boot")
        }
        fn release_chroot(&mut self) -> Result<(), MirrootError> {
            self.step("release_chroot")
        }
        fn unmount(&mut self) -> Result<(), MirrootError> {
            self.step("unmount")
        }
        fn export_pools(&mut self) -> Result<(), MirrootError> {
            self.step("export_pools")
        }
    }

    fn session(dir: &tempfile::TempDir, interrupt: InterruptFlag) -> Session {
        Session::new(
            "install",
            Some("host".into()),
            vec!["/dev/sda".into(), "/dev/sdb".into()],
            &dir.path().join("mirroot-install.log"),
            interrupt,
        )
        .with_record()
    }

    fn read_record(session: &Session) -> SessionRecord {
        let contents = std::fs::read_to_string(session.record_path().unwrap()).unwrap();
        serde_yaml::from_str(&contents).unwrap()
    }

    #[test]
    fn test_completed_after_every_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, InterruptFlag::default());
        let mut steps = FakeSteps::default();

        session.run(&mut steps).unwrap();
        assert_eq!(session.state(), InstallState::Completed);
        assert_eq!(
            steps.calls,
            [
                "validate",
                "prepare",
                "partition",
                "create_pools",
                "create_datasets",
                "configure_system",
                "configure_chroot",
                "finalize",
                "configure_first_boot",
            ]
        );
        // Completion disposes of the ledger without releasing anything.
        assert!(session.ledger().held().is_empty());

        let record = read_record(&session);
        assert_eq!(record.outcome, SessionOutcome::Completed);
        assert_eq!(record.last_checkpoint, InstallState::Completed);
        assert!(record.ledger.is_empty());
    }

    #[test]
    fn test_strict_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, InterruptFlag::default());

        let err = session.advance(InstallState::Partitioning).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Internal(InternalError::InvalidTransition { .. })
        ));
        assert_eq!(session.state(), InstallState::Starting);

        // Every checkpoint in order is accepted, nothing after completed.
        for state in InstallState::iter().skip(1) {
            session.advance(state).unwrap();
        }
        session.advance(InstallState::Completed).unwrap_err();
    }

    #[test]
    fn test_failure_keeps_last_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, InterruptFlag::default());
        let mut steps = FakeSteps {
            fail_at: Some("configure_system"),
            ..Default::default()
        };

        let err = session.run(&mut steps).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Configuration(ConfigurationError::ConfigureSystem)
        );
        assert_eq!(session.state(), InstallState::PoolsCreatingDatasets);
        assert_eq!(
            &steps.calls[steps.calls.len() - 2..],
            ["unmount", "export_pools"]
        );

        let record = read_record(&session);
        assert_eq!(record.outcome, SessionOutcome::Failed);
        assert_eq!(record.last_checkpoint, InstallState::PoolsCreatingDatasets);
        assert!(record.ledger.is_empty());
    }

    #[test]
    fn test_failure_before_destructive_steps_releases_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, InterruptFlag::default());
        let mut steps = FakeSteps {
            fail_at: Some("validate"),
            ..Default::default()
        };

        session.run(&mut steps).unwrap_err();
        assert_eq!(steps.calls, ["validate"]);
        assert_eq!(session.state(), InstallState::Starting);
        assert!(!session.state().is_destructive());
    }

    #[test]
    fn test_interrupt_releases_chroot_then_pools() {
        let dir = tempfile::tempdir().unwrap();
        let flag = InterruptFlag::default();
        let mut session = session(&dir, flag.clone());
        let mut steps = FakeSteps {
            interrupt_at: Some(("configure_chroot", flag)),
            ..Default::default()
        };

        let err = session.run(&mut steps).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Interrupted(InterruptedError::Signal)
        );
        assert_eq!(
            &steps.calls[steps.calls.len() - 4..],
            ["configure_chroot", "release_chroot", "unmount", "export_pools"]
        );
        assert_eq!(read_record(&session).outcome, SessionOutcome::Interrupted);
    }

    #[test]
    fn test_interrupt_without_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, InterruptFlag::default());
        session.ledger.acquire(LedgerResource::PoolsCreated);
        session.ledger.acquire(LedgerResource::ChrootActive);

        let mut steps = FakeSteps::default();
        session.unwind(&mut steps).unwrap();
        assert_eq!(steps.calls, ["release_chroot", "export_pools"]);
        assert!(session.ledger().held().is_empty());
    }

    #[test]
    fn test_release_failure_keeps_resource() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, InterruptFlag::default());
        session.ledger.acquire(LedgerResource::PoolsCreated);
        session.ledger.acquire(LedgerResource::MountsActive);

        let mut steps = FakeSteps {
            fail_at: Some("unmount"),
            ..Default::default()
        };
        session.unwind(&mut steps).unwrap_err();
        // Pools are still attempted after the unmount failed.
        assert_eq!(steps.calls, ["unmount", "export_pools"]);
        assert_eq!(session.ledger().held(), [LedgerResource::MountsActive]);
    }

    #[test]
    fn test_panic_unwinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir, InterruptFlag::default());
        let mut steps = FakeSteps {
            panic_at: Some("finalize"),
            ..Default::default()
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| session.run(&mut steps)));
        assert!(result.is_err());
        assert_eq!(
            &steps.calls[steps.calls.len() - 3..],
            ["release_chroot", "unmount", "export_pools"]
        );
        assert_eq!(session.state(), InstallState::ChrootConfiguration);
    }
}
