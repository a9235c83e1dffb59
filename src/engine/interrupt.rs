use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::{Context, Error};
use log::warn;
use signal_hook::{
    consts::signal::{SIGINT, SIGQUIT, SIGTERM},
    iterator::Signals,
};

use mirroot_api::error::{InterruptedError, MirrootError};

/// Set once a termination signal arrives. Sessions poll it between steps and
/// route a raised flag into their failure cleanup.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Replaces the default disposition of SIGTERM, SIGINT and SIGQUIT with
    /// setting the returned flag.
    pub fn install() -> Result<Self, Error> {
        let flag = Self::default();
        let mut signals =
            Signals::new([SIGTERM, SIGINT, SIGQUIT]).context("Failed to set up signal handlers")?;

        let raised = flag.clone();
        thread::spawn(move || {
            for signal in signals.forever() {
                warn!("Received termination signal {signal}, stopping after the current step");
                raised.raise();
            }
        });

        Ok(flag)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Errors out when the flag is raised.
    #[track_caller]
    pub fn check(&self) -> Result<(), MirrootError> {
        if self.is_raised() {
            return Err(MirrootError::new(InterruptedError::Signal));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mirroot_api::error::ErrorKind;

    #[test]
    fn test_flag_shared_between_clones() {
        let flag = InterruptFlag::default();
        let clone = flag.clone();
        flag.check().unwrap();

        clone.raise();
        assert!(flag.is_raised());
        assert_eq!(
            flag.check().unwrap_err().kind(),
            &ErrorKind::Interrupted(InterruptedError::Signal)
        );
    }
}
