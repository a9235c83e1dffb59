//! Ordered fallback strategies sharing one postcondition.
//!
//! A ladder checks its postcondition first, then runs each strategy in turn
//! until the postcondition holds. A failing strategy is logged and the next
//! one is tried; only a postcondition still false after the last rung is an
//! error.

use anyhow::{bail, Error};
use log::{debug, warn};

type Action<'a> = Box<dyn FnMut() -> Result<(), Error> + 'a>;

/// How a ladder reached its postcondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderOutcome {
    /// Nothing had to be done.
    AlreadySatisfied,
    /// The named strategy was the one after which the postcondition held.
    SatisfiedBy(&'static str),
}

pub struct Ladder<'a> {
    name: String,
    strategies: Vec<(&'static str, Action<'a>)>,
}

impl<'a> Ladder<'a> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategies: Vec::new(),
        }
    }

    pub fn strategy(
        mut self,
        name: &'static str,
        action: impl FnMut() -> Result<(), Error> + 'a,
    ) -> Self {
        self.strategies.push((name, Box::new(action)));
        self
    }

    /// Runs strategies until `postcondition` returns true. An error from
    /// `postcondition` itself aborts the ladder.
    pub fn run(
        mut self,
        mut postcondition: impl FnMut() -> Result<bool, Error>,
    ) -> Result<LadderOutcome, Error> {
        if postcondition()? {
            debug!("{}: nothing to do", self.name);
            return Ok(LadderOutcome::AlreadySatisfied);
        }

        let mut failures = Vec::new();
        for (name, action) in self.strategies.iter_mut() {
            let name = *name;
            debug!("{}: trying '{name}'", self.name);
            if let Err(e) = action() {
                warn!("{}: strategy '{name}' failed: {e:?}", self.name);
                failures.push(format!("{name}: {e}"));
            }
            if postcondition()? {
                debug!("{}: satisfied by '{name}'", self.name);
                return Ok(LadderOutcome::SatisfiedBy(name));
            }
        }

        bail!(
            "{}: postcondition not reached after {} strategies ({})",
            self.name,
            self.strategies.len(),
            if failures.is_empty() {
                "no strategy reported an error".to_string()
            } else {
                failures.join("; ")
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::{Cell, RefCell};

    #[test]
    fn test_already_satisfied() {
        let ran = Cell::new(false);
        let outcome = Ladder::new("test")
            .strategy("a", || {
                ran.set(true);
                Ok(())
            })
            .run(|| Ok(true))
            .unwrap();
        assert_eq!(outcome, LadderOutcome::AlreadySatisfied);
        assert!(!ran.get());
    }

    #[test]
    fn test_stops_at_first_success() {
        let log = RefCell::new(Vec::new());
        let done = Cell::new(false);
        let outcome = Ladder::new("test")
            .strategy("a", || {
                log.borrow_mut().push("a");
                bail!("a failed")
            })
            .strategy("b", || {
                log.borrow_mut().push("b");
                done.set(true);
                Ok(())
            })
            .strategy("c", || {
                log.borrow_mut().push("c");
                Ok(())
            })
            .run(|| Ok(done.get()))
            .unwrap();

        assert_eq!(outcome, LadderOutcome::SatisfiedBy("b"));
        assert_eq!(*log.borrow(), ["a", "b"]);
    }

    #[test]
    fn test_success_without_postcondition_continues() {
        // A strategy that reports success without reaching the goal does not
        // end the ladder.
        let calls = Cell::new(0);
        let outcome = Ladder::new("test")
            .strategy("noop", || Ok(()))
            .strategy("real", || {
                calls.set(calls.get() + 1);
                Ok(())
            })
            .run(|| Ok(calls.get() > 0))
            .unwrap();
        assert_eq!(outcome, LadderOutcome::SatisfiedBy("real"));
    }

    #[test]
    fn test_exhausted() {
        let err = Ladder::new("destroy pool 'rpool'")
            .strategy("a", || bail!("busy"))
            .strategy("b", || Ok(()))
            .run(|| Ok(false))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("after 2 strategies"), "{message}");
        assert!(message.contains("a: busy"), "{message}");
    }

    #[test]
    fn test_postcondition_error_aborts() {
        let ran = Cell::new(false);
        Ladder::new("test")
            .strategy("a", || {
                ran.set(true);
                Ok(())
            })
            .run(|| bail!("cannot query"))
            .unwrap_err();
        assert!(!ran.get());
    }
}
