//! Terminal results of a run.
//!
//! An [`Outcome`] is what a run produces. It keeps the expected failure
//! channel (`Failure`) apart from defects and from interruption, so that a
//! caller can never confuse "the user asked for something that doesn't
//! exist" with "the system is in an inconsistent state".
//!
//! # Conversions
//!
//! | Conversion | Success | Failure | Defect | Interrupted |
//! |------------|---------|---------|--------|-------------|
//! | [`Outcome::into_result`] | `Ok` | `Err` | panic | panic |
//! | [`Outcome::into_exit`] | `Ok` | `Err(Cause::Fail)` | `Err(Cause::Die)` | `Err(Cause::Interrupt)` |
//!
//! `into_exit` is the only way to look at a defect without crashing.

use crate::defect::Defect;

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<A, E> {
    /// The computation produced a value.
    Success(A),

    /// The computation failed with a declared, recoverable error.
    Failure(E),

    /// The computation hit an unrecoverable condition.
    Defect(Defect),

    /// The computation was cancelled before reaching any other state.
    Interrupted,
}

/// Every non-success reason a run can end with.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// Declared failure.
    Fail(E),
    /// Defect.
    Die(Defect),
    /// Cancellation.
    Interrupt,
}

/// Outcome with all non-success cases folded into [`Cause`].
pub type Exit<A, E> = Result<A, Cause<E>>;

impl<A, E> Outcome<A, E> {
    /// Convert into a `Result` over the typed channel.
    ///
    /// # Panics
    ///
    /// Panics on `Defect` and `Interrupted`. Neither may be absorbed into
    /// the typed error channel; use [`Outcome::into_exit`] to inspect them.
    pub fn into_result(self) -> Result<A, E> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(error) => Err(error),
            Outcome::Defect(defect) => panic!("unrecoverable defect: {defect}"),
            Outcome::Interrupted => panic!("run was interrupted before producing a result"),
        }
    }

    /// Expose every case explicitly.
    pub fn into_exit(self) -> Exit<A, E> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(error) => Err(Cause::Fail(error)),
            Outcome::Defect(defect) => Err(Cause::Die(defect)),
            Outcome::Interrupted => Err(Cause::Interrupt),
        }
    }

    /// Rebuild an outcome from an exit.
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        match exit {
            Ok(value) => Outcome::Success(value),
            Err(Cause::Fail(error)) => Outcome::Failure(error),
            Err(Cause::Die(defect)) => Outcome::Defect(defect),
            Err(Cause::Interrupt) => Outcome::Interrupted,
        }
    }

    /// Transform the success value, leaving every other case untouched.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Outcome<B, E> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Failure(error) => Outcome::Failure(error),
            Outcome::Defect(defect) => Outcome::Defect(defect),
            Outcome::Interrupted => Outcome::Interrupted,
        }
    }

    /// Transform the failure, leaving every other case untouched.
    pub fn map_failure<E2>(self, f: impl FnOnce(E) -> E2) -> Outcome<A, E2> {
        match self {
            Outcome::Success(value) => Outcome::Success(value),
            Outcome::Failure(error) => Outcome::Failure(f(error)),
            Outcome::Defect(defect) => Outcome::Defect(defect),
            Outcome::Interrupted => Outcome::Interrupted,
        }
    }

    #[must_use]
    pub fn as_ref(&self) -> Outcome<&A, &E> {
        match self {
            Outcome::Success(value) => Outcome::Success(value),
            Outcome::Failure(error) => Outcome::Failure(error),
            Outcome::Defect(defect) => Outcome::Defect(defect.clone()),
            Outcome::Interrupted => Outcome::Interrupted,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    #[must_use]
    pub fn is_defect(&self) -> bool {
        matches!(self, Outcome::Defect(_))
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Outcome::Interrupted)
    }

    /// The success value, if any.
    pub fn success(self) -> Option<A> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    /// The declared failure, if any.
    pub fn failure(self) -> Option<E> {
        match self {
            Outcome::Failure(error) => Some(error),
            _ => None,
        }
    }

    /// The defect, if any.
    pub fn defect(self) -> Option<Defect> {
        match self {
            Outcome::Defect(defect) => Some(defect),
            _ => None,
        }
    }

    /// Short name of the case, used in logs and span attributes.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Failure(_) => "failure",
            Outcome::Defect(_) => "defect",
            Outcome::Interrupted => "interrupted",
        }
    }
}

impl<A, E> From<Exit<A, E>> for Outcome<A, E> {
    fn from(exit: Exit<A, E>) -> Self {
        Outcome::from_exit(exit)
    }
}
