//! Error taxonomy and composition errors.
//!
//! Typed failures are classified into a small set of [`ErrorClass`]es so the
//! inbound trigger can pick a response without knowing each domain enum.
//! Defects and interruptions are the remaining two classes; they live on
//! `Outcome` and never appear in a description's error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Class of an expected, recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Caller input malformed.
    Validation,
    /// Referenced entity absent.
    NotFound,
    /// Policy denied the request.
    Unauthorized,
    /// A dependency such as storage or the network failed.
    Upstream,
    /// An operation ran out of time.
    Timeout,
}

impl ErrorClass {
    /// Whether the failure is meant to be shown to the caller as-is.
    #[must_use]
    pub fn is_user_facing(self) -> bool {
        matches!(
            self,
            ErrorClass::Validation | ErrorClass::NotFound | ErrorClass::Unauthorized
        )
    }

    /// Whether re-running the operation may help.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorClass::Upstream | ErrorClass::Timeout)
    }
}

/// Domain error that knows its [`ErrorClass`].
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Mistakes made while composing a description, reported before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompositionError {
    #[error("a handler for kind `{kind}` is already registered")]
    DuplicateHandler { kind: &'static str },

    #[error("kind `{kind}` is not a variant of `{error_type}`")]
    UnknownKind {
        kind: &'static str,
        error_type: &'static str,
    },
}
