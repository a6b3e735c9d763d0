//! Unrecoverable failures.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Shared, type-erased error kept as the origin of a defect.
pub type DefectSource = Arc<dyn StdError + Send + Sync + 'static>;

/// What kind of unrecoverable condition a [`Defect`] records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefectKind {
    /// Raised explicitly by `die`.
    Died,

    /// A declared failure that was deliberately downgraded.
    Downgraded {
        /// Kind discriminator of the downgraded failure.
        kind: String,
    },

    /// A capability was requested but never provided.
    MissingCapability {
        /// Stable name of the capability.
        capability: &'static str,
    },

    /// User code panicked while being evaluated.
    Panicked,

    /// An internal invariant of the runtime was broken.
    Invariant,
}

impl fmt::Display for DefectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefectKind::Died => write!(f, "died"),
            DefectKind::Downgraded { kind } => write!(f, "downgraded failure `{kind}`"),
            DefectKind::MissingCapability { capability } => {
                write!(f, "missing capability `{capability}`")
            }
            DefectKind::Panicked => write!(f, "panicked"),
            DefectKind::Invariant => write!(f, "invariant violated"),
        }
    }
}

/// An unexpected failure, carrying its original cause.
///
/// Defects never appear in a description's declared error type. They are
/// produced by `die`, by downgrading a failure, by resolving a capability
/// that was never provided, or by a panic in user code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Defect {
    kind: DefectKind,
    message: String,
    #[source]
    source: Option<DefectSource>,
}

impl Defect {
    pub fn new(kind: DefectKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Explicit defect raised by composing code.
    pub fn die(message: impl Into<String>) -> Self {
        Self::new(DefectKind::Died, message)
    }

    /// Defect wrapping an arbitrary error.
    pub fn from_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind: DefectKind::Died,
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    /// Downgrade a declared failure. There is no way back.
    pub fn downgrade<E>(kind: impl Into<String>, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind: DefectKind::Downgraded { kind: kind.into() },
            message: error.to_string(),
            source: Some(Arc::new(error)),
        }
    }

    pub fn missing_capability(capability: &'static str) -> Self {
        Self::new(
            DefectKind::MissingCapability { capability },
            format!("capability `{capability}` was required but never provided"),
        )
    }

    /// Defect from a caught panic payload.
    pub fn panicked(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(DefectKind::Panicked, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(DefectKind::Invariant, message)
    }

    #[must_use]
    pub fn with_source(mut self, source: DefectSource) -> Self {
        self.source = Some(source);
        self
    }

    #[must_use]
    pub fn kind(&self) -> &DefectKind {
        &self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn cause(&self) -> Option<&DefectSource> {
        self.source.as_ref()
    }

    /// Recover the original error, e.g. the failure that was downgraded.
    #[must_use]
    pub fn downcast_source<T: StdError + 'static>(&self) -> Option<&T> {
        self.source.as_deref().and_then(|s| s.downcast_ref::<T>())
    }
}

/// Two defects are equal when they record the same condition and share
/// the same source object.
impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        let same_source = match (&self.source, &other.source) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.kind == other.kind && self.message == other.message && same_source
    }
}
