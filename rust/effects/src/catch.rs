//! Per-kind failure handling.
//!
//! Two ways to handle failures by kind:
//!
//! - [`Effect::catch_kind`](crate::Effect::catch_kind) takes a closure that
//!   `match`es the error exhaustively and returns a [`Handled`]. Narrowing to
//!   a smaller error type is expressed by the `Reraise` arm's type.
//! - [`Effect::catch_tags`](crate::Effect::catch_tags) takes a
//!   [`KindHandlers`] table keyed by [`Kinded::kind`], checked for duplicates
//!   and unknown kinds when the table is built.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::effect::Effect;
use crate::errors::CompositionError;

/// Verdict of a `catch_kind` handler.
pub enum Handled<A, E> {
    /// Run this description in place of the failure.
    Recover(Effect<A, E>),
    /// Fail again, with an error of the (possibly narrower) output type.
    Reraise(E),
}

impl<A, E> fmt::Debug for Handled<A, E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handled::Recover(effect) => f.debug_tuple("Recover").field(effect).finish(),
            Handled::Reraise(error) => f.debug_tuple("Reraise").field(error).finish(),
        }
    }
}

/// Error enum whose variants carry a stable kind discriminator.
///
/// ```
/// use weft_effects::Kinded;
///
/// enum LookupError {
///     Missing,
///     Denied,
/// }
///
/// impl Kinded for LookupError {
///     fn kind(&self) -> &'static str {
///         match self {
///             LookupError::Missing => "Missing",
///             LookupError::Denied => "Denied",
///         }
///     }
///
///     fn kinds() -> &'static [&'static str] {
///         &["Missing", "Denied"]
///     }
/// }
///
/// assert_eq!(LookupError::Denied.kind(), "Denied");
/// ```
pub trait Kinded {
    fn kind(&self) -> &'static str;

    /// Every kind the type can produce.
    fn kinds() -> &'static [&'static str]
    where
        Self: Sized;
}

pub(crate) type KindHandler<A, E> = Arc<dyn Fn(E) -> Effect<A, E> + Send + Sync>;

/// Handlers keyed by error kind. Kinds form a partition, so each kind has
/// at most one handler.
pub struct KindHandlers<A, E> {
    handlers: HashMap<&'static str, KindHandler<A, E>>,
}

impl<A, E> Clone for KindHandlers<A, E> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<A, E: Kinded> Default for KindHandlers<A, E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<A, E: Kinded> KindHandlers<A, E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    ///
    /// # Errors
    ///
    /// [`CompositionError::UnknownKind`] if `E` never produces `kind`, and
    /// [`CompositionError::DuplicateHandler`] if `kind` already has a handler.
    pub fn on<F>(mut self, kind: &'static str, handler: F) -> Result<Self, CompositionError>
    where
        F: Fn(E) -> Effect<A, E> + Send + Sync + 'static,
    {
        if !E::kinds().contains(&kind) {
            return Err(CompositionError::UnknownKind {
                kind,
                error_type: type_name::<E>(),
            });
        }
        if self.handlers.contains_key(kind) {
            return Err(CompositionError::DuplicateHandler { kind });
        }
        self.handlers.insert(kind, Arc::new(handler));
        Ok(self)
    }

    /// Kinds with a handler, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Kinds of `E` left without a handler; these re-raise unchanged.
    #[must_use]
    pub fn unhandled(&self) -> Vec<&'static str> {
        E::kinds()
            .iter()
            .copied()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect()
    }

    pub(crate) fn get(&self, kind: &str) -> Option<&KindHandler<A, E>> {
        self.handlers.get(kind)
    }
}

impl<A, E> fmt::Debug for KindHandlers<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
