//! A user lookup service built on `weft-effects`.
//!
//! [`fetch_user`] is a description that validates its input, resolves the
//! [`UserDirectory`] capability, records to a per-request [`AuditLog`] and
//! runs inside a `user.fetch` span. [`handle`] runs it and turns the outcome
//! into a [`Reply`](weft_effects::Reply), the way an inbound trigger would.

pub mod audit;
pub mod directory;
pub mod users;

pub use audit::{audit_layer, Audit, AuditLog};
pub use directory::{
    Directory, FaultyDirectory, InMemoryDirectory, StoreError, UserDirectory, UserRecord,
};
pub use users::{fetch_user, handle, service_layer, EnrichedUser, UserError};
