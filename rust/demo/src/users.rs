//! The `fetch_user` request handler.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use weft_effects::{
    attributes, Classify, Effect, ErrorClass, Kinded, Layer, Reply, RunOptions, Runtime,
    TraceRoot,
};

use crate::audit::{audit_layer, Audit, AuditLog};
use crate::directory::{Directory, StoreError, UserDirectory, UserRecord};

/// Expected failures of a user request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserError {
    #[error("invalid {field}")]
    Validation { field: &'static str },

    #[error("user {id} not found")]
    NotFound { id: String },
}

impl Kinded for UserError {
    fn kind(&self) -> &'static str {
        match self {
            UserError::Validation { .. } => "Validation",
            UserError::NotFound { .. } => "NotFound",
        }
    }

    fn kinds() -> &'static [&'static str] {
        &["Validation", "NotFound"]
    }
}

impl Classify for UserError {
    fn class(&self) -> ErrorClass {
        match self {
            UserError::Validation { .. } => ErrorClass::Validation,
            UserError::NotFound { .. } => ErrorClass::NotFound,
        }
    }
}

/// What a successful request returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichedUser {
    pub id: String,
    pub name: String,
    pub email: String,
    pub display_name: String,
    pub email_domain: String,
}

impl From<UserRecord> for EnrichedUser {
    fn from(record: UserRecord) -> Self {
        let email_domain = record
            .email
            .split_once('@')
            .map(|(_, domain)| domain.to_string())
            .unwrap_or_default();
        Self {
            display_name: format!("{} <{}>", record.name, record.email),
            email_domain,
            id: record.id,
            name: record.name,
            email: record.email,
        }
    }
}

fn lookup(id: String) -> Effect<Option<UserRecord>, StoreError> {
    Effect::with_service::<Directory, _>(move |directory| {
        let id = id.clone();
        Effect::from_future(move || {
            let directory = directory.clone();
            let id = id.clone();
            async move { directory.lookup(&id).await }
        })
    })
}

/// Look up and enrich one user.
///
/// An empty id fails with `Validation` before any capability is touched.
/// Storage faults are not part of the signature: they die.
pub fn fetch_user(user_id: &str) -> Effect<EnrichedUser, UserError> {
    if user_id.trim().is_empty() {
        return Effect::fail(UserError::Validation { field: "userId" });
    }
    let id = user_id.to_string();
    let missing = id.clone();

    lookup(id.clone())
        .or_die::<UserError>()
        .flat_map(move |found| match found {
            Some(record) => Effect::succeed(record),
            None => Effect::fail(UserError::NotFound {
                id: missing.clone(),
            }),
        })
        .flat_map(|record| {
            let user = EnrichedUser::from(record);
            let audited = user.id.clone();
            let annotated = user.email_domain.clone();
            Effect::<(), UserError>::with_service::<Audit, _>(move |audit| {
                audit.record(format!("fetched {audited}"));
                Effect::unit()
            })
            .then(Effect::annotate_current_span(attributes([(
                "user.email_domain",
                annotated.into(),
            )])))
            .map(move |()| user.clone())
        })
        .with_span("user.fetch", attributes([("user.id", id.into())]))
}

/// Capabilities a request needs: the directory and a per-request audit log.
pub fn service_layer(directory: Arc<dyn UserDirectory>, audit: Arc<AuditLog>) -> Layer<UserError> {
    Layer::instance::<Directory>(directory).and(audit_layer(audit))
}

/// Run one request end to end and map the outcome to a reply.
pub async fn handle(
    runtime: &Runtime,
    user_id: &str,
    layer: Layer<UserError>,
    trace_root: Option<TraceRoot>,
) -> Reply {
    let mut options = RunOptions::new();
    if let Some(root) = trace_root {
        options = options.with_trace_root(root);
    }
    let report = runtime
        .run_with(fetch_user(user_id).provide(layer), options)
        .await;
    Reply::from_outcome(report.outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrichment() {
        let user = EnrichedUser::from(UserRecord::new("1", "Ada", "ada@example.com"));
        assert_eq!(user.display_name, "Ada <ada@example.com>");
        assert_eq!(user.email_domain, "example.com");
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            UserError::Validation { field: "userId" }.class(),
            ErrorClass::Validation
        );
        assert_eq!(
            UserError::NotFound { id: "1".into() }.kind(),
            "NotFound"
        );
        assert_eq!(UserError::kinds().len(), 2);
    }

    #[test]
    fn test_empty_id_needs_no_capabilities() {
        assert!(fetch_user("").requirements().is_empty());
        assert!(fetch_user("123").requires::<Directory>());
    }
}
