//! User storage behind the `Directory` capability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use weft_effects::Capability;

/// A stored user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
        }
    }
}

/// Infrastructure failure while talking to the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// `Ok(None)` when no user has this id.
    async fn lookup(&self, id: &str) -> Result<Option<UserRecord>, StoreError>;
}

/// Capability key for [`UserDirectory`].
pub struct Directory;

impl Capability for Directory {
    const NAME: &'static str = "UserDirectory";
    type Service = dyn UserDirectory;
}

/// Directory over a fixed map. Counts lookups so callers can check that a
/// request never reached storage.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: HashMap<String, UserRecord>,
    lookups: AtomicUsize,
}

impl InMemoryDirectory {
    pub fn new(users: impl IntoIterator<Item = UserRecord>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
            lookups: AtomicUsize::new(0),
        }
    }

    /// A small fixed population used by the CLI.
    pub fn seeded() -> Self {
        Self::new([
            UserRecord::new("123", "Ada Lovelace", "ada@example.com"),
            UserRecord::new("7", "Grace Hopper", "grace@example.com"),
        ])
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn lookup(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        debug!(user.id = id, "directory lookup");
        Ok(self.users.get(id).cloned())
    }
}

/// Directory whose every lookup fails, standing in for a dead backend.
#[derive(Debug)]
pub struct FaultyDirectory {
    reason: String,
}

impl FaultyDirectory {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl UserDirectory for FaultyDirectory {
    async fn lookup(&self, _id: &str) -> Result<Option<UserRecord>, StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_lookup_counts() {
        let directory = InMemoryDirectory::seeded();
        assert_eq!(
            directory.lookup("123").await.unwrap().map(|u| u.name),
            Some("Ada Lovelace".to_string())
        );
        assert_eq!(directory.lookup("404").await.unwrap(), None);
        assert_eq!(directory.lookups(), 2);
    }

    #[tokio::test]
    async fn test_faulty_directory_fails() {
        let directory = FaultyDirectory::new("connection refused");
        assert_eq!(
            directory.lookup("123").await,
            Err(StoreError::Unavailable("connection refused".into()))
        );
    }
}
