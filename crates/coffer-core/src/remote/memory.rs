use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{RemoteBackend, RemoteRow};
use crate::auth::Principal;
use crate::error::{Result, VaultError};

/// In-process backend. Rows live in a map keyed by `(user_id, key)`;
/// `set_offline(true)` makes every call fail like a dropped connection.
#[derive(Debug, Default)]
pub struct MemoryRemoteBackend {
    rows: Mutex<BTreeMap<(String, String), RemoteRow>>,
    offline: AtomicBool,
    requests: AtomicUsize,
}

impl MemoryRemoteBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of backend calls made so far, including failed ones.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn row(&self, user_id: &str, key: &str) -> Option<RemoteRow> {
        self.rows
            .lock()
            .get(&(user_id.to_string(), key.to_string()))
            .cloned()
    }

    /// Writes a row directly, bypassing authorization.
    pub fn insert_row(&self, row: RemoteRow) {
        self.rows
            .lock()
            .insert((row.user_id.clone(), row.key.clone()), row);
    }

    fn begin(&self) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(VaultError::RemoteUnavailable(
                "memory backend offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemoteBackend {
    async fn fetch(&self, principal: &Principal, key: &str) -> Result<Option<RemoteRow>> {
        self.begin()?;
        Ok(self.row(&principal.user_id, key))
    }

    async fn upsert(&self, principal: &Principal, row: RemoteRow) -> Result<()> {
        self.begin()?;
        if row.user_id != principal.user_id {
            return Err(VaultError::Unauthenticated);
        }
        self.insert_row(row);
        Ok(())
    }

    async fn delete(&self, principal: &Principal, key: &str) -> Result<()> {
        self.begin()?;
        self.rows
            .lock()
            .remove(&(principal.user_id.clone(), key.to_string()));
        Ok(())
    }

    async fn list_keys(&self, principal: &Principal) -> Result<Vec<String>> {
        self.begin()?;
        Ok(self
            .rows
            .lock()
            .keys()
            .filter(|(user, _)| *user == principal.user_id)
            .map(|(_, key)| key.clone())
            .collect())
    }
}
