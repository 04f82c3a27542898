//! One-shot reconciliation between the local and remote key sets.
//!
//! A key missing on exactly one side is copied to the other. A key present on
//! both sides is left alone whatever its contents; nothing here compares
//! timestamps or merges payloads.

use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::auth::Principal;
use crate::error::{Result, VaultError};
use crate::local::LocalVaultStore;
use crate::record::Passphrase;
use crate::remote::RemoteVaultStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub migrated_keys: BTreeSet<String>,
    pub failed_keys: BTreeSet<String>,
}

impl SyncOutcome {
    /// Dependent state must be re-read when this is true.
    pub fn has_migrations(&self) -> bool {
        !self.migrated_keys.is_empty()
    }
}

pub struct SyncReconciler<'a> {
    local: &'a LocalVaultStore,
    remote: &'a RemoteVaultStore,
    principal: Option<Principal>,
}

impl<'a> SyncReconciler<'a> {
    /// Reconciles against whoever is signed in when [`SyncReconciler::run`] starts.
    pub fn new(local: &'a LocalVaultStore, remote: &'a RemoteVaultStore) -> Self {
        Self {
            local,
            remote,
            principal: None,
        }
    }

    /// Reconciles against `principal`'s rows even if the signed-in user
    /// changes mid-pass.
    pub fn for_principal(
        local: &'a LocalVaultStore,
        remote: &'a RemoteVaultStore,
        principal: Principal,
    ) -> Self {
        Self {
            local,
            remote,
            principal: Some(principal),
        }
    }

    /// Runs one pass. Keys are handled sequentially in sorted order and each
    /// remote write completes before its key counts as migrated. If either
    /// key listing fails the pass is skipped, so an unreachable remote is
    /// never mistaken for an empty one.
    pub async fn run(&self, passphrase: &Passphrase) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        let Some(principal) = self
            .principal
            .clone()
            .or_else(|| self.remote.current_principal())
        else {
            warn!("no signed-in user; skipping reconciliation");
            return outcome;
        };
        let local_keys: BTreeSet<String> = match self.local.keys() {
            Ok(keys) => keys.into_iter().collect(),
            Err(err) => {
                warn!(error = %err, "local key listing failed; skipping reconciliation");
                return outcome;
            }
        };
        let remote_keys = match self.remote.list_keys_as(&principal).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "remote key listing failed; skipping reconciliation");
                return outcome;
            }
        };

        for key in local_keys.union(&remote_keys) {
            let result = match (local_keys.contains(key), remote_keys.contains(key)) {
                (true, false) => self.push(&principal, key, passphrase).await,
                (false, true) => self.pull(&principal, key, passphrase).await,
                _ => continue,
            };
            match result {
                Ok(()) => {
                    debug!(key = %key, "migrated");
                    outcome.migrated_keys.insert(key.clone());
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "migration failed");
                    outcome.failed_keys.insert(key.clone());
                }
            }
        }

        info!(
            migrated = outcome.migrated_keys.len(),
            failed = outcome.failed_keys.len(),
            "reconciliation pass finished"
        );
        outcome
    }

    async fn push(&self, principal: &Principal, key: &str, passphrase: &Passphrase) -> Result<()> {
        let payload = match self.local.get(key) {
            Some(payload) => payload,
            // persisted but not in the cache: it failed to decrypt
            None if self.local.is_unlocked() => return Err(VaultError::DecryptionFailure),
            None => return Err(VaultError::Locked),
        };
        self.remote.set_as(principal, key, &payload, passphrase).await
    }

    async fn pull(&self, principal: &Principal, key: &str, passphrase: &Passphrase) -> Result<()> {
        match self.remote.fetch_as(principal, key, passphrase).await? {
            Some(payload) => self.local.store_synced(key, payload),
            None => Err(VaultError::RemoteUnavailable(format!(
                "row {key} vanished during reconciliation"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSession;
    use crate::cipher::{Cipher, KdfParams};
    use crate::remote::MemoryRemoteBackend;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        local: LocalVaultStore,
        remote: RemoteVaultStore,
        backend: Arc<MemoryRemoteBackend>,
        auth: Arc<AuthSession>,
        pass: Passphrase,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let cipher = Cipher::new(KdfParams::insecure_fast());
        let local = LocalVaultStore::open(dir.path(), cipher).unwrap();
        let backend = Arc::new(MemoryRemoteBackend::new());
        let auth = Arc::new(AuthSession::signed_in(Principal::new("user-1")));
        let remote = RemoteVaultStore::new(backend.clone(), auth.clone(), cipher);
        let pass = Passphrase::new("hunter22");
        local.unlock(&pass).unwrap();
        Fixture {
            _dir: dir,
            local,
            remote,
            backend,
            auth,
            pass,
        }
    }

    fn set_of(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn local_only_key_is_pushed() {
        let f = fixture();
        f.local.set("accounts", json!([{"id": 1}])).unwrap();
        let outcome = SyncReconciler::new(&f.local, &f.remote).run(&f.pass).await;
        assert_eq!(outcome.migrated_keys, set_of(&["accounts"]));
        assert!(outcome.failed_keys.is_empty());
        assert_eq!(f.remote.get("accounts", &f.pass).await, Some(json!([{"id": 1}])));
    }

    #[tokio::test]
    async fn remote_only_key_is_pulled() {
        let f = fixture();
        f.remote.set("profile", &json!({"name": "r"}), &f.pass).await.unwrap();
        let outcome = SyncReconciler::new(&f.local, &f.remote).run(&f.pass).await;
        assert_eq!(outcome.migrated_keys, set_of(&["profile"]));
        assert_eq!(f.local.get("profile"), Some(json!({"name": "r"})));
    }

    #[tokio::test]
    async fn key_on_both_sides_is_untouched() {
        let f = fixture();
        f.local.set("expenses", json!(["local"])).unwrap();
        f.remote.set("expenses", &json!(["remote"]), &f.pass).await.unwrap();
        let before = f.backend.row("user-1", "expenses").unwrap();
        let outcome = SyncReconciler::new(&f.local, &f.remote).run(&f.pass).await;
        assert!(!outcome.migrated_keys.contains("expenses"));
        assert_eq!(f.local.get("expenses"), Some(json!(["local"])));
        assert_eq!(f.backend.row("user-1", "expenses").unwrap(), before);
    }

    #[tokio::test]
    async fn second_pass_migrates_nothing() {
        let f = fixture();
        f.local.set("a", json!(1)).unwrap();
        f.remote.set("b", &json!(2), &f.pass).await.unwrap();
        let reconciler = SyncReconciler::new(&f.local, &f.remote);
        assert_eq!(reconciler.run(&f.pass).await.migrated_keys, set_of(&["a", "b"]));
        assert!(reconciler.run(&f.pass).await.migrated_keys.is_empty());
    }

    #[tokio::test]
    async fn unreachable_remote_skips_pass() {
        let f = fixture();
        f.local.set("accounts", json!([])).unwrap();
        f.backend.set_offline(true);
        let outcome = SyncReconciler::new(&f.local, &f.remote).run(&f.pass).await;
        assert_eq!(outcome, SyncOutcome::default());
    }

    #[tokio::test]
    async fn pinned_principal_ignores_user_switch() {
        let f = fixture();
        f.local.set("accounts", json!([1])).unwrap();
        f.auth.sign_in(Principal::new("user-2"));
        let outcome =
            SyncReconciler::for_principal(&f.local, &f.remote, Principal::new("user-1"))
                .run(&f.pass)
                .await;
        assert_eq!(outcome.migrated_keys, set_of(&["accounts"]));
        assert!(f.backend.row("user-1", "accounts").is_some());
        assert!(f.backend.row("user-2", "accounts").is_none());
    }

    #[tokio::test]
    async fn signed_out_skips_pass() {
        let f = fixture();
        f.local.set("accounts", json!([1])).unwrap();
        f.auth.sign_out();
        let outcome = SyncReconciler::new(&f.local, &f.remote).run(&f.pass).await;
        assert_eq!(outcome, SyncOutcome::default());
        assert_eq!(f.backend.request_count(), 0);
    }

    #[tokio::test]
    async fn undecryptable_remote_row_is_reported_failed() {
        let f = fixture();
        f.remote
            .set("loans", &json!([]), &Passphrase::new("someone-else"))
            .await
            .unwrap();
        let outcome = SyncReconciler::new(&f.local, &f.remote).run(&f.pass).await;
        assert_eq!(outcome.failed_keys, set_of(&["loans"]));
        assert!(outcome.migrated_keys.is_empty());
        assert_eq!(f.local.get("loans"), None);
    }
}
