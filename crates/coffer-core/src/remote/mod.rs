//! Per-user encrypted mirror of the vault.
//!
//! [`RemoteVaultStore`] seals and opens records; a [`RemoteBackend`] moves
//! opaque rows. Every call is scoped to the principal reported by the
//! [`AuthProvider`] at call time, and fails closed when there is none.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::{AuthProvider, Principal};
use crate::cipher::{Cipher, Envelope};
use crate::error::{Result, VaultError};
use crate::record::{
    ensure_writable_key, is_reserved_key, Passphrase, VaultRecord, CANARY_KEY, CANARY_MARKER,
};

mod http;
mod memory;

pub use http::HttpRemoteBackend;
pub use memory::MemoryRemoteBackend;

/// Row shape on the server, unique per `(user_id, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub user_id: String,
    pub key: String,
    pub ciphertext: String,
    pub iv: String,
    pub salt: String,
    pub updated_at: DateTime<Utc>,
}

impl RemoteRow {
    pub fn new(user_id: &str, key: &str, envelope: Envelope) -> Self {
        Self {
            user_id: user_id.to_string(),
            key: key.to_string(),
            ciphertext: envelope.ciphertext,
            iv: envelope.iv,
            salt: envelope.salt,
            updated_at: Utc::now(),
        }
    }

    pub fn envelope(&self) -> Envelope {
        Envelope {
            ciphertext: self.ciphertext.clone(),
            iv: self.iv.clone(),
            salt: self.salt.clone(),
        }
    }
}

/// Transport under the remote store. `fetch` must return `Ok(None)` only when
/// the row is known to be absent; transport trouble is an error.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn fetch(&self, principal: &Principal, key: &str) -> Result<Option<RemoteRow>>;
    async fn upsert(&self, principal: &Principal, row: RemoteRow) -> Result<()>;
    async fn delete(&self, principal: &Principal, key: &str) -> Result<()>;
    async fn list_keys(&self, principal: &Principal) -> Result<Vec<String>>;
}

pub struct RemoteVaultStore {
    backend: Arc<dyn RemoteBackend>,
    auth: Arc<dyn AuthProvider>,
    cipher: Cipher,
}

impl RemoteVaultStore {
    pub fn new(backend: Arc<dyn RemoteBackend>, auth: Arc<dyn AuthProvider>, cipher: Cipher) -> Self {
        Self {
            backend,
            auth,
            cipher,
        }
    }

    pub fn current_principal(&self) -> Option<Principal> {
        self.auth.current_principal()
    }

    fn principal(&self) -> Result<Principal> {
        self.current_principal().ok_or(VaultError::Unauthenticated)
    }

    /// Lenient read: absent, unreachable, unauthorized and undecryptable all
    /// come back as `None`.
    pub async fn get(&self, key: &str, passphrase: &Passphrase) -> Option<Value> {
        match self.fetch(key, passphrase).await {
            Ok(value) => value,
            Err(err) => {
                debug!(key = %key, error = %err, "remote read treated as absent");
                None
            }
        }
    }

    /// Strict read: `Ok(None)` means the row does not exist.
    pub async fn fetch(&self, key: &str, passphrase: &Passphrase) -> Result<Option<Value>> {
        self.fetch_as(&self.principal()?, key, passphrase).await
    }

    /// [`RemoteVaultStore::fetch`] for a fixed principal.
    pub async fn fetch_as(
        &self,
        principal: &Principal,
        key: &str,
        passphrase: &Passphrase,
    ) -> Result<Option<Value>> {
        let Some(row) = self.backend.fetch(principal, key).await? else {
            return Ok(None);
        };
        let record = self.cipher.open_record(&row.envelope(), passphrase)?;
        if record.key != key {
            return Err(VaultError::DecryptionFailure);
        }
        Ok(Some(record.data))
    }

    pub async fn set(&self, key: &str, payload: &Value, passphrase: &Passphrase) -> Result<()> {
        self.set_as(&self.principal()?, key, payload, passphrase).await
    }

    pub async fn set_as(
        &self,
        principal: &Principal,
        key: &str,
        payload: &Value,
        passphrase: &Passphrase,
    ) -> Result<()> {
        ensure_writable_key(key)?;
        let envelope = self
            .cipher
            .seal_record(&VaultRecord::new(key, payload.clone()), passphrase)?;
        self.put_envelope_as(principal, key, envelope).await
    }

    /// Upserts an already sealed envelope into `principal`'s rows. Last
    /// writer wins.
    pub async fn put_envelope_as(
        &self,
        principal: &Principal,
        key: &str,
        envelope: Envelope,
    ) -> Result<()> {
        let row = RemoteRow::new(&principal.user_id, key, envelope);
        self.backend.upsert(principal, row).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.remove_as(&self.principal()?, key).await
    }

    pub async fn remove_as(&self, principal: &Principal, key: &str) -> Result<()> {
        self.backend.delete(principal, key).await
    }

    pub async fn list_keys(&self) -> Result<BTreeSet<String>> {
        self.list_keys_as(&self.principal()?).await
    }

    pub async fn list_keys_as(&self, principal: &Principal) -> Result<BTreeSet<String>> {
        let keys = self.backend.list_keys(principal).await?;
        Ok(keys.into_iter().filter(|k| !is_reserved_key(k)).collect())
    }

    /// Checks `passphrase` against the canary row, provisioning it when the
    /// user has none yet. Transport failures are errors, never "absent", so an
    /// unreachable server cannot trigger provisioning.
    pub async fn verify_passphrase(&self, passphrase: &Passphrase) -> Result<bool> {
        let principal = self.principal()?;
        match self.backend.fetch(&principal, CANARY_KEY).await? {
            Some(row) => match self.cipher.open_record(&row.envelope(), passphrase) {
                Ok(record) => Ok(record.key == CANARY_KEY
                    && record.data == Value::String(CANARY_MARKER.to_string())),
                Err(VaultError::DecryptionFailure) => Ok(false),
                Err(err) => Err(err),
            },
            None => {
                let canary = VaultRecord::new(CANARY_KEY, Value::String(CANARY_MARKER.to_string()));
                let envelope = self.cipher.seal_record(&canary, passphrase)?;
                let row = RemoteRow::new(&principal.user_id, CANARY_KEY, envelope);
                self.backend.upsert(&principal, row).await?;
                info!(user_id = %principal.user_id, "provisioned vault canary");
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSession;
    use crate::cipher::KdfParams;
    use serde_json::json;

    fn store() -> (RemoteVaultStore, Arc<MemoryRemoteBackend>, Arc<AuthSession>) {
        let backend = Arc::new(MemoryRemoteBackend::new());
        let auth = Arc::new(AuthSession::signed_in(Principal::new("user-a")));
        let store = RemoteVaultStore::new(
            backend.clone(),
            auth.clone(),
            Cipher::new(KdfParams::insecure_fast()),
        );
        (store, backend, auth)
    }

    #[tokio::test]
    async fn set_then_get() {
        let (store, backend, _) = store();
        let p = Passphrase::new("hunter22");
        store.set("accounts", &json!([1, 2]), &p).await.unwrap();
        assert_eq!(store.get("accounts", &p).await, Some(json!([1, 2])));
        let row = backend.row("user-a", "accounts").unwrap();
        assert_eq!(row.key, "accounts");
        assert!(store.get("accounts", &Passphrase::new("hunter23")).await.is_none());
    }

    #[tokio::test]
    async fn canary_provisioned_once_then_enforced() {
        let (store, backend, _) = store();
        assert!(store.verify_passphrase(&Passphrase::new("first-pass")).await.unwrap());
        assert!(backend.row("user-a", CANARY_KEY).is_some());
        assert!(store.verify_passphrase(&Passphrase::new("first-pass")).await.unwrap());
        assert!(!store.verify_passphrase(&Passphrase::new("other-pass")).await.unwrap());
    }

    #[tokio::test]
    async fn canary_row_must_hold_the_canary_record() {
        let (store, backend, _) = store();
        let p = Passphrase::new("first-pass");
        let cipher = Cipher::new(KdfParams::insecure_fast());
        let impostor = VaultRecord::new("profile", Value::String(CANARY_MARKER.to_string()));
        let envelope = cipher.seal_record(&impostor, &p).unwrap();
        backend.insert_row(RemoteRow::new("user-a", CANARY_KEY, envelope));
        assert!(!store.verify_passphrase(&p).await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_remote_never_provisions() {
        let (store, backend, _) = store();
        backend.set_offline(true);
        let err = store
            .verify_passphrase(&Passphrase::new("first-pass"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::RemoteUnavailable(_)));
        backend.set_offline(false);
        assert!(backend.row("user-a", CANARY_KEY).is_none());
    }

    #[tokio::test]
    async fn unauthenticated_fails_closed() {
        let (store, _, auth) = store();
        let p = Passphrase::new("hunter22");
        store.set("profile", &json!({"name": "a"}), &p).await.unwrap();
        auth.sign_out();
        assert_eq!(store.get("profile", &p).await, None);
        assert!(matches!(store.list_keys().await, Err(VaultError::Unauthenticated)));
        assert!(matches!(
            store.set("profile", &json!(1), &p).await,
            Err(VaultError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn rows_are_scoped_per_user() {
        let (store, _, auth) = store();
        let p = Passphrase::new("hunter22");
        store.set("profile", &json!("a's"), &p).await.unwrap();
        auth.sign_in(Principal::new("user-b"));
        assert_eq!(store.get("profile", &p).await, None);
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_keys_hides_canary() {
        let (store, _, _) = store();
        let p = Passphrase::new("hunter22");
        store.verify_passphrase(&p).await.unwrap();
        store.set("expenses", &json!([]), &p).await.unwrap();
        let keys: Vec<_> = store.list_keys().await.unwrap().into_iter().collect();
        assert_eq!(keys, vec!["expenses".to_string()]);
    }

    #[tokio::test]
    async fn strict_fetch_separates_absent_from_failure() {
        let (store, backend, _) = store();
        let p = Passphrase::new("hunter22");
        assert!(store.fetch("missing", &p).await.unwrap().is_none());
        backend.set_offline(true);
        assert!(store.fetch("missing", &p).await.is_err());
        assert_eq!(store.get("missing", &p).await, None);
    }
}
