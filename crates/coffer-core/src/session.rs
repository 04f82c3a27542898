//! The unlock-gated vault surface handed to the rest of the application.
//!
//! One [`VaultSession`] is built per process and shared by reference. It owns
//! the local store, the remote mirror, the held passphrase (through the local
//! store) and the lifecycle `Locked → Verifying → Unlocked | Failed`.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::AuthProvider;
use crate::cipher::Cipher;
use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::local::{LocalVaultStore, UnlockReport};
use crate::mirror::{spawn_mirror, MirrorHandle};
use crate::record::Passphrase;
use crate::remote::{HttpRemoteBackend, RemoteBackend, RemoteVaultStore};
use crate::snapshot::Snapshot;
use crate::sync::{SyncOutcome, SyncReconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Locked,
    Verifying,
    Unlocked,
    /// Locked after a rejected unlock attempt.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockOutcome {
    pub report: UnlockReport,
    pub sync: SyncOutcome,
    /// Verified against the local canary copy because the remote was unreachable.
    pub verified_offline: bool,
}

struct RemoteLink {
    store: Arc<RemoteVaultStore>,
    mirror: MirrorHandle,
}

pub struct VaultSession {
    local: Arc<LocalVaultStore>,
    remote: Option<RemoteLink>,
    auth: Arc<dyn AuthProvider>,
    min_passphrase_len: usize,
    state: RwLock<SessionState>,
    unlocked_for: RwLock<Option<String>>,
    /// Bumped by every lock; an unlock only commits if it is unchanged.
    generation: AtomicU64,
    refresh_tx: broadcast::Sender<SyncOutcome>,
}

impl VaultSession {
    /// Session mirrored to `backend`. Spawns the mirror task, so it must be
    /// called inside a Tokio runtime.
    pub fn new(
        config: &VaultConfig,
        backend: Arc<dyn RemoteBackend>,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Self> {
        let cipher = Cipher::new(config.kdf);
        let local = Arc::new(LocalVaultStore::open(config.records_dir(), cipher)?);
        let store = Arc::new(RemoteVaultStore::new(backend, auth.clone(), cipher));
        let (mirror, _task) = spawn_mirror(store.clone());
        local.attach_mirror(mirror.clone());
        Ok(Self::assemble(config, local, Some(RemoteLink { store, mirror }), auth))
    }

    /// Session without a remote: the local canary copy is the only
    /// passphrase check and is provisioned on first unlock.
    pub fn local_only(config: &VaultConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        let local = Arc::new(LocalVaultStore::open(
            config.records_dir(),
            Cipher::new(config.kdf),
        )?);
        Ok(Self::assemble(config, local, None, auth))
    }

    /// HTTP-mirrored when `remote_url` is set, local-only otherwise.
    pub fn from_config(config: &VaultConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        match &config.remote_url {
            Some(url) => {
                let backend = HttpRemoteBackend::new(url, config.request_timeout())?;
                Self::new(config, Arc::new(backend), auth)
            }
            None => Self::local_only(config, auth),
        }
    }

    fn assemble(
        config: &VaultConfig,
        local: Arc<LocalVaultStore>,
        remote: Option<RemoteLink>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let (refresh_tx, _) = broadcast::channel(16);
        Self {
            local,
            remote,
            auth,
            min_passphrase_len: config.min_passphrase_len,
            state: RwLock::new(SessionState::Locked),
            unlocked_for: RwLock::new(None),
            generation: AtomicU64::new(0),
            refresh_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == SessionState::Unlocked
    }

    pub fn local(&self) -> &LocalVaultStore {
        &self.local
    }

    pub fn remote(&self) -> Option<&RemoteVaultStore> {
        self.remote.as_ref().map(|link| link.store.as_ref())
    }

    /// Receives the outcome of every unlock whose reconciliation migrated
    /// keys; holders of derived state should re-read everything.
    pub fn subscribe_refresh(&self) -> broadcast::Receiver<SyncOutcome> {
        self.refresh_tx.subscribe()
    }

    /// Verifies `passphrase`, unlocks the local store and reconciles once.
    /// Calling it again while unlocked re-verifies from scratch.
    ///
    /// The unlock is bound to the principal signed in when it starts. A lock,
    /// sign-out or user switch before it completes makes it fail and leaves
    /// the cache empty.
    pub async fn unlock(&self, passphrase: &str) -> Result<UnlockOutcome> {
        let passphrase = Passphrase::new(passphrase);
        if passphrase.char_len() < self.min_passphrase_len {
            return Err(VaultError::PassphraseTooShort {
                min: self.min_passphrase_len,
            });
        }

        let principal = self.auth.current_principal();
        let user = principal.as_ref().map(|p| p.user_id.clone());
        let generation = {
            let mut state = self.state.write();
            *self.unlocked_for.write() = user.clone();
            *state = SessionState::Verifying;
            self.generation.load(Ordering::SeqCst)
        };
        let verified_offline = match self.verify(&passphrase).await {
            Ok(offline) => offline,
            Err(err) => {
                self.fail();
                return Err(err);
            }
        };
        if let Err(err) = self.check_current(generation, user.as_deref()) {
            self.fail();
            return Err(err);
        }

        let report = match self.local.unlock(&passphrase) {
            Ok(report) => report,
            Err(err) => {
                self.fail();
                return Err(err);
            }
        };

        let sync = match (&self.remote, principal) {
            (Some(link), Some(principal)) if !verified_offline => {
                if let Err(err) = self.local.store_canary(&passphrase) {
                    warn!(error = %err, "could not store local canary copy");
                }
                SyncReconciler::for_principal(&self.local, &link.store, principal)
                    .run(&passphrase)
                    .await
            }
            _ => SyncOutcome::default(),
        };
        if sync.has_migrations() {
            let _ = self.refresh_tx.send(sync.clone());
        }

        {
            let mut state = self.state.write();
            if let Err(err) = self.check_current(generation, user.as_deref()) {
                drop(state);
                self.fail();
                return Err(err);
            }
            *state = SessionState::Unlocked;
        }
        info!(
            offline = verified_offline,
            migrated = sync.migrated_keys.len(),
            "vault unlocked"
        );
        Ok(UnlockOutcome {
            report,
            sync,
            verified_offline,
        })
    }

    /// Returns whether verification happened offline.
    async fn verify(&self, passphrase: &Passphrase) -> Result<bool> {
        let Some(link) = &self.remote else {
            return match self.local.verify_canary(passphrase)? {
                Some(true) => Ok(true),
                Some(false) => Err(VaultError::PassphraseInvalid),
                None => {
                    if self.local.accepts_passphrase(passphrase)? == Some(false) {
                        return Err(VaultError::PassphraseInvalid);
                    }
                    self.local.store_canary(passphrase)?;
                    info!("provisioned local vault canary");
                    Ok(true)
                }
            };
        };

        match link.store.verify_passphrase(passphrase).await {
            Ok(true) => Ok(false),
            Ok(false) => Err(VaultError::PassphraseInvalid),
            Err(err) if err.is_remote_transient() => match self.local.verify_canary(passphrase)? {
                Some(true) => {
                    warn!(error = %err, "remote unavailable; verified against local canary");
                    Ok(true)
                }
                Some(false) => Err(VaultError::PassphraseInvalid),
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Drops the passphrase and the session cache immediately.
    pub fn lock(&self) {
        self.reset(SessionState::Locked);
        info!("vault locked");
    }

    fn fail(&self) {
        self.reset(SessionState::Failed);
    }

    fn reset(&self, next: SessionState) {
        let mut state = self.state.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.local.lock();
        *self.unlocked_for.write() = None;
        *state = next;
    }

    fn current_user(&self) -> Option<String> {
        self.auth.current_principal().map(|p| p.user_id)
    }

    /// Fails when a lock happened since `generation` was read or the
    /// principal is no longer `principal`.
    fn check_current(&self, generation: u64, principal: Option<&str>) -> Result<()> {
        if self.current_user().as_deref() != principal {
            return Err(VaultError::Unauthenticated);
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(VaultError::Locked);
        }
        Ok(())
    }

    /// Locks first if the principal changed since unlock, so nothing is read
    /// or mirrored on behalf of another user.
    fn regate(&self) {
        if self.must_lock_for(self.current_user().as_deref()) {
            info!("principal changed since unlock; locking vault");
            self.lock();
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.regate();
        self.local.get(key)
    }

    pub fn set(&self, key: &str, payload: Value) -> bool {
        self.regate();
        match self.local.set(key, payload) {
            Ok(()) => true,
            Err(err) => {
                warn!(key = %key, error = %err, "vault write failed");
                false
            }
        }
    }

    pub fn remove(&self, key: &str) {
        self.regate();
        if let Err(err) = self.local.remove(key) {
            warn!(key = %key, error = %err, "vault remove failed");
        }
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.local.keys()
    }

    pub fn export_all(&self) -> Result<Snapshot> {
        self.regate();
        self.local.export_all()
    }

    pub fn import_all(&self, snapshot: &Snapshot) -> bool {
        self.regate();
        self.local.import_all(snapshot)
    }

    /// Validates a backup file before writing anything from it.
    pub fn import_json(&self, raw: &str) -> Result<bool> {
        let snapshot = Snapshot::parse(raw)?;
        Ok(self.import_all(&snapshot))
    }

    /// Waits until every remote write enqueued so far has been attempted.
    pub async fn flush_mirror(&self) {
        if let Some(link) = &self.remote {
            link.mirror.flush().await;
        }
    }

    /// Locks the session whenever the principal signs out or changes.
    pub fn watch_sign_out(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.auth.subscribe();
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().as_ref().map(|p| p.user_id.clone());
                let Some(session) = session.upgrade() else {
                    break;
                };
                if session.must_lock_for(current.as_deref()) {
                    info!("principal changed; locking vault");
                    session.lock();
                }
            }
        })
    }

    /// Any change of principal since an unlock started re-gates the vault,
    /// including a sign-in after an unlock made while signed out.
    fn must_lock_for(&self, current: Option<&str>) -> bool {
        match self.state() {
            SessionState::Unlocked | SessionState::Verifying => {
                current != self.unlocked_for.read().as_deref()
            }
            SessionState::Locked | SessionState::Failed => false,
        }
    }
}
