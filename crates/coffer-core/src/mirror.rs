//! Background remote writes fed by the local write path.
//!
//! Local writes enqueue sealed envelopes (never plaintext) on an unbounded
//! channel and return immediately. Each op is bound to the principal signed
//! in when it was enqueued, so a later user switch cannot redirect it. A
//! single task drains the channel in order; a failed write is logged and
//! dropped.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::Principal;
use crate::cipher::Envelope;
use crate::remote::RemoteVaultStore;

#[derive(Debug)]
pub enum MirrorOp {
    Upsert {
        principal: Principal,
        key: String,
        envelope: Envelope,
    },
    Delete {
        principal: Principal,
        key: String,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct MirrorHandle {
    tx: mpsc::UnboundedSender<MirrorOp>,
    remote: Arc<RemoteVaultStore>,
}

impl MirrorHandle {
    pub fn upsert(&self, key: &str, envelope: Envelope) {
        let Some(principal) = self.principal(key) else {
            return;
        };
        self.send(MirrorOp::Upsert {
            principal,
            key: key.to_string(),
            envelope,
        });
    }

    pub fn delete(&self, key: &str) {
        let Some(principal) = self.principal(key) else {
            return;
        };
        self.send(MirrorOp::Delete {
            principal,
            key: key.to_string(),
        });
    }

    fn principal(&self, key: &str) -> Option<Principal> {
        let principal = self.remote.current_principal();
        if principal.is_none() {
            debug!(key = %key, "no signed-in user; not mirroring");
        }
        principal
    }

    /// Resolves once everything enqueued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(MirrorOp::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn send(&self, op: MirrorOp) {
        if self.tx.send(op).is_err() {
            warn!("remote mirror stopped; dropping write");
        }
    }
}

pub fn spawn_mirror(remote: Arc<RemoteVaultStore>) -> (MirrorHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = MirrorHandle {
        tx,
        remote: remote.clone(),
    };
    let task = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                MirrorOp::Upsert {
                    principal,
                    key,
                    envelope,
                } => match remote.put_envelope_as(&principal, &key, envelope).await {
                    Ok(()) => debug!(key = %key, "mirrored write"),
                    Err(err) => warn!(key = %key, error = %err, "remote mirror write failed"),
                },
                MirrorOp::Delete { principal, key } => {
                    if let Err(err) = remote.remove_as(&principal, &key).await {
                        warn!(key = %key, error = %err, "remote mirror delete failed");
                    }
                }
                MirrorOp::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("remote mirror drained");
    });
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSession;
    use crate::cipher::{Cipher, KdfParams};
    use crate::record::Passphrase;
    use crate::remote::MemoryRemoteBackend;

    #[tokio::test]
    async fn drains_in_order_and_survives_failures() {
        let backend = Arc::new(MemoryRemoteBackend::new());
        let auth = Arc::new(AuthSession::signed_in(Principal::new("u")));
        let cipher = Cipher::new(KdfParams::insecure_fast());
        let remote = Arc::new(RemoteVaultStore::new(backend.clone(), auth, cipher));
        let (handle, _task) = spawn_mirror(remote);
        let p = Passphrase::new("hunter22");

        backend.set_offline(true);
        handle.upsert("lost", cipher.encrypt(b"{}", &p).unwrap());
        handle.flush().await;
        backend.set_offline(false);

        handle.upsert("kept", cipher.encrypt(b"{}", &p).unwrap());
        handle.upsert("gone", cipher.encrypt(b"{}", &p).unwrap());
        handle.delete("gone");
        handle.flush().await;

        assert!(backend.row("u", "lost").is_none());
        assert!(backend.row("u", "kept").is_some());
        assert!(backend.row("u", "gone").is_none());
    }

    #[tokio::test]
    async fn queued_writes_stay_with_their_principal() {
        let backend = Arc::new(MemoryRemoteBackend::new());
        let auth = Arc::new(AuthSession::signed_in(Principal::new("first")));
        let cipher = Cipher::new(KdfParams::insecure_fast());
        let remote = Arc::new(RemoteVaultStore::new(backend.clone(), auth.clone(), cipher));
        let (handle, _task) = spawn_mirror(remote);
        let p = Passphrase::new("hunter22");

        handle.upsert("accounts", cipher.encrypt(b"{}", &p).unwrap());
        auth.sign_in(Principal::new("second"));
        handle.flush().await;
        assert!(backend.row("first", "accounts").is_some());
        assert!(backend.row("second", "accounts").is_none());

        auth.sign_out();
        handle.upsert("profile", cipher.encrypt(b"{}", &p).unwrap());
        handle.flush().await;
        assert!(backend.row("first", "profile").is_none());
        assert!(backend.row("second", "profile").is_none());
    }
}
