//! coffer-core: passphrase-encrypted key-value vault with a remote mirror
//!
//! # Storage model
//! - Every logical key holds one JSON payload, sealed with ChaCha20-Poly1305
//!   under a key derived from the user passphrase via Argon2id. Each write
//!   uses a fresh salt and nonce.
//! - The local store is authoritative for reads; the remote copy is a
//!   per-user mirror fed in the background and reconciled once per unlock.
//! - Plaintext exists only in the session cache, and only while unlocked.
//!
//! # Module layout
//! - `cipher`    : Argon2id + ChaCha20-Poly1305 envelopes
//! - `record`    : record/stored-record shapes, reserved keys, passphrase newtype
//! - `local`     : on-device store and session cache
//! - `remote`    : remote store over a pluggable backend (HTTP, in-memory)
//! - `mirror`    : background remote write queue
//! - `sync`      : key-presence reconciliation
//! - `session`   : the unlock-gated surface applications use
//! - `snapshot`  : backup file export/import shape
//! - `auth`      : principal provider consumed by the remote store
//! - `config` / `paths` : settings file and data directory
//! - `error`     : unified error type

pub mod auth;
pub mod cipher;
pub mod config;
pub mod error;
pub mod local;
pub mod mirror;
pub mod paths;
pub mod record;
pub mod remote;
pub mod session;
pub mod snapshot;
pub mod sync;

pub use auth::{AuthProvider, AuthSession, Principal};
pub use cipher::{Cipher, Envelope, KdfParams};
pub use config::VaultConfig;
pub use error::{Result, VaultError};
pub use local::{LocalVaultStore, UnlockReport};
pub use record::{Passphrase, StoredRecord, VaultRecord};
pub use remote::{HttpRemoteBackend, MemoryRemoteBackend, RemoteBackend, RemoteVaultStore};
pub use session::{SessionState, UnlockOutcome, VaultSession};
pub use snapshot::Snapshot;
pub use sync::{SyncOutcome, SyncReconciler};
