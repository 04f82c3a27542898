//! On-device vault storage.
//!
//! Each logical key is one JSON file under the records directory, named by
//! the hex encoding of the key and holding a [`StoredRecord`]. While unlocked
//! the store keeps every payload it could decrypt in an in-memory cache; reads
//! never touch disk in that state.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cipher::{Cipher, Envelope};
use crate::error::{Result, VaultError};
use crate::mirror::MirrorHandle;
use crate::record::{
    ensure_writable_key, Passphrase, StoredRecord, VaultRecord, CANARY_KEY, CANARY_MARKER,
};
use crate::snapshot::Snapshot;

const RECORD_EXT: &str = "json";
const CANARY_FILE: &str = "canary.seal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalState {
    #[default]
    Locked,
    Unlocking,
    Unlocked,
}

#[derive(Default)]
struct Session {
    state: LocalState,
    passphrase: Option<Passphrase>,
    cache: HashMap<String, Value>,
}

/// Outcome of one [`LocalVaultStore::unlock`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockReport {
    pub loaded: usize,
    pub resealed: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct LocalVaultStore {
    dir: PathBuf,
    cipher: Cipher,
    session: RwLock<Session>,
    mirror: RwLock<Option<MirrorHandle>>,
}

impl LocalVaultStore {
    pub fn open(dir: impl Into<PathBuf>, cipher: Cipher) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        restrict_dir_permissions(&dir);
        Ok(Self {
            dir,
            cipher,
            session: RwLock::new(Session::default()),
            mirror: RwLock::new(None),
        })
    }

    /// Routes unlocked writes and deletes to the remote mirror.
    pub fn attach_mirror(&self, handle: MirrorHandle) {
        *self.mirror.write() = Some(handle);
    }

    pub fn state(&self) -> LocalState {
        self.session.read().state
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == LocalState::Unlocked
    }

    /// Every persisted key, decryptable or not, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match hex::decode(stem).ok().and_then(|raw| String::from_utf8(raw).ok()) {
                Some(key) => keys.push(key),
                None => warn!(path = %path.display(), "ignoring unrecognised file in vault dir"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Decrypts every persisted record into the session cache. A record that
    /// cannot be read or decrypted is skipped; it never blocks the others.
    pub fn unlock(&self, passphrase: &Passphrase) -> Result<UnlockReport> {
        self.session.write().state = LocalState::Unlocking;
        let keys = match self.keys() {
            Ok(keys) => keys,
            Err(err) => {
                self.session.write().state = LocalState::Locked;
                return Err(err);
            }
        };

        let mut report = UnlockReport::default();
        let mut cache = HashMap::with_capacity(keys.len());
        for key in keys {
            match self.read_record(&key) {
                Ok(Some(StoredRecord::Encrypted(envelope))) => {
                    match self.open_for_key(&key, &envelope, passphrase) {
                        Ok(record) => {
                            cache.insert(key, record.data);
                        }
                        Err(err) => {
                            warn!(key = %key, error = %err, "skipping undecryptable record");
                            report.skipped.push(key);
                        }
                    }
                }
                Ok(Some(StoredRecord::Plain(record))) => {
                    match self.reseal(&key, &record, passphrase) {
                        Ok(()) => report.resealed.push(key.clone()),
                        Err(err) => warn!(key = %key, error = %err, "could not reseal plain record"),
                    }
                    cache.insert(key, record.data);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unreadable record");
                    report.skipped.push(key);
                }
            }
        }
        report.loaded = cache.len();

        let mut session = self.session.write();
        session.cache = cache;
        session.passphrase = Some(passphrase.clone());
        session.state = LocalState::Unlocked;
        info!(
            loaded = report.loaded,
            resealed = report.resealed.len(),
            skipped = report.skipped.len(),
            "local vault unlocked"
        );
        Ok(report)
    }

    /// Drops the passphrase and every cached payload.
    pub fn lock(&self) {
        let mut session = self.session.write();
        *session = Session::default();
        debug!("local vault locked");
    }

    /// Cached payload while unlocked; while locked only plain fallback
    /// records are readable.
    pub fn get(&self, key: &str) -> Option<Value> {
        {
            let session = self.session.read();
            if session.state == LocalState::Unlocked {
                return session.cache.get(key).cloned();
            }
        }
        match self.read_record(key) {
            Ok(Some(StoredRecord::Plain(record))) => Some(record.data),
            _ => None,
        }
    }

    /// Replaces the whole record for `key`. Unlocked: sealed, persisted,
    /// cached and mirrored. Locked: persisted as a plain fallback record.
    pub fn set(&self, key: &str, payload: Value) -> Result<()> {
        self.write(key, payload, true)
    }

    /// Sealed local write that is not mirrored; used when the payload came
    /// from the remote.
    pub fn store_synced(&self, key: &str, payload: Value) -> Result<()> {
        if !self.is_unlocked() {
            return Err(VaultError::Locked);
        }
        self.write(key, payload, false)
    }

    fn write(&self, key: &str, payload: Value, mirrored: bool) -> Result<()> {
        ensure_writable_key(key)?;
        let passphrase = {
            let session = self.session.read();
            match session.state {
                LocalState::Unlocked => session.passphrase.clone(),
                _ => None,
            }
        };
        let record = VaultRecord::new(key, payload);

        let Some(passphrase) = passphrase else {
            self.write_record(key, &StoredRecord::Plain(record))?;
            debug!(key = %key, "stored plain fallback record while locked");
            return Ok(());
        };

        let envelope = self.cipher.seal_record(&record, &passphrase)?;
        self.write_record(key, &StoredRecord::Encrypted(envelope))?;
        if mirrored {
            if let Some(mirror) = self.mirror.read().as_ref() {
                mirror.upsert(key, self.cipher.seal_record(&record, &passphrase)?);
            }
        }
        let mut session = self.session.write();
        if session.state == LocalState::Unlocked {
            session.cache.insert(key.to_string(), record.data);
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let unlocked = {
            let mut session = self.session.write();
            session.cache.remove(key);
            session.state == LocalState::Unlocked
        };
        if unlocked {
            if let Some(mirror) = self.mirror.read().as_ref() {
                mirror.delete(key);
            }
        }
        Ok(())
    }

    /// Every readable payload. Locked stores only expose plain records.
    pub fn export_all(&self) -> Result<Snapshot> {
        {
            let session = self.session.read();
            if session.state == LocalState::Unlocked {
                return Ok(session
                    .cache
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect());
            }
        }
        let mut snapshot = Snapshot::new();
        for key in self.keys()? {
            if let Ok(Some(StoredRecord::Plain(record))) = self.read_record(&key) {
                snapshot.insert(key, record.data);
            }
        }
        Ok(snapshot)
    }

    /// Writes every entry; true only if every write completed.
    pub fn import_all(&self, snapshot: &Snapshot) -> bool {
        let mut all_ok = true;
        for (key, payload) in snapshot.iter() {
            if let Err(err) = self.set(key, payload.clone()) {
                warn!(key = %key, error = %err, "import write failed");
                all_ok = false;
            }
        }
        all_ok
    }

    /// Keeps a sealed copy of the canary so the passphrase can be checked
    /// while the remote is unreachable.
    pub fn store_canary(&self, passphrase: &Passphrase) -> Result<()> {
        let canary = VaultRecord::new(CANARY_KEY, Value::String(CANARY_MARKER.to_string()));
        let envelope = self.cipher.seal_record(&canary, passphrase)?;
        atomic_write(&self.dir.join(CANARY_FILE), &serde_json::to_vec(&envelope)?)
    }

    /// `None` when no usable local canary copy exists. An unparsable copy
    /// counts as absent; the next successful unlock rewrites it.
    pub fn verify_canary(&self, passphrase: &Passphrase) -> Result<Option<bool>> {
        let path = self.dir.join(CANARY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let envelope: Envelope = match serde_json::from_slice(&fs::read(&path)?) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring corrupt local canary copy");
                return Ok(None);
            }
        };
        match self.open_for_key(CANARY_KEY, &envelope, passphrase) {
            Ok(record) => Ok(Some(record.data == Value::String(CANARY_MARKER.to_string()))),
            Err(VaultError::DecryptionFailure) => Ok(Some(false)),
            Err(err) => Err(err),
        }
    }

    /// Tries `passphrase` on the first sealed record. `None` when nothing is
    /// sealed yet.
    pub fn accepts_passphrase(&self, passphrase: &Passphrase) -> Result<Option<bool>> {
        for key in self.keys()? {
            if let Ok(Some(StoredRecord::Encrypted(envelope))) = self.read_record(&key) {
                return Ok(Some(self.open_for_key(&key, &envelope, passphrase).is_ok()));
            }
        }
        Ok(None)
    }

    fn reseal(&self, key: &str, record: &VaultRecord, passphrase: &Passphrase) -> Result<()> {
        let envelope = self.cipher.seal_record(record, passphrase)?;
        self.write_record(key, &StoredRecord::Encrypted(envelope))
    }

    fn open_for_key(
        &self,
        key: &str,
        envelope: &Envelope,
        passphrase: &Passphrase,
    ) -> Result<VaultRecord> {
        let record = self.cipher.open_record(envelope, passphrase)?;
        // a record moved to another key's file is not that key's data
        if record.key != key {
            return Err(VaultError::DecryptionFailure);
        }
        Ok(record)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hex::encode(key.as_bytes()), RECORD_EXT))
    }

    fn read_record(&self, key: &str) -> Result<Option<StoredRecord>> {
        let path = self.record_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn write_record(&self, key: &str, record: &StoredRecord) -> Result<()> {
        atomic_write(&self.record_path(key), &serde_json::to_vec(record)?)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn restrict_dir_permissions(dir: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(err) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
            warn!(path = %dir.display(), error = %err, "could not restrict vault dir permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
