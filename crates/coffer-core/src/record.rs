use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use zeroize::Zeroizing;

use crate::cipher::Envelope;
use crate::error::{Result, VaultError};

/// Reserved key whose sealed value is always [`CANARY_MARKER`].
pub const CANARY_KEY: &str = "__vault_canary__";
pub const CANARY_MARKER: &str = "ok";
pub const SCHEMA_VERSION: u32 = 1;

pub fn is_reserved_key(key: &str) -> bool {
    key == CANARY_KEY
}

/// The one key rule shared by writes and backup parsing, so anything a vault
/// can store is also importable.
pub(crate) fn ensure_writable_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(VaultError::InvalidKey(key.to_string()));
    }
    if is_reserved_key(key) {
        return Err(VaultError::ReservedKey(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultRecord {
    pub key: String,
    pub schema_version: u32,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

impl VaultRecord {
    pub fn new(key: impl Into<String>, data: Value) -> Self {
        Self {
            key: key.into(),
            schema_version: SCHEMA_VERSION,
            data,
            updated_at: Utc::now(),
        }
    }
}

/// What a local record file holds. The variant is fixed when the record is
/// written, so readers never guess from field presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    Encrypted(Envelope),
    /// Written only while the vault is locked; re-sealed on the next unlock.
    Plain(VaultRecord),
}

/// Session secret. Zeroized on drop and never serialized.
#[derive(Clone)]
pub struct Passphrase(Zeroizing<String>);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Length in characters, not bytes.
    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}
