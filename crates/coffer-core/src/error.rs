use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("passphrase too short; minimum {min} characters")]
    PassphraseTooShort { min: usize },

    #[error("passphrase does not match this vault")]
    PassphraseInvalid,

    /// Wrong passphrase and tampered data are indistinguishable here.
    #[error("decryption failed (authentication tag mismatch)")]
    DecryptionFailure,

    #[error("encryption failed")]
    EncryptionFailure,

    #[error("remote vault unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("no authenticated user")]
    Unauthenticated,

    #[error("backup file malformed: {0}")]
    ImportMalformed(String),

    #[error("key is reserved: {0}")]
    ReservedKey(String),

    #[error("key must not be blank: {0:?}")]
    InvalidKey(String),

    #[error("vault is locked")]
    Locked,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    /// True for failures that only mean "the remote could not be asked".
    pub fn is_remote_transient(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_) | Self::Unauthenticated)
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        Self::RemoteUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
