use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cipher::KdfParams;
use crate::error::Result;

pub const DEFAULT_MIN_PASSPHRASE_LEN: usize = 6;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_min_len")]
    pub min_passphrase_len: usize,
    #[serde(default)]
    pub kdf: KdfParams,
}

impl VaultConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            remote_url: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            min_passphrase_len: DEFAULT_MIN_PASSPHRASE_LEN,
            kdf: KdfParams::default(),
        }
    }

    /// Reads `config.json` from the data directory if present, then applies
    /// `COFFER_REMOTE_URL`.
    pub fn load() -> Result<Self> {
        Self::load_from(crate::paths::data_dir()?)
    }

    /// Like [`VaultConfig::load`] with an explicit data directory.
    pub fn load_from(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let path = crate::paths::config_path(&data_dir);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::new(data_dir)
        };
        if let Ok(url) = std::env::var("COFFER_REMOTE_URL") {
            if !url.is_empty() {
                config.remote_url = Some(url);
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn records_dir(&self) -> PathBuf {
        crate::paths::records_dir(&self.data_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_min_len() -> usize {
    DEFAULT_MIN_PASSPHRASE_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"data_dir": "/var/lib/coffer"}"#).unwrap();
        let config = VaultConfig::from_file(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/coffer"));
        assert_eq!(config.min_passphrase_len, 6);
        assert_eq!(config.kdf, KdfParams::default());
        assert!(config.remote_url.is_none());
        assert_eq!(config.records_dir(), PathBuf::from("/var/lib/coffer/records"));
    }
}
