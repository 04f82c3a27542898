use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Result, VaultError};
use crate::record::ensure_writable_key;

/// Backup file contents: every logical key mapped to its decrypted payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, Value>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a backup file. Nothing is written on failure, so
    /// a malformed file is rejected as a whole.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| VaultError::ImportMalformed(format!("not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(VaultError::ImportMalformed(
                "top level must be an object of key/payload pairs".to_string(),
            ));
        };
        let mut entries = BTreeMap::new();
        for (key, payload) in map {
            ensure_writable_key(&key).map_err(|e| VaultError::ImportMalformed(e.to_string()))?;
            entries.insert(key, payload);
        }
        Ok(Self(entries))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.0)?)
    }

    pub fn insert(&mut self, key: impl Into<String>, payload: Value) {
        self.0.insert(key.into(), payload);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CANARY_KEY;

    #[test]
    fn parses_flat_object() {
        let snap = Snapshot::parse(r#"{"accounts": [{"id": 1}], "profile": {"name": "x"}}"#).unwrap();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("profile").unwrap()["name"], "x");
    }

    #[test]
    fn rejects_bad_shapes() {
        for raw in ["[1, 2]", "\"text\"", "{not json", "{\"\": 1}", "null"] {
            let err = Snapshot::parse(raw).unwrap_err();
            assert!(matches!(err, VaultError::ImportMalformed(_)), "{raw}");
        }
        let raw = format!("{{\"{CANARY_KEY}\": \"ok\"}}");
        assert!(matches!(Snapshot::parse(&raw), Err(VaultError::ImportMalformed(_))));
    }

    #[test]
    fn export_format_is_flat() {
        let snap: Snapshot = vec![("budget".to_string(), serde_json::json!({"limit": 10}))]
            .into_iter()
            .collect();
        let json = snap.to_json_pretty().unwrap();
        assert_eq!(Snapshot::parse(&json).unwrap(), snap);
        assert!(json.contains("\"budget\""));
    }

    #[test]
    fn padded_keys_survive_export() {
        let mut snap = Snapshot::new();
        snap.insert(" padded key ", serde_json::json!(1));
        let json = snap.to_json_pretty().unwrap();
        assert_eq!(Snapshot::parse(&json).unwrap(), snap);
        assert!(matches!(
            Snapshot::parse(r#"{"   ": 1}"#),
            Err(VaultError::ImportMalformed(_))
        ));
    }
}
