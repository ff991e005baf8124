use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

#[cfg(feature = "backend-redb")]
mod redb;

#[cfg(feature = "backend-redb")]
pub use self::redb::RedbLinkBackend;

/// A stored value and the version it was written at. Absent keys are
/// version `0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Vec<u8>,
}

/// Compare-and-swap write: applied only if the key is still at
/// `expected_version`, after which it is at `expected_version + 1`.
///
/// A write without a value only asserts the version; the key is left as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedWrite {
    pub key: String,
    pub expected_version: u64,
    pub value: Option<Vec<u8>>,
}

impl VersionedWrite {
    pub fn put<K: Into<String>>(key: K, expected_version: u64, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            expected_version,
            value: Some(value),
        }
    }

    /// Version assertion for a key the batch read but does not change.
    pub fn check<K: Into<String>>(key: K, expected_version: u64) -> Self {
        Self {
            key: key.into(),
            expected_version,
            value: None,
        }
    }
}

/// Key-value storage for link buckets with optimistic versioning.
pub trait LinkBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Versioned>, LinkError>;

    /// Apply every write or none. Any version mismatch, including one on a
    /// check-only entry, fails the whole batch with
    /// [`LinkError::VersionConflict`].
    fn commit(&self, writes: Vec<VersionedWrite>) -> Result<(), LinkError>;

    /// Visit every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(
        &self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, Versioned) -> Result<(), LinkError>,
    ) -> Result<(), LinkError>;

    fn flush(&self) -> Result<(), LinkError> {
        Ok(())
    }
}

/// Selects a link backend. Deserializes from `{ backend: in_memory }` or
/// `{ backend: redb, path: /data/links.redb }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum LinkBackendConfig {
    #[default]
    InMemory,
    Redb { path: String },
}

impl LinkBackendConfig {
    pub fn in_memory() -> Self {
        LinkBackendConfig::InMemory
    }

    pub fn redb<P: Into<String>>(path: P) -> Self {
        LinkBackendConfig::Redb { path: path.into() }
    }

    pub fn build(&self) -> Result<Arc<dyn LinkBackend>, LinkError> {
        match self {
            LinkBackendConfig::InMemory => Ok(Arc::new(InMemoryLinkBackend::new())),
            LinkBackendConfig::Redb { path } => {
                #[cfg(feature = "backend-redb")]
                {
                    Ok(Arc::new(RedbLinkBackend::open(path)?))
                }
                #[cfg(not(feature = "backend-redb"))]
                {
                    let _ = path;
                    Err(LinkError::backend("redb backend disabled at compile time"))
                }
            }
        }
    }
}

/// `RwLock<HashMap>` backend. Commits take the write lock, so a batch is
/// checked and applied atomically.
#[derive(Default)]
pub struct InMemoryLinkBackend {
    entries: RwLock<HashMap<String, Versioned>>,
}

impl InMemoryLinkBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LinkBackend for InMemoryLinkBackend {
    fn get(&self, key: &str) -> Result<Option<Versioned>, LinkError> {
        let guard = self
            .entries
            .read()
            .map_err(|_| LinkError::backend("poisoned lock"))?;
        Ok(guard.get(key).cloned())
    }

    fn commit(&self, writes: Vec<VersionedWrite>) -> Result<(), LinkError> {
        let mut guard = self
            .entries
            .write()
            .map_err(|_| LinkError::backend("poisoned lock"))?;
        for write in &writes {
            let actual = guard.get(&write.key).map_or(0, |entry| entry.version);
            if actual != write.expected_version {
                return Err(LinkError::VersionConflict {
                    key: write.key.clone(),
                    expected: write.expected_version,
                    actual,
                });
            }
        }
        for write in writes {
            if let Some(value) = write.value {
                guard.insert(
                    write.key,
                    Versioned {
                        version: write.expected_version + 1,
                        value,
                    },
                );
            }
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, Versioned) -> Result<(), LinkError>,
    ) -> Result<(), LinkError> {
        let mut matching: Vec<(String, Versioned)> = {
            let guard = self
                .entries
                .read()
                .map_err(|_| LinkError::backend("poisoned lock"))?;
            guard
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect()
        };
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, entry) in matching {
            visitor(&key, entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(key: &str, expected: u64, value: &[u8]) -> VersionedWrite {
        VersionedWrite::put(key, expected, value.to_vec())
    }

    #[test]
    fn commit_bumps_versions() {
        let backend = InMemoryLinkBackend::new();
        backend.commit(vec![write("a", 0, b"one")]).unwrap();
        backend.commit(vec![write("a", 1, b"two")]).unwrap();
        let entry = backend.get("a").unwrap().unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(entry.value, b"two");
        assert!(backend.get("missing").unwrap().is_none());
    }

    #[test]
    fn conflicting_batch_applies_nothing() {
        let backend = InMemoryLinkBackend::new();
        backend.commit(vec![write("a", 0, b"one")]).unwrap();

        let err = backend
            .commit(vec![write("b", 0, b"new"), write("a", 0, b"stale")])
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::VersionConflict { ref key, expected: 0, actual: 1 } if key == "a"
        ));
        assert!(backend.get("b").unwrap().is_none());
        assert_eq!(backend.get("a").unwrap().unwrap().value, b"one");
    }

    #[test]
    fn check_only_entries_guard_without_writing() {
        let backend = InMemoryLinkBackend::new();
        backend.commit(vec![write("a", 0, b"one")]).unwrap();

        backend
            .commit(vec![write("b", 0, b"new"), VersionedWrite::check("a", 1)])
            .unwrap();
        assert_eq!(backend.get("a").unwrap().unwrap().version, 1);
        assert_eq!(backend.get("b").unwrap().unwrap().version, 1);

        // An absent key is version 0; once written, a stale check fails the batch.
        backend.commit(vec![write("c", 0, b"c")]).unwrap();
        let err = backend
            .commit(vec![write("d", 0, b"d"), VersionedWrite::check("c", 0)])
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(backend.get("d").unwrap().is_none());
    }

    #[test]
    fn scan_is_prefix_bounded_and_ordered() {
        let backend = InMemoryLinkBackend::new();
        backend
            .commit(vec![
                write("golden:b", 0, b"2"),
                write("golden:a", 0, b"1"),
                write("source:a", 0, b"x"),
            ])
            .unwrap();
        let mut keys = Vec::new();
        backend
            .scan_prefix("golden:", &mut |key, _| {
                keys.push(key.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(keys, vec!["golden:a", "golden:b"]);
    }

    #[test]
    fn config_deserializes_from_tagged_form() {
        let cfg: LinkBackendConfig =
            serde_json::from_str(r#"{ "backend": "redb", "path": "/tmp/links.redb" }"#).unwrap();
        assert_eq!(cfg, LinkBackendConfig::redb("/tmp/links.redb"));
        let cfg: LinkBackendConfig = serde_json::from_str(r#"{ "backend": "in_memory" }"#).unwrap();
        assert_eq!(cfg, LinkBackendConfig::InMemory);
    }
}
