//! Redb link backend.
//!
//! Each value is stored as an 8-byte big-endian version followed by the
//! payload. A commit runs in a single write transaction: versions are checked
//! first and the transaction is dropped without committing on any mismatch.
//!
//! ```yaml
//! storage:
//!   backend: redb
//!   path: /data/links.redb
//! ```

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::backend::{LinkBackend, Versioned, VersionedWrite};
use crate::error::LinkError;

const LINK_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("mdm_links");

const VERSION_LEN: usize = 8;

fn encode_entry(version: u64, value: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(VERSION_LEN + value.len());
    bytes.extend_from_slice(&version.to_be_bytes());
    bytes.extend_from_slice(value);
    bytes
}

fn decode_entry(bytes: &[u8]) -> Result<Versioned, LinkError> {
    if bytes.len() < VERSION_LEN {
        return Err(LinkError::Decode(format!(
            "link entry is {} bytes, shorter than its version header",
            bytes.len()
        )));
    }
    let (header, value) = bytes.split_at(VERSION_LEN);
    let mut version = [0u8; VERSION_LEN];
    version.copy_from_slice(header);
    Ok(Versioned {
        version: u64::from_be_bytes(version),
        value: value.to_vec(),
    })
}

/// Persistent link storage in a redb file.
pub struct RedbLinkBackend {
    db: Arc<Database>,
}

impl RedbLinkBackend {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let db = Database::create(path).map_err(LinkError::backend)?;

        let write_txn = db.begin_write().map_err(LinkError::backend)?;
        {
            let _table = write_txn.open_table(LINK_TABLE).map_err(LinkError::backend)?;
        }
        write_txn.commit().map_err(LinkError::backend)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl LinkBackend for RedbLinkBackend {
    fn get(&self, key: &str) -> Result<Option<Versioned>, LinkError> {
        let read_txn = self.db.begin_read().map_err(LinkError::backend)?;
        let table = read_txn.open_table(LINK_TABLE).map_err(LinkError::backend)?;
        match table.get(key).map_err(LinkError::backend)? {
            Some(value) => Ok(Some(decode_entry(value.value())?)),
            None => Ok(None),
        }
    }

    fn commit(&self, writes: Vec<VersionedWrite>) -> Result<(), LinkError> {
        let write_txn = self.db.begin_write().map_err(LinkError::backend)?;
        {
            let mut table = write_txn.open_table(LINK_TABLE).map_err(LinkError::backend)?;

            for write in &writes {
                let actual = match table.get(write.key.as_str()).map_err(LinkError::backend)? {
                    Some(value) => decode_entry(value.value())?.version,
                    None => 0,
                };
                if actual != write.expected_version {
                    // Dropping the uncommitted transaction discards it.
                    return Err(LinkError::VersionConflict {
                        key: write.key.clone(),
                        expected: write.expected_version,
                        actual,
                    });
                }
            }

            for write in &writes {
                let Some(value) = &write.value else {
                    continue;
                };
                let entry = encode_entry(write.expected_version + 1, value);
                table
                    .insert(write.key.as_str(), entry.as_slice())
                    .map_err(LinkError::backend)?;
            }
        }
        write_txn.commit().map_err(LinkError::backend)?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, Versioned) -> Result<(), LinkError>,
    ) -> Result<(), LinkError> {
        let read_txn = self.db.begin_read().map_err(LinkError::backend)?;
        let table = read_txn.open_table(LINK_TABLE).map_err(LinkError::backend)?;

        for item in table.range(prefix..).map_err(LinkError::backend)? {
            let (key, value) = item.map_err(LinkError::backend)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            visitor(key, decode_entry(value.value())?)?;
        }
        Ok(())
    }
}
