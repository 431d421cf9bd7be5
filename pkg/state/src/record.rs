//! Record-store boundary.
//!
//! The in-memory state is authoritative; committed mutations are flushed
//! here best-effort so a restarted control plane can recover. The default
//! implementation is SlateDB on a local filesystem; tests use the in-memory
//! implementation.

use async_trait::async_trait;
use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use pkg_types::error::Error;

/// Flat key/value persistence for serialized entities.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    async fn delete(&self, key: &str) -> Result<(), Error>;
    /// All key-value pairs whose keys start with `prefix`.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error>;
    async fn close(&self) -> Result<(), Error>;
}

// ─── SlateDB ───────────────────────────────────────────────────────────────

/// Default collaborator: SlateDB over a local-filesystem object store. The
/// `/registry/...` keys from [`crate::watch::EntityRef::record_key`] map
/// straight onto its key space; pointing the object-store layer at a bucket
/// instead of a directory needs no change here.
pub struct SlateRecordStore {
    db: Db,
}

fn backend(op: &str, err: impl std::fmt::Display) -> Error {
    Error::Backend(format!("record store {op}: {err}"))
}

impl SlateRecordStore {
    /// Open the store under `path`, creating the directory on first boot.
    pub async fn open(path: &str) -> Result<Self, Error> {
        std::fs::create_dir_all(path).map_err(|e| backend("init", e))?;
        let root =
            LocalFileSystem::new_with_prefix(path).map_err(|e| backend("mount", e))?;
        let db = Db::open(Path::from("/"), Arc::new(root))
            .await
            .map_err(|e| backend("open", e))?;
        info!(path, "record store opened");
        Ok(Self { db })
    }
}

#[async_trait]
impl RecordStore for SlateRecordStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map_err(|e| backend("put", e))
            .map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let found = self
            .db
            .get(key.as_bytes())
            .await
            .map_err(|e| backend("get", e))?;
        Ok(found.map(|bytes| bytes.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| backend("delete", e))
            .map(|_| ())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let mut scan = self
            .db
            .scan_prefix(prefix.as_bytes())
            .await
            .map_err(|e| backend("scan", e))?;

        // A scan error mid-recovery must surface, not truncate the state.
        let mut entries = Vec::new();
        loop {
            match scan.next().await.map_err(|e| backend("scan", e))? {
                Some(kv) => entries.push((
                    String::from_utf8_lossy(&kv.key).into_owned(),
                    kv.value.to_vec(),
                )),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn close(&self) -> Result<(), Error> {
        info!("record store closing");
        self.db.close().await.map_err(|e| backend("close", e))
    }
}

// ─── In-memory (tests, ephemeral clusters) ─────────────────────────────────

#[derive(Default)]
pub struct MemoryRecordStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        Ok(self
            .entries
            .lock()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_prefix_scan() {
        let store = MemoryRecordStore::new();
        store.put("/registry/pods/a", b"1").await.unwrap();
        store.put("/registry/pods/b", b"2").await.unwrap();
        store.put("/registry/nodes/x", b"3").await.unwrap();

        let pods = store.list_prefix("/registry/pods/").await.unwrap();
        assert_eq!(pods.len(), 2);

        store.delete("/registry/pods/a").await.unwrap();
        let pods = store.list_prefix("/registry/pods/").await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].0, "/registry/pods/b");
    }
}
