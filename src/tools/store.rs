//! Durable backing for the tool registry.
//!
//! The registry is the in-memory source of truth; this store is its
//! write-behind. The interface is deliberately narrow so external backends
//! can be dropped in.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StorageError;

use super::types::Toolkit;

const TOOLKIT_PREFIX: &str = "toolkits:";

/// Narrow persistence interface for registered toolkits.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn save(&self, toolkit: &Toolkit) -> Result<(), StorageError>;
    async fn get(&self, id: Uuid) -> Result<Option<Toolkit>, StorageError>;
    async fn list(&self) -> Result<Vec<Toolkit>, StorageError>;
    async fn delete(&self, id: Uuid) -> Result<(), StorageError>;
}

/// Sled-backed registry store under the `toolkits:` keyspace.
pub struct SledRegistryStore {
    tree: sled::Tree,
}

impl SledRegistryStore {
    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree("registry")?;
        Ok(Self { tree })
    }

    fn key(id: Uuid) -> String {
        format!("{TOOLKIT_PREFIX}{id}")
    }
}

#[async_trait]
impl RegistryStore for SledRegistryStore {
    async fn save(&self, toolkit: &Toolkit) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(toolkit).map_err(|e| StorageError::Write(e.to_string()))?;
        self.tree.insert(Self::key(toolkit.id), bytes)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Toolkit>, StorageError> {
        let Some(bytes) = self.tree.get(Self::key(id))? else {
            return Ok(None);
        };
        let toolkit = serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
            key: Self::key(id),
            reason: e.to_string(),
        })?;
        Ok(Some(toolkit))
    }

    async fn list(&self) -> Result<Vec<Toolkit>, StorageError> {
        let mut toolkits = Vec::new();
        for entry in self.tree.scan_prefix(TOOLKIT_PREFIX) {
            let (key, bytes) = entry?;
            let toolkit =
                serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                    key: String::from_utf8_lossy(&key).to_string(),
                    reason: e.to_string(),
                })?;
            toolkits.push(toolkit);
        }
        Ok(toolkits)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StorageError> {
        self.tree.remove(Self::key(id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, SledRegistryStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, SledRegistryStore::new(&db).unwrap())
    }

    #[tokio::test]
    async fn save_get_delete_roundtrip() {
        let (_dir, store) = open_store();
        let toolkit = Toolkit {
            id: Uuid::new_v4(),
            name: "kit".to_string(),
            description: String::new(),
            status: Default::default(),
            toolboxes: vec![],
            registered_at: None,
            updated_at: None,
        };

        store.save(&toolkit).await.unwrap();
        let loaded = store.get(toolkit.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "kit");
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(toolkit.id).await.unwrap();
        assert!(store.get(toolkit.id).await.unwrap().is_none());
    }
}
