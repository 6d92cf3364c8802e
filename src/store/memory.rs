use super::{BlobStore, ByteStream, StoreError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-process store for tests and throwaway deployments.
pub struct MemoryStore {
    name: &'static str,
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryStore {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.read().expect("store lock").contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.entries
            .read()
            .expect("store lock")
            .get(key)
            .map(|b| b.to_vec())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn open_read(&self, key: &str) -> Result<ByteStream, StoreError> {
        let bytes = self
            .entries
            .read()
            .expect("store lock")
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(Box::pin(futures::stream::iter([Ok(bytes)])))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.entries
            .write()
            .expect("store lock")
            .insert(key.to_string(), Bytes::copy_from_slice(bytes));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().expect("store lock").remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn behaves_like_a_store() {
        let store = MemoryStore::new("upload");
        store.write("Dk", b"bytes").await.unwrap();
        assert!(store.exists("Dk").await.unwrap());
        assert_eq!(store.read("Dk").await.unwrap(), b"bytes");
        store.remove("Dk").await.unwrap();
        assert!(matches!(
            store.read("Dk").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
