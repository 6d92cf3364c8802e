use super::{BlobStore, ByteStream, StoreError};
use std::path::PathBuf;
use tokio::fs;
use tokio_util::io::ReaderStream;

/// Filesystem-backed store. Keys are base58ish and filesystem-safe; a
/// two-level shard keeps directory fanout bounded.
pub struct FsStore {
    root: PathBuf,
    name: &'static str,
}

impl FsStore {
    pub fn new(root: PathBuf, name: &'static str) -> Self {
        Self { root, name }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        if key.len() >= 5 {
            self.root.join(&key[1..3]).join(&key[3..5]).join(key)
        } else {
            self.root.join(key)
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for FsStore {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_read(&self, key: &str) -> Result<ByteStream, StoreError> {
        match fs::File::open(self.path_for(key)).await {
            Ok(file) => Ok(Box::pin(ReaderStream::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            // removing an absent key is a no-op
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().to_path_buf(), "upload");
        let key = "DQmTestKeyAbcdef";

        assert!(!store.exists(key).await.unwrap());
        store.write(key, b"hello").await.unwrap();
        assert!(store.exists(key).await.unwrap());
        assert_eq!(store.read(key).await.unwrap(), b"hello");

        let mut stream = store.open_read(key).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello");

        store.remove(key).await.unwrap();
        assert!(!store.exists(key).await.unwrap());
        store.remove(key).await.unwrap();
        assert!(matches!(
            store.read(key).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().to_path_buf(), "proxy");
        store.write("Uabcd", b"one").await.unwrap();
        store.write("Uabcd", b"two").await.unwrap();
        assert_eq!(store.read("Uabcd").await.unwrap(), b"two");
    }
}
