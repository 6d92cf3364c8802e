//! Named blob stores: `upload` (append-only originals) and `proxy`
//! (eviction-safe cache of fetched originals and transformed artifacts).

pub mod fs;
pub mod memory;
pub mod s3;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

use crate::config::{StoreConfig, StoreType};
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + 'static>>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("store misconfigured: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("transport: {0}")]
    Transport(String),
}

/// Minimal contract both stores share. Writes for the same key may race;
/// last writer wins, which is safe because keys are content-derived.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    fn name(&self) -> &'static str;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn open_read(&self, key: &str) -> Result<ByteStream, StoreError>;
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Build a store from config. `name` distinguishes the two instances in
/// logs and default paths.
pub async fn open(cfg: &StoreConfig, name: &'static str) -> Result<Arc<dyn BlobStore>, StoreError> {
    match cfg.store_type {
        StoreType::Fs => {
            let path = cfg
                .path
                .clone()
                .unwrap_or_else(|| std::path::PathBuf::from(format!("./data/{}", name)));
            Ok(Arc::new(FsStore::new(path, name)))
        }
        StoreType::S3 => {
            let bucket = cfg
                .bucket
                .clone()
                .ok_or_else(|| StoreError::Config(format!("{} store: s3 bucket required", name)))?;
            Ok(Arc::new(
                S3Store::connect(
                    bucket,
                    cfg.region.clone(),
                    cfg.endpoint.clone(),
                    cfg.prefix.clone(),
                    name,
                )
                .await,
            ))
        }
        StoreType::Memory => Ok(Arc::new(MemoryStore::new(name))),
    }
}
