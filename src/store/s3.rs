use super::{BlobStore, ByteStream, StoreError};
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use tokio_util::io::ReaderStream;

/// S3-compatible object store backend. An `endpoint` override switches to
/// path-style addressing for MinIO and friends; credentials come from the
/// standard AWS provider chain.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: Option<String>,
    name: &'static str,
}

impl S3Store {
    pub async fn connect(
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        prefix: Option<String>,
        name: &'static str,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket,
            prefix,
            name,
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for S3Store {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(StoreError::Transport(service.to_string()))
                }
            }
        }
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Transport(service.to_string())
                }
            })?;
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn open_read(&self, key: &str) -> Result<ByteStream, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Transport(service.to_string())
                }
            })?;
        let body: S3Body = resp.body;
        Ok(Box::pin(ReaderStream::new(body.into_async_read())))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(S3Body::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.into_service_error().to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.into_service_error().to_string()))?;
        Ok(())
    }
}
