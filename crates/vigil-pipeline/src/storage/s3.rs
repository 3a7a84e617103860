use super::config::StorageConfig;
use super::{ObjectStore, PutOptions, StorageError, StoredObject};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// [`ObjectStore`] backed by an S3-compatible service
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub fn new(config: &StorageConfig) -> Self {
        debug!("Initializing object store with config: {:?}", config);

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "vigil-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, "Object store client initialized");

        Self::from_client(client, config.bucket.clone())
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Create the bucket if it does not exist yet
    pub async fn ensure_bucket(&self) -> Result<(), StorageError> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            return Ok(());
        }

        info!(bucket = %self.bucket, "Creating bucket");
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::Backend(format!(
                    "failed to create bucket {}: {}",
                    self.bucket,
                    e.into_service_error()
                ))
            })?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, bytes, options), fields(bucket = %self.bucket, size = bytes.len()))]
    async fn put(&self, key: &str, bytes: &[u8], options: PutOptions) -> Result<(), StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(bytes.len() as i64)
            .body(ByteStream::from(bytes.to_vec()));

        if let Some(content_type) = options.content_type {
            request = request.content_type(content_type);
        }
        for (name, value) in options.metadata {
            request = request.metadata(name, value);
        }

        request.send().await.map_err(|e| {
            StorageError::Backend(format!("put {key} failed: {}", e.into_service_error()))
        })?;

        debug!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<StoredObject, StorageError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_no_such_key() {
                    return Err(StorageError::NotFound(key.to_string()));
                }
                return Err(StorageError::Backend(format!(
                    "get {key} failed: {service_error}"
                )));
            },
        };

        let content_length = response.content_length().and_then(|l| u64::try_from(l).ok());
        let content_type = response.content_type().map(str::to_string);
        let metadata: BTreeMap<String, String> = response
            .metadata()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("reading body of {key} failed: {e}")))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", bytes.len(), self.bucket, key);

        Ok(StoredObject {
            bytes,
            content_length,
            content_type,
            metadata,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(format!(
                        "head {key} failed: {service_error}"
                    )))
                }
            },
        }
    }
}
