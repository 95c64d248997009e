//! S3-compatible object store backed by the AWS SDK.

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::store::{ObjectStore, PutObject};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// S3 (or S3-compatible) object store
pub struct S3ObjectStore {
    client: S3Client,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3ObjectStore {
    /// Create a new S3 store
    pub async fn new(config: &StorageConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            processed_bucket = %config.processed_bucket,
            "S3 object store initialized"
        );

        Self {
            client,
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            // S3 rejects parts under 5MB except the last one
            part_size_bytes: config.part_size_bytes.max(5 * 1024 * 1024),
        }
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(&self, object: &PutObject) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .body(ByteStream::from(object.body.clone()))
            .content_type(&object.content_type)
            .cache_control(&object.cache_control)
            .set_metadata(Some(user_metadata(object)))
            .send()
            .await
            .map_err(|e| write_error(object, DisplayErrorContext(e)))?;

        Ok(())
    }

    /// Multipart upload for large objects; aborted if any part fails
    async fn multipart_upload(&self, object: &PutObject) -> Result<(), StoreError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .content_type(&object.content_type)
            .cache_control(&object.cache_control)
            .set_metadata(Some(user_metadata(object)))
            .send()
            .await
            .map_err(|e| write_error(object, DisplayErrorContext(e)))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| write_error(object, "no upload ID in response"))?
            .to_string();

        match self.upload_parts(object, &upload_id).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&object.bucket)
                    .key(&object.key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| write_error(object, DisplayErrorContext(e)))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort_error) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&object.bucket)
                    .key(&object.key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %object.key,
                        error = %DisplayErrorContext(abort_error),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        object: &PutObject,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let mut completed_parts = Vec::new();
        let total = object.body.len();

        for (index, start) in (0..total).step_by(self.part_size_bytes).enumerate() {
            let end = (start + self.part_size_bytes).min(total);
            let part_number = index as i32 + 1;

            let response = self
                .client
                .upload_part()
                .bucket(&object.bucket)
                .key(&object.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(object.body.slice(start..end)))
                .send()
                .await
                .map_err(|e| write_error(object, DisplayErrorContext(e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }
}

fn user_metadata(object: &PutObject) -> HashMap<String, String> {
    object
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn write_error(object: &PutObject, error: impl std::fmt::Display) -> StoreError {
    StoreError::Write {
        bucket: object.bucket.clone(),
        key: object.key.clone(),
        message: error.to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let read_error = |message: String| StoreError::Read {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    StoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    read_error(DisplayErrorContext(e).to_string())
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| read_error(e.to_string()))?
            .into_bytes();

        debug!(size_bytes = data.len(), "Fetched object");
        Ok(data)
    }

    #[instrument(skip(self, object), fields(bucket = %object.bucket, key = %object.key, size_bytes = object.body.len()))]
    async fn put(&self, object: PutObject) -> Result<(), StoreError> {
        if object.body.len() > self.multipart_threshold_bytes {
            self.multipart_upload(&object).await?;
        } else {
            self.simple_upload(&object).await?;
        }

        debug!("Object written");
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StoreError::Read {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        message: DisplayErrorContext(e).to_string(),
                    })
                }
            }
        }
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<Option<String>, StoreError> {
        let presign_error = |message: String| StoreError::Presign {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let presigning_config =
            PresigningConfig::expires_in(expires_in).map_err(|e| presign_error(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| presign_error(DisplayErrorContext(e).to_string()))?;

        Ok(Some(presigned.uri().to_string()))
    }
}
