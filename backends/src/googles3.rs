use crate::retry::{retry, RetryConfig};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bolong_core::config::GoogleS3Config;
use bolong_core::{BlobReader, BlobWrite, Error, Remote, Result};
use bytes::BytesMut;

const ENDPOINT: &str = "https://storage.googleapis.com";

/// Remote store on an S3-compatible endpoint (Google Cloud Storage in
/// interoperability mode).
///
/// `rename` is CopyObject followed by DeleteObject and is NOT atomic: a
/// crash in between leaves both names behind. That is safe for readers — an
/// index under its final name is always complete — but a later backup may
/// find a stale `.tmp` object. Reads and writes retry transient failures
/// with exponential backoff.
pub struct GoogleS3Remote {
    client: Client,
    bucket: String,
    /// Key prefix without the leading slash, ending in a slash.
    prefix: String,
    retry: RetryConfig,
}

impl GoogleS3Remote {
    pub fn new(config: &GoogleS3Config) -> GoogleS3Remote {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret.clone(),
            None,
            None,
            "bolong",
        );
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("auto"))
            .endpoint_url(ENDPOINT)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        GoogleS3Remote {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: config.path.trim_start_matches('/').to_string(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> GoogleS3Remote {
        self.retry = retry;
        self
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }
}

/// Buffers the blob and uploads it in one PUT on `finish`; the SDK needs a
/// body of known size. Blobs arrive here already compressed and encrypted.
struct S3Writer {
    client: Client,
    bucket: String,
    key: String,
    retry: RetryConfig,
    buf: BytesMut,
}

#[async_trait]
impl BlobWrite for S3Writer {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let body = self.buf.split().freeze();
        let (client, bucket, key) = (self.client.clone(), self.bucket.clone(), self.key.clone());
        retry(&self.retry, "put", || {
            let (client, bucket, key, body) =
                (client.clone(), bucket.clone(), key.clone(), body.clone());
            async move {
                client
                    .put_object()
                    .bucket(&bucket)
                    .key(&key)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(|e| Error::Remote(format!("creating {}: {}", key, e)))?;
                Ok(())
            }
        })
        .await
    }
}

#[async_trait]
impl Remote for GoogleS3Remote {
    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix);
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Remote(format!("listing: {}", e)))?;

            if let Some(contents) = response.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        if let Some(name) = key.strip_prefix(&self.prefix) {
                            names.push(name.to_string());
                        }
                    }
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(names)
    }

    async fn open(&self, path: &str) -> Result<BlobReader> {
        let (client, bucket) = (self.client.clone(), self.bucket.clone());
        let (key, path) = (self.key(path), path.to_string());
        let response = retry(&self.retry, "get", move || {
            let (client, bucket, key, path) =
                (client.clone(), bucket.clone(), key.clone(), path.clone());
            async move {
                client
                    .get_object()
                    .bucket(&bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| Error::Remote(format!("opening {}: {}", path, e)))
            }
        })
        .await?;
        Ok(Box::new(response.body.into_async_read()))
    }

    async fn create(&self, path: &str) -> Result<Box<dyn BlobWrite>> {
        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.key(path),
            retry: self.retry.clone(),
            buf: BytesMut::new(),
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = format!("{}/{}", self.bucket, self.key(from));
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&source)
            .key(self.key(to))
            .send()
            .await
            .map_err(|e| Error::Remote(format!("copying {} to {}: {}", from, to, e)))?;
        self.delete(from).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| Error::Remote(format!("deleting {}: {}", path, e)))?;
        Ok(())
    }
}
