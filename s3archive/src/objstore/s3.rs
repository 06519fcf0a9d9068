use super::{
    ListObjectsPage, ObjectStorage, ObjectWriter, SourceObject, UploadCompletion, UploadOptions,
    UploadedObject,
};
use crate::writers::Chunk;
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::primitives::{ByteStream, ByteStreamError};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, ObjectCannedAcl, ServerSideEncryption, StorageClass,
};
use aws_types::region::Region;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use snafu::{prelude::*, IntoError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn, Instrument};

/// Apply [`S3UploadOptions`] to either a `PutObject` or `CreateMultipartUpload` request builder,
/// which have identical setters for these fields but no common trait.
macro_rules! with_upload_options {
    ($builder:expr, $options:expr) => {{
        let options: &S3UploadOptions = $options;

        $builder
            .set_acl(options.acl.clone())
            .set_cache_control(options.cache_control.clone())
            .set_content_disposition(options.content_disposition.clone())
            .set_content_encoding(options.content_encoding.clone())
            .set_content_language(options.content_language.clone())
            .set_content_type(options.content_type.clone())
            .set_metadata(options.metadata.clone())
            .set_server_side_encryption(options.server_side_encryption.clone())
            .set_ssekms_key_id(options.sse_kms_key_id.clone())
            .set_storage_class(options.storage_class.clone())
            .set_tagging(options.tagging.clone())
    }};
}

/// S3 refuses multipart parts smaller than this, except for the last one
const MIN_MULTIPART_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// S3 refuses multipart uploads with more parts than this
const MAX_MULTIPART_PARTS: usize = 10_000;

/// Implementation of [`ObjectStorage`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub struct S3 {
    inner: Arc<S3Inner>,
}
struct S3Inner {
    config: Config,
    client: aws_sdk_s3::Client,

    /// The configured multipart chunk size, raised to the S3 minimum if needed
    chunk_size: usize,
}

impl S3 {
    /// Use an already-configured S3 client
    pub fn new(client: aws_sdk_s3::Client, config: Config) -> Self {
        let chunk_size = effective_chunk_size(&config);

        Self {
            inner: Arc::new(S3Inner {
                config,
                client,
                chunk_size,
            }),
        }
    }

    /// Construct a client from the AWS environment, overridden by whatever region and endpoint
    /// are set in `config`
    pub async fn from_config(config: Config) -> Self {
        let client = make_s3_client(&config).await;

        Self::new(client, config)
    }

    /// Upload everything that arrives on `chunks` to `key`.
    ///
    /// If the whole object fits in a single chunk it's sent with one `PutObject`, otherwise a
    /// multipart upload is started.  The ID of a started multipart upload is stored in
    /// `pending_upload_id` until the upload is completed, so the caller can clean it up if this
    /// fails or is canceled.
    #[instrument(skip(self, options, chunks, progress, pending_upload_id))]
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        options: &S3UploadOptions,
        mut chunks: mpsc::Receiver<Chunk>,
        progress: mpsc::UnboundedSender<u64>,
        pending_upload_id: &Mutex<Option<String>>,
    ) -> Result<UploadedObject> {
        let Some(first) = chunks.recv().await else {
            return self
                .put_object(bucket, key, options, Bytes::new(), &progress)
                .await;
        };
        let Some(second) = chunks.recv().await else {
            return self
                .put_object(bucket, key, options, first.data, &progress)
                .await;
        };

        let response = with_upload_options!(
            self.inner
                .client
                .create_multipart_upload()
                .bucket(bucket)
                .key(key),
            options
        )
        .send()
        .await
        .with_context(|_| crate::error::CreateMultipartUploadSnafu { bucket, key })?;

        let upload_id = response
            .upload_id()
            .expect("BUG: multi-part uploads always have upload ID")
            .to_string();
        *pending_upload_id
            .lock()
            .expect("BUG: upload ID lock poisoned") = Some(upload_id.clone());

        debug!(%upload_id, chunk_size = self.inner.chunk_size, "Archive is larger than one chunk; started multi-part upload");

        // The two chunks already received still go first
        let chunks = futures::stream::iter([first, second])
            .chain(tokio_stream::wrappers::ReceiverStream::new(chunks));

        let part_futs = chunks.map(|chunk| {
            // Chunks are numbered from 0, S3 numbers parts from 1
            let part_number = chunk.part_number + 1;
            let chunk_size = chunk.data.len();

            let span = tracing::debug_span!("upload part", part_number, chunk_size);
            let upload_id = upload_id.clone();
            let progress = progress.clone();

            async move {
                ensure!(
                    part_number <= MAX_MULTIPART_PARTS,
                    crate::error::TooManyPartsSnafu {
                        bucket,
                        key,
                        max_parts: MAX_MULTIPART_PARTS
                    }
                );

                let response = self
                    .inner
                    .client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number as i32)
                    .body(ByteStream::from(chunk.data))
                    .send()
                    .await
                    .with_context(|_| crate::error::UploadPartSnafu {
                        bucket,
                        key,
                        part_number,
                    })?;

                debug!(e_tag = ?response.e_tag(), "Uploaded part");

                let _ = progress.send(chunk_size as u64);

                Ok::<_, crate::S3ArchiveError>(
                    CompletedPart::builder()
                        .set_e_tag(response.e_tag().map(str::to_string))
                        .part_number(part_number as i32)
                        .build(),
                )
            }
            .instrument(span)
        });

        let mut uploaded_parts =
            part_futs.buffer_unordered(self.inner.config.max_concurrent_requests.max(1));

        let mut completed_parts = Vec::new();
        while let Some(result) = uploaded_parts.next().await {
            completed_parts.push(result?);
        }

        debug!(
            parts = completed_parts.len(),
            "All parts uploaded; completing multi-part upload"
        );

        // Parts finish in whatever order, but must be listed in order
        completed_parts.sort_unstable_by_key(|part| part.part_number());

        let response = self
            .inner
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu { bucket, key })?;

        pending_upload_id
            .lock()
            .expect("BUG: upload ID lock poisoned")
            .take();

        Ok(UploadedObject {
            bucket: response.bucket().unwrap_or(bucket).to_string(),
            key: response.key().unwrap_or(key).to_string(),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        options: &S3UploadOptions,
        data: Bytes,
        progress: &mpsc::UnboundedSender<u64>,
    ) -> Result<UploadedObject> {
        let total_bytes = data.len() as u64;
        debug!(total_bytes, "Archive fits in one chunk; uploading with a single request");

        with_upload_options!(
            self.inner
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data)),
            options
        )
        .send()
        .await
        .with_context(|_| crate::error::PutObjectSnafu { bucket, key })?;

        let _ = progress.send(total_bytes);

        Ok(UploadedObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) {
        warn!(%bucket, %key, %upload_id, "Aborting multi-part upload on the server side");

        if let Err(e) = self
            .inner
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            error!(?e, %bucket, %key, %upload_id,
                "Error aborting multi-part upload.  This will remain on the server forever unless there's a lifecycle policy configured");
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3 {
    #[instrument(skip(self))]
    async fn list_objects_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListObjectsPage> {
        let response = self
            .inner
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .with_context(|_| crate::error::ListObjectsInPrefixSnafu { bucket, prefix })?;

        // Keys are always present, the `Option` is an artifact of the generated bindings
        let keys = response
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .map(str::to_string)
            .collect::<Vec<_>>();

        let is_truncated = response.is_truncated().unwrap_or(false);
        debug!(keys = keys.len(), is_truncated, "Listed page of objects");

        Ok(ListObjectsPage {
            keys,
            next_continuation_token: response.next_continuation_token().map(str::to_string),
            is_truncated,
        })
    }

    #[instrument(skip(self))]
    async fn read_object(&self, bucket: &str, key: &str) -> Result<SourceObject> {
        // The AWS SDK converts from its own DateTime type to Chrono
        use aws_smithy_types_convert::date_time::DateTimeExt;

        let response = self
            .inner
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    crate::error::ObjectNotFoundSnafu { bucket, key }.build()
                } else {
                    crate::error::GetObjectSnafu { bucket, key }.into_error(e)
                }
            })?;

        let size = response.content_length().unwrap_or_default().max(0) as u64;
        let last_modified = response
            .last_modified()
            .and_then(|timestamp| timestamp.to_chrono_utc().ok());

        debug!(size, ?last_modified, "Opened object for reading");

        Ok(SourceObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            last_modified,
            body: byte_stream_body(bucket.to_string(), key.to_string(), response.body),
        })
    }

    #[instrument(skip(self, options))]
    async fn create_object_writer(
        &self,
        bucket: &str,
        key: &str,
        options: &UploadOptions,
    ) -> Result<ObjectWriter> {
        let options = S3UploadOptions::parse(options)?;
        let bucket = options.bucket.clone().unwrap_or_else(|| bucket.to_string());
        let key = options.key.clone().unwrap_or_else(|| key.to_string());

        let (writer, chunks) = crate::writers::chunked(
            self.inner.chunk_size,
            self.inner.config.max_concurrent_requests,
        );
        let (progress_sender, progress_receiver) = mpsc::unbounded_channel();
        let (completion, mut handle) = UploadCompletion::new(&bucket, &key);

        let me = self.clone();
        let span = tracing::debug_span!("upload archive", %bucket, %key);

        tokio::spawn(
            async move {
                let pending_upload_id = Mutex::new(None);

                let result = tokio::select! {
                    biased;

                    _ = &mut handle.abort => {
                        warn!("Upload aborted before it completed");
                        crate::error::AbortedSnafu.fail()
                    }
                    result = me.upload(&bucket, &key, &options, chunks, progress_sender, &pending_upload_id) => result,
                };

                if let Err(e) = &result {
                    error!(?e, "Upload failed");

                    let upload_id = pending_upload_id
                        .lock()
                        .expect("BUG: upload ID lock poisoned")
                        .take();
                    if let Some(upload_id) = upload_id {
                        me.abort_multipart_upload(&bucket, &key, &upload_id).await;
                    }
                }

                let _ = handle.result.send(result);
            }
            .instrument(span),
        );

        Ok(ObjectWriter {
            writer,
            progress: progress_receiver,
            completion,
        })
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3")
            .field("s3_endpoint", &self.inner.config.s3_endpoint)
            .field("chunk_size", &self.inner.chunk_size)
            .field("client", &"<...>")
            .finish()
    }
}

/// Adapt the body of a `GetObject` response into the stream of chunks [`SourceObject`] expects
fn byte_stream_body(bucket: String, key: String, body: ByteStream) -> BoxStream<'static, Result<Bytes>> {
    futures::stream::try_unfold(body, |mut body| async move {
        Ok::<_, ByteStreamError>(body.try_next().await?.map(|bytes| (bytes, body)))
    })
    .map_err(move |source| {
        crate::error::ReadByteStreamSnafu {
            bucket: bucket.clone(),
            key: key.clone(),
        }
        .into_error(source)
    })
    .boxed()
}

fn effective_chunk_size(config: &Config) -> usize {
    let requested = config.multipart_chunk_size.get_bytes() as usize;

    if requested < MIN_MULTIPART_CHUNK_SIZE {
        warn!(
            requested,
            minimum = MIN_MULTIPART_CHUNK_SIZE,
            "Multipart chunk size is below the S3 minimum; using the minimum instead"
        );
        MIN_MULTIPART_CHUNK_SIZE
    } else {
        requested
    }
}

/// Create a new AWS SDK S3 client, using either the region from `config` or the default
/// configuration deduced from the environment
async fn make_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let region_provider = if let Some(region) = &config.aws_region {
        RegionProviderChain::first_try(Region::new(region.clone()))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else("us-east-1")
    };
    let aws_config = aws_config::from_env().region(region_provider).load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // Most S3-compatible services don't do virtual-hosted buckets
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}

/// The upload options understood by S3, parsed from their JSON form.
///
/// Names follow the `PutObject` API.  `Bucket` and `Key` replace the destination of the upload.
#[derive(Clone, Debug, Default, PartialEq)]
struct S3UploadOptions {
    bucket: Option<String>,
    key: Option<String>,
    acl: Option<ObjectCannedAcl>,
    cache_control: Option<String>,
    content_disposition: Option<String>,
    content_encoding: Option<String>,
    content_language: Option<String>,
    content_type: Option<String>,
    metadata: Option<HashMap<String, String>>,
    server_side_encryption: Option<ServerSideEncryption>,
    sse_kms_key_id: Option<String>,
    storage_class: Option<StorageClass>,
    tagging: Option<String>,
}

impl S3UploadOptions {
    fn parse(options: &UploadOptions) -> Result<Self> {
        let mut me = Self::default();

        for (name, value) in options {
            match name.as_str() {
                "Bucket" => me.bucket = Some(string_option(name, value)?),
                "Key" => me.key = Some(string_option(name, value)?),
                "ACL" => {
                    me.acl = Some(enum_option(name, value, ObjectCannedAcl::values())?.into())
                }
                "CacheControl" => me.cache_control = Some(string_option(name, value)?),
                "ContentDisposition" => me.content_disposition = Some(string_option(name, value)?),
                "ContentEncoding" => me.content_encoding = Some(string_option(name, value)?),
                "ContentLanguage" => me.content_language = Some(string_option(name, value)?),
                "ContentType" => me.content_type = Some(string_option(name, value)?),
                "Metadata" => me.metadata = Some(string_map_option(name, value)?),
                "ServerSideEncryption" => {
                    me.server_side_encryption =
                        Some(enum_option(name, value, ServerSideEncryption::values())?.into())
                }
                "SSEKMSKeyId" => me.sse_kms_key_id = Some(string_option(name, value)?),
                "StorageClass" => {
                    me.storage_class =
                        Some(enum_option(name, value, StorageClass::values())?.into())
                }
                "Tagging" => {
                    // Either the URL-encoded form S3 expects, or an object of tag names to values
                    me.tagging = Some(match value {
                        Value::Object(_) => {
                            let tags = string_map_option(name, value)?;
                            let mut tags = tags.into_iter().collect::<Vec<_>>();
                            tags.sort();

                            url::form_urlencoded::Serializer::new(String::new())
                                .extend_pairs(tags)
                                .finish()
                        }
                        _ => string_option(name, value)?,
                    })
                }
                _ => {
                    return crate::error::UnsupportedUploadOptionSnafu { option: name }.fail();
                }
            }
        }

        Ok(me)
    }
}

fn string_option(name: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .with_context(|| crate::error::InvalidUploadOptionSnafu {
            option: name,
            reason: format!("expected a string, got {value}"),
        })
}

fn enum_option<'a>(name: &str, value: &'a Value, allowed: &[&str]) -> Result<&'a str> {
    let value = value
        .as_str()
        .with_context(|| crate::error::InvalidUploadOptionSnafu {
            option: name,
            reason: format!("expected a string, got {value}"),
        })?;

    ensure!(
        allowed.contains(&value),
        crate::error::InvalidUploadOptionSnafu {
            option: name,
            reason: format!("'{value}' is not one of {}", allowed.join(", ")),
        }
    );

    Ok(value)
}

fn string_map_option(name: &str, value: &Value) -> Result<HashMap<String, String>> {
    let object = value
        .as_object()
        .with_context(|| crate::error::InvalidUploadOptionSnafu {
            option: name,
            reason: format!("expected an object, got {value}"),
        })?;

    object
        .iter()
        .map(|(key, value)| {
            let value = value
                .as_str()
                .with_context(|| crate::error::InvalidUploadOptionSnafu {
                    option: name,
                    reason: format!("value of '{key}' must be a string, got {value}"),
                })?;

            Ok((key.clone(), value.to_string()))
        })
        .collect()
}
