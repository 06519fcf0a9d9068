//! An [`ObjectStorage`] implementation that keeps objects in process memory.
//!
//! Listing, reading and uploading all behave like a real object store would from the pipeline's
//! point of view: listings are paged with opaque continuation tokens, reads are streamed in
//! chunks, and uploads are consumed from a pipe by a background task.  Faults can be injected to
//! exercise the failure paths.
use super::{
    ListObjectsPage, ObjectStorage, ObjectWriter, SourceObject, UploadCompletion, UploadOptions,
    UploadedObject,
};
use crate::Result;
use bytes::Bytes;
use futures::StreamExt;
use snafu::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Default number of keys per listing page, same as S3
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default size of the pieces object data is streamed in
const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Capacity of the pipe between the archive writer and the upload task
const UPLOAD_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryStorageInner>,
}

#[derive(Default)]
struct MemoryStorageInner {
    buckets: Mutex<BTreeMap<String, BTreeMap<String, Bytes>>>,
    faults: Mutex<Faults>,
    page_size: AtomicUsize,
    read_chunk_size: AtomicUsize,
    list_requests: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    fail_listings: bool,
    interrupted_reads: HashSet<String>,
    reject_uploads: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        let me = Self::default();
        me.set_page_size(DEFAULT_PAGE_SIZE);
        me.set_read_chunk_size(DEFAULT_READ_CHUNK_SIZE);

        me
    }

    /// Limit listings to `page_size` keys per page
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.set_page_size(page_size);
        self
    }

    /// Stream object data in pieces of `chunk_size` bytes
    pub fn with_read_chunk_size(self, chunk_size: usize) -> Self {
        self.set_read_chunk_size(chunk_size);
        self
    }

    fn set_page_size(&self, page_size: usize) {
        self.inner.page_size.store(page_size.max(1), Ordering::SeqCst);
    }

    fn set_read_chunk_size(&self, chunk_size: usize) {
        self.inner
            .read_chunk_size
            .store(chunk_size.max(1), Ordering::SeqCst);
    }

    /// Create an empty bucket, if it doesn't exist already
    pub fn create_bucket(&self, bucket: impl Into<String>) {
        self.buckets().entry(bucket.into()).or_default();
    }

    /// Store an object, creating the bucket if needed
    pub fn put_object(&self, bucket: impl Into<String>, key: impl Into<String>, data: impl Into<Bytes>) {
        self.buckets()
            .entry(bucket.into())
            .or_default()
            .insert(key.into(), data.into());
    }

    pub fn get_object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    pub fn delete_object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets()
            .get_mut(bucket)
            .and_then(|objects| objects.remove(key))
    }

    /// All keys in a bucket, in listing order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The number of listing requests served so far
    pub fn list_requests(&self) -> usize {
        self.inner.list_requests.load(Ordering::SeqCst)
    }

    /// Make every listing request fail
    pub fn fail_listings(&self, fail: bool) {
        self.faults().fail_listings = fail;
    }

    /// Make reads of `key` fail after the first chunk of data has been delivered
    pub fn interrupt_reads_of(&self, key: impl Into<String>) {
        self.faults().interrupted_reads.insert(key.into());
    }

    /// Make every upload fail without storing anything
    pub fn reject_uploads(&self, reject: bool) {
        self.faults().reject_uploads = reject;
    }

    fn buckets(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, Bytes>>> {
        self.inner
            .buckets
            .lock()
            .expect("BUG: memory storage lock poisoned")
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.inner
            .faults
            .lock()
            .expect("BUG: memory storage lock poisoned")
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("buckets", &self.buckets().len())
            .field("page_size", &self.inner.page_size.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait::async_trait]
impl ObjectStorage for MemoryStorage {
    #[instrument(skip(self))]
    async fn list_objects_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListObjectsPage> {
        self.inner.list_requests.fetch_add(1, Ordering::SeqCst);

        if self.faults().fail_listings {
            return crate::error::ListingFailedSnafu {
                bucket,
                prefix,
                reason: "listing failure injected",
            }
            .fail();
        }

        let page_size = self.inner.page_size.load(Ordering::SeqCst);
        let buckets = self.buckets();
        let objects = buckets.get(bucket).with_context(|| crate::error::ListingFailedSnafu {
            bucket,
            prefix,
            reason: "no such bucket",
        })?;

        // The continuation token is simply the last key of the previous page
        let mut matching = objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| {
                continuation_token
                    .as_deref()
                    .map_or(true, |token| key.as_str() > token)
            });

        let keys = matching
            .by_ref()
            .take(page_size)
            .cloned()
            .collect::<Vec<_>>();
        let is_truncated = matching.next().is_some();
        let next_continuation_token = if is_truncated { keys.last().cloned() } else { None };

        debug!(keys = keys.len(), is_truncated, "Listed page of objects");

        Ok(ListObjectsPage {
            keys,
            next_continuation_token,
            is_truncated,
        })
    }

    #[instrument(skip(self))]
    async fn read_object(&self, bucket: &str, key: &str) -> Result<SourceObject> {
        let data = self
            .get_object(bucket, key)
            .with_context(|| crate::error::ObjectNotFoundSnafu { bucket, key })?;
        let chunk_size = self.inner.read_chunk_size.load(Ordering::SeqCst);
        let interrupted = self.faults().interrupted_reads.contains(key);

        let size = data.len() as u64;
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            chunks.push(Ok(data.slice(offset..end)));
            offset = end;
        }

        if interrupted {
            let delivered = chunks.len().min(1);
            chunks.truncate(delivered);
            chunks.push(
                crate::error::ReadInterruptedSnafu {
                    bucket,
                    key,
                    offset: (chunk_size.min(data.len()) * delivered) as u64,
                }
                .fail(),
            );
        }

        Ok(SourceObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            last_modified: None,
            body: futures::stream::iter(chunks).boxed(),
        })
    }

    #[instrument(skip(self, options))]
    async fn create_object_writer(
        &self,
        bucket: &str,
        key: &str,
        options: &UploadOptions,
    ) -> Result<ObjectWriter> {
        let (bucket, key) = destination_overrides(bucket, key, options)?;
        let rejected = self.faults().reject_uploads;

        let (writer, mut reader) = tokio::io::duplex(UPLOAD_PIPE_CAPACITY);
        let (progress_sender, progress_receiver) = mpsc::unbounded_channel();
        let (completion, mut handle) = UploadCompletion::new(&bucket, &key);

        let me = self.clone();
        tokio::spawn(async move {
            let upload = async {
                if rejected {
                    // Dropping the reader breaks the pipe, just like a real upload failure would
                    drop(reader);
                    return crate::error::UploadRejectedSnafu {
                        bucket: bucket.clone(),
                        key: key.clone(),
                        reason: "upload rejection injected",
                    }
                    .fail();
                }

                let mut data = Vec::new();
                reader
                    .read_to_end(&mut data)
                    .await
                    .expect("BUG: Reads from DuplexStream are infallible");
                let _ = progress_sender.send(data.len() as u64);

                me.put_object(bucket.clone(), key.clone(), data);
                debug!(%bucket, %key, "Stored uploaded object");

                Ok(UploadedObject {
                    bucket: bucket.clone(),
                    key: key.clone(),
                })
            };

            let result = tokio::select! {
                biased;

                _ = &mut handle.abort => {
                    warn!(%bucket, %key, "Upload aborted; nothing was stored");
                    crate::error::AbortedSnafu.fail()
                }
                result = upload => result,
            };

            let _ = handle.result.send(result);
        });

        Ok(ObjectWriter {
            writer,
            progress: progress_receiver,
            completion,
        })
    }
}

/// Apply the `Bucket` and `Key` upload options, which replace the destination of the upload.
///
/// Other options have no meaning for in-memory storage and are ignored.
fn destination_overrides(
    bucket: &str,
    key: &str,
    options: &UploadOptions,
) -> Result<(String, String)> {
    let string_option = |name: &str, default: &str| -> Result<String> {
        match options.get(name) {
            None => Ok(default.to_string()),
            Some(serde_json::Value::String(value)) => Ok(value.clone()),
            Some(_) => crate::error::InvalidUploadOptionSnafu {
                option: name,
                reason: "expected a string",
            }
            .fail(),
        }
    };

    Ok((string_option("Bucket", bucket)?, string_option("Key", key)?))
}
