use crate::Result;
use bytes::Bytes;
use dyn_clone::DynClone;
use futures::stream::BoxStream;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

pub mod memory;
mod s3;

pub use memory::MemoryStorage;
pub use s3::S3;

/// Options for the write of the finished archive, passed through to the [`ObjectStorage`]
/// implementation untouched.
///
/// The keys understood are implementation-specific; for S3 they are named after the `PutObject`
/// request fields, for example `{"StorageClass": "STANDARD_IA", "Metadata": {"job": "42"}}`.
pub type UploadOptions = serde_json::Map<String, serde_json::Value>;

/// An object storage system like S3.
///
/// Not all object storage systems expose an S3-compatible API, and the archive pipeline is tested
/// without any network at all, so the three storage operations the pipeline needs are abstracted
/// behind this trait.
///
/// Implementations are expected to be cheaply cloneable (the cost of a clone is the cost of
/// increasing the ref count on an `Arc`) and safe to share between concurrent archive operations.
#[async_trait::async_trait]
pub trait ObjectStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// List one page of the object keys in `bucket` that start with `prefix`.
    ///
    /// Pass the `next_continuation_token` of the previous page to get the page after it, or
    /// `None` to get the first page.
    async fn list_objects_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListObjectsPage>;

    /// Open a stream that reads the entire contents of an object.
    ///
    /// The data are yielded incrementally as they arrive; the size is known up front from the
    /// response metadata.
    async fn read_object(&self, bucket: &str, key: &str) -> Result<SourceObject>;

    /// Start an upload of a new object identified by `key`, and return the [`ObjectWriter`] to
    /// which the object's data should be written.
    ///
    /// The upload task is already running when this returns, so no bytes written to the writer
    /// are lost.  The size of the object doesn't need to be known in advance.
    ///
    /// `options` are implementation-specific settings for the upload.  Invalid options fail here,
    /// before any data is written.
    async fn create_object_writer(
        &self,
        bucket: &str,
        key: &str,
        options: &UploadOptions,
    ) -> Result<ObjectWriter>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// One page of results from [`ObjectStorage::list_objects_page`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectsPage {
    /// Keys of the objects in this page, in the order the object store listed them
    pub keys: Vec<String>,

    /// Opaque cursor to pass to the next `list_objects_page` call
    pub next_continuation_token: Option<String>,

    /// If `true`, there are more pages after this one
    pub is_truncated: bool,
}

/// An object opened for reading with [`ObjectStorage::read_object`]
pub struct SourceObject {
    pub bucket: String,
    pub key: String,

    /// Size in bytes of the object data
    pub size: u64,

    /// When the object was last modified, if the object store reported it
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,

    /// The object's data.  An `Err` item means the read failed and no more data will follow.
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for SourceObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceObject")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("size", &self.size)
            .field("last_modified", &self.last_modified)
            .field("body", &"<...>")
            .finish()
    }
}

/// The identity of an object after an upload was committed, as reported by the object store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedObject {
    pub bucket: String,
    pub key: String,
}

/// Handle to an upload in progress, returned by [`ObjectStorage::create_object_writer`].
///
/// - `writer` is where the data to upload should be written.  Shutting it down (or dropping it)
///   marks the end of the object.  If the upload fails, writes to `writer` fail with a
///   `BrokenPipe` error, in which case callers should consult `completion` for the actual error.
/// - `progress` receives the number of bytes uploaded each time a piece of the object is stored.
///   Callers who don't care about progress reporting can drop it.
/// - `completion` reports the outcome of the upload, exactly once.
#[derive(Debug)]
pub struct ObjectWriter {
    pub writer: DuplexStream,
    pub progress: mpsc::UnboundedReceiver<u64>,
    pub completion: UploadCompletion,
}

/// Single-shot completion signal of an upload, which can also be used to abort it
#[derive(Debug)]
pub struct UploadCompletion {
    result: oneshot::Receiver<Result<UploadedObject>>,
    abort: oneshot::Sender<()>,
    bucket: String,
    key: String,
}

/// The upload task's end of an [`UploadCompletion`]
pub(crate) struct UploadTaskHandle {
    /// Send the result of the upload here
    pub result: oneshot::Sender<Result<UploadedObject>>,

    /// Completes when the upload should be abandoned.  That happens when `abort` is called or
    /// when the `UploadCompletion` is dropped without waiting for the upload to finish.
    pub abort: oneshot::Receiver<()>,
}

impl UploadCompletion {
    pub(crate) fn new(bucket: &str, key: &str) -> (Self, UploadTaskHandle) {
        let (result_sender, result_receiver) = oneshot::channel();
        let (abort_sender, abort_receiver) = oneshot::channel();

        (
            Self {
                result: result_receiver,
                abort: abort_sender,
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            UploadTaskHandle {
                result: result_sender,
                abort: abort_receiver,
            },
        )
    }

    /// Wait for the upload to finish, which happens only after the writer has been shut down and
    /// everything written to it has been committed, or when the upload fails.
    pub async fn wait(self) -> Result<UploadedObject> {
        let Self {
            result,
            abort,
            bucket,
            key,
        } = self;

        let result = result
            .await
            .map_err(|_| crate::error::UploadAbandonedSnafu { bucket, key }.build());

        // Holding on to the abort sender until here keeps the upload task from seeing a spurious
        // abort while we wait
        drop(abort);

        result?
    }

    /// Tell the upload task to give up, and wait until it has.  Nothing written so far will be
    /// committed.
    ///
    /// Closing the writer marks the end of the object, so callers abandoning an upload must call
    /// this before they drop the writer, or the upload task might mistake the incomplete data for
    /// a finished object.
    pub async fn abort(self) {
        // If the task is already gone there's nothing to abort
        let _ = self.abort.send(());
        let _ = self.result.await;
    }
}
