use crate::encoder::ArchiveEncoder;
use crate::objstore::{ObjectStorage, ObjectWriter};
use crate::request::entry_name;
use crate::{ArchiveRequest, ArchiveResult, Config, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// A trait which callers can implement to get detailed progress updates as the archive is built
/// and uploaded.
///
/// Every method has a default that does nothing, so implementations only override the updates
/// they care about.
#[allow(unused_variables)]
pub trait ArchiveProgressCallback: Sync + Send {
    /// The list of objects to archive is known
    fn source_files_resolved(&self, count: usize) {}

    /// The object `key` was opened and is about to be written into the archive as `name`
    fn entry_started(&self, key: &str, name: &str, size: u64) {}

    /// All of the object `key` was written to the archive.
    ///
    /// That doesn't mean the data has been uploaded yet, only that the archive encoder has
    /// produced `archive_bytes_written` bytes in total so far.
    fn entry_appended(&self, key: &str, name: &str, size: u64, archive_bytes_written: u64) {}

    /// The end of the archive was written; `total_bytes_written` is the final archive size
    fn archive_finalized(&self, total_bytes_written: u64) {}

    /// Another piece of the archive was committed to object storage
    fn archive_bytes_uploaded(&self, bytes: u64) {}

    /// The archive upload completed successfully
    fn archive_uploaded(&self, bucket: &str, key: &str, size: u64) {}
}

/// The stages of one archive operation, logged as they happen
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Resolving,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

/// Builds archives of object storage objects and uploads them back to object storage.
///
/// One `Archiver` can run any number of archive operations, including concurrently; they share
/// nothing but the storage handle.
#[derive(Clone, Debug)]
pub struct Archiver {
    storage: Box<dyn ObjectStorage>,
    config: Config,
}

impl Archiver {
    pub fn new(storage: impl ObjectStorage, config: Config) -> Self {
        Self {
            storage: Box::new(storage),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Alternative to [`Self::archive_with_progress`] for callers that don't need progress
    /// updates and will never abort.
    pub async fn archive(&self, request: ArchiveRequest) -> Result<ArchiveResult> {
        struct NoProgress;
        impl ArchiveProgressCallback for NoProgress {}

        self.archive_with_progress(request, futures::future::pending(), NoProgress)
            .await
    }

    /// Build the archive described by `request` and upload it, returning only once the upload
    /// has been committed (or something failed).
    ///
    /// If the `abort` future completes, the operation is abandoned: the upload is aborted so no
    /// partial archive is ever committed, and this returns an [`crate::S3ArchiveError::Aborted`]
    /// error.  Dropping the returned future has the same effect on the upload.
    #[instrument(skip(self, request, abort, progress), fields(bucket = %request.source_bucket(), path = %request.source_path()))]
    pub async fn archive_with_progress<Abort, Progress>(
        &self,
        request: ArchiveRequest,
        abort: Abort,
        progress: Progress,
    ) -> Result<ArchiveResult>
    where
        Abort: Future<Output = ()>,
        Progress: ArchiveProgressCallback + 'static,
    {
        let progress: Arc<dyn ArchiveProgressCallback> = Arc::new(progress);
        tokio::pin!(abort);

        let mut state = State::Resolving;
        debug!(?state, "Resolving the objects to archive");

        let keys = tokio::select! {
            biased;

            _ = &mut abort => return Self::aborted(state),
            keys = self.resolve_source_keys(&request) => keys,
        };
        let keys = match keys {
            Ok(keys) => keys,
            Err(e) => return Self::failed(state, e),
        };

        info!(files = keys.len(), "Resolved the objects to archive");
        progress.source_files_resolved(keys.len());

        // The upload starts before a single byte of the archive exists, and takes whatever the
        // encoder writes as it's written
        let destination_key = request.destination_key();
        let ObjectWriter {
            writer,
            progress: uploaded_bytes,
            completion,
        } = match self
            .storage
            .create_object_writer(
                request.source_bucket(),
                &destination_key,
                request.upload_options(),
            )
            .await
        {
            Ok(writer) => writer,
            Err(e) => return Self::failed(state, e),
        };

        let forwarder = tokio::spawn(forward_upload_progress(uploaded_bytes, progress.clone()));

        let mut encoder = ArchiveEncoder::for_pipe(
            request.output_format(),
            writer,
            self.config.zip_compression_level,
        );

        state = State::Streaming;
        debug!(?state, format = %request.output_format(), %destination_key, "Streaming objects into the archive");

        let produced = tokio::select! {
            biased;

            _ = &mut abort => None,
            result = self.write_archive(&mut encoder, request.source_bucket(), &keys, &*progress) => Some(result),
        };

        match produced {
            None => {
                warn!("Abort requested; abandoning the upload");
                completion.abort().await;

                return Self::aborted(state);
            }
            Some(Err(e)) if e.is_broken_pipe() => {
                // The uploader hung up on the encoder; the reason why is the error that matters
                debug!(?e, "Archive upload pipe closed while writing the archive");

                let e = match completion.wait().await {
                    Err(upload_error) => upload_error,
                    Ok(_) => e,
                };

                return Self::failed(state, e);
            }
            Some(Err(e)) => {
                // Never let the uploader commit an incomplete archive
                completion.abort().await;

                return Self::failed(state, e);
            }
            Some(Ok(())) => {}
        }

        state = State::Finalizing;
        debug!(?state, bytes_written = encoder.bytes_written(), "Waiting for the archive upload to complete");

        let uploaded = tokio::select! {
            biased;

            // Dropping the completion tells the uploader to abort
            _ = &mut abort => return Self::aborted(state),
            uploaded = completion.wait() => uploaded,
        };
        let uploaded = match uploaded {
            Ok(uploaded) => uploaded,
            Err(e) => return Self::failed(state, e),
        };

        // Every progress update is in by the time the upload task has finished
        let _ = forwarder.await;

        let file_size = encoder.bytes_written();
        progress.archive_uploaded(&uploaded.bucket, &uploaded.key, file_size);

        state = State::Done;
        info!(?state, bucket = %uploaded.bucket, key = %uploaded.key, file_size, "Archive uploaded");

        Ok(ArchiveResult {
            s3_bucket: uploaded.bucket,
            file_key: uploaded.key,
            file_size,
        })
    }

    /// The full keys of the objects to archive, in archive order.
    ///
    /// Explicitly listed files are taken as given, in the order given, without checking that they
    /// exist.  Otherwise everything under the source path is listed, except the placeholder object
    /// some tools create to represent the folder itself.
    async fn resolve_source_keys(&self, request: &ArchiveRequest) -> Result<Vec<String>> {
        if !request.source_files().is_empty() {
            return Ok(request
                .source_files()
                .iter()
                .map(|file| request.source_key(file))
                .collect());
        }

        let marker = request.directory_marker();
        let keys = crate::list::list_all_objects(
            &*self.storage,
            request.source_bucket(),
            request.source_path(),
        )
        .await?;

        Ok(keys.into_iter().filter(|key| *key != marker).collect())
    }

    /// Stream every object into the encoder, one after another, then finish the archive
    async fn write_archive(
        &self,
        encoder: &mut ArchiveEncoder,
        bucket: &str,
        keys: &[String],
        progress: &dyn ArchiveProgressCallback,
    ) -> Result<()> {
        for key in keys {
            let object = self.storage.read_object(bucket, key).await?;
            let name = entry_name(key).to_string();
            let size = object.size;

            debug!(%key, %name, size, "Writing object into the archive");
            progress.entry_started(key, &name, size);

            encoder.append(name.clone(), object).await?;

            progress.entry_appended(key, &name, size, encoder.bytes_written());
        }

        let total = encoder.finish().await?;
        progress.archive_finalized(total);

        Ok(())
    }

    fn aborted<T>(state: State) -> Result<T> {
        warn!(?state, "Archive operation aborted");

        Self::failed(state, crate::error::AbortedSnafu.build())
    }

    fn failed<T>(state: State, e: crate::S3ArchiveError) -> Result<T> {
        warn!(failed_in = ?state, state = ?State::Failed, kind = %e.kind(), error = %e, "Archive operation failed");

        Err(e)
    }
}

/// Pass the upload task's byte counts on to the progress callback, until the upload task is done
async fn forward_upload_progress(
    mut uploaded_bytes: mpsc::UnboundedReceiver<u64>,
    progress: Arc<dyn ArchiveProgressCallback>,
) {
    while let Some(bytes) = uploaded_bytes.recv().await {
        progress.archive_bytes_uploaded(bytes);
    }
}
