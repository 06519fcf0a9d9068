//! The streaming archive encoder.
//!
//! Both container crates only know how to write to a synchronous [`std::io::Write`], and the
//! `s-zip` writer can't even be moved between threads once it exists.  So the container writer
//! lives its whole life on a single blocking thread, which receives commands from the async side
//! over a channel.  Entry data reaches that thread as a blocking [`Read`] fed by the object's
//! async byte stream, and the container's output goes back into the async upload pipe through a
//! [`tokio_util::io::SyncIoBridge`].
//!
//! Because the writer is owned by the blocking thread, it is also dropped there, which matters
//! for `tar::Builder`: dropping an unfinished builder writes the end-of-archive blocks, and that
//! write would panic if it happened in an async context.
use crate::objstore::SourceObject;
use crate::{ArchiveFormat, Result, S3ArchiveError};
use snafu::prelude::*;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

mod tar_writer;
mod zip_writer;

/// An archive entry about to be written
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    /// Name of the entry inside the archive
    pub name: String,

    /// Key of the object the data comes from
    pub key: String,

    /// Exact number of bytes of data the entry has
    pub size: u64,

    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

/// A synchronous container writer.  Implementations live on the encoder's blocking thread.
trait ContainerWriter {
    /// Write one complete entry, reading `data` until EOF
    fn append(&mut self, entry: &Entry, data: &mut dyn Read) -> Result<()>;

    /// Write the trailing container metadata and flush everything to the output.  The output is
    /// closed when this returns.
    fn finish(self: Box<Self>) -> Result<()>;
}

enum Command {
    Append {
        entry: Entry,
        data: Box<dyn Read + Send>,
        done: oneshot::Sender<Result<()>>,
    },
    Finish,
}

/// Running total of the bytes the container writer has written to its output
#[derive(Clone, Debug, Default)]
pub(crate) struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::SeqCst);
    }
}

/// Writes entries in the order they are appended into one continuous archive stream.
///
/// Call [`Self::finish`] after the last entry, otherwise the archive is incomplete.  Dropping an
/// unfinished encoder closes the output without a valid trailer.
pub(crate) struct ArchiveEncoder {
    commands: Option<mpsc::Sender<Command>>,
    worker: Option<JoinHandle<Result<()>>>,
    bytes_written: ByteCounter,
}

impl ArchiveEncoder {
    /// Start an encoder that writes the archive into an upload pipe
    pub fn for_pipe(format: ArchiveFormat, pipe: DuplexStream, zip_compression_level: u32) -> Self {
        Self::new(
            format,
            crate::async_bridge::blocking_writer(pipe),
            zip_compression_level,
        )
    }

    /// Start an encoder that writes the archive to any blocking writer.
    ///
    /// `output` is only ever written to from a blocking thread.
    pub fn new<W>(format: ArchiveFormat, output: W, zip_compression_level: u32) -> Self
    where
        W: Write + Send + 'static,
    {
        let bytes_written = ByteCounter::default();
        let output = CountingWriter {
            inner: output,
            counter: bytes_written.clone(),
        };
        let (commands, receiver) = mpsc::channel(1);

        let worker = tokio::task::spawn_blocking(move || {
            run_container_writer(format, output, zip_compression_level, receiver)
        });

        Self {
            commands: Some(commands),
            worker: Some(worker),
            bytes_written,
        }
    }

    /// The number of archive bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.get()
    }

    /// Stream `object` into the archive as an entry called `name`, returning when all of its data
    /// have been written.
    ///
    /// Fails with [`S3ArchiveError::ObjectSizeMismatch`] if the object's stream doesn't deliver
    /// exactly the number of bytes it declared.  Errors yielded by the stream itself are returned
    /// as they are.  Entries must have a name; an empty one fails with
    /// [`S3ArchiveError::EntryNameRequired`] before anything is written.
    pub async fn append(&mut self, name: String, object: SourceObject) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .context(crate::error::EncoderClosedSnafu)?;

        ensure!(
            !name.is_empty(),
            crate::error::EntryNameRequiredSnafu { key: object.key }
        );

        let entry = Entry {
            name,
            key: object.key,
            size: object.size,
            last_modified: object.last_modified,
        };
        let data = Box::new(crate::async_bridge::blocking_reader(object.body));
        let (done, result) = oneshot::channel();

        if commands
            .send(Command::Append { entry, data, done })
            .await
            .is_err()
        {
            return Err(self.worker_failure().await);
        }

        match result.await {
            Ok(result) => result,
            Err(_) => Err(self.worker_failure().await),
        }
    }

    /// Write the end of the archive and close the output.
    ///
    /// On success returns the total size of the archive.
    pub async fn finish(&mut self) -> Result<u64> {
        let commands = self
            .commands
            .take()
            .context(crate::error::EncoderClosedSnafu)?;

        // If the worker is already gone its result says why
        let _ = commands.send(Command::Finish).await;
        drop(commands);

        self.join_worker().await?;

        let total = self.bytes_written.get();
        debug!(total, "Archive finished");

        Ok(total)
    }

    async fn join_worker(&mut self) -> Result<()> {
        let worker = self
            .worker
            .take()
            .context(crate::error::EncoderClosedSnafu)?;

        worker.await.context(crate::error::SpawnBlockingSnafu)?
    }

    /// The worker went away while a command was pending; find out what happened to it
    async fn worker_failure(&mut self) -> S3ArchiveError {
        self.commands = None;

        match self.join_worker().await {
            Err(e) => e,
            Ok(()) => crate::error::EncoderWorkerGoneSnafu.build(),
        }
    }
}

/// Body of the blocking thread that owns the container writer
fn run_container_writer<W>(
    format: ArchiveFormat,
    output: CountingWriter<W>,
    zip_compression_level: u32,
    mut commands: mpsc::Receiver<Command>,
) -> Result<()>
where
    W: Write + Send + 'static,
{
    let mut writer: Box<dyn ContainerWriter> = match format {
        ArchiveFormat::Tar => Box::new(tar_writer::TarWriter::new(output)),
        ArchiveFormat::Zip => Box::new(zip_writer::ZipWriter::new(output, zip_compression_level)?),
    };

    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Append {
                entry,
                mut data,
                done,
            } => {
                debug!(name = %entry.name, key = %entry.key, size = entry.size, "Appending entry");

                let mut data = SizedReader {
                    inner: &mut data,
                    key: &entry.key,
                    expected: entry.size,
                    actual: 0,
                };

                let result = writer
                    .append(&entry, &mut data)
                    .and_then(|()| data.check_complete());
                if let Err(e) = &result {
                    error!(?e, name = %entry.name, "Appending entry failed");
                }

                let _ = done.send(result);
            }
            Command::Finish => {
                return writer.finish();
            }
        }
    }

    // Abandoned without being finished.  Dropping the writer here keeps any final writes it
    // makes on this blocking thread.
    debug!("Archive encoder abandoned before the archive was finished");

    Ok(())
}

/// Recover a source read error that surfaced as an `io::Error` inside a container writer, or
/// wrap the `io::Error` as an encoding failure with `wrap`
fn read_error_or(
    e: std::io::Error,
    wrap: impl FnOnce(std::io::Error) -> S3ArchiveError,
) -> S3ArchiveError {
    S3ArchiveError::from_io_error(e).unwrap_or_else(wrap)
}

/// Reads an entry's data and fails if there turn out to be more or fewer bytes than declared.
///
/// The tar header is written before any data, with the declared size in it, so the wrong amount
/// of data would corrupt the archive.
struct SizedReader<'a> {
    inner: &'a mut dyn Read,
    key: &'a str,
    expected: u64,
    actual: u64,
}

impl SizedReader<'_> {
    fn mismatch(&self) -> S3ArchiveError {
        crate::error::ObjectSizeMismatchSnafu {
            key: self.key,
            expected: self.expected,
            actual: self.actual,
        }
        .build()
    }

    fn check_complete(&self) -> Result<()> {
        if self.actual == self.expected {
            Ok(())
        } else {
            Err(self.mismatch())
        }
    }
}

impl Read for SizedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.inner.read(buf)?;
        self.actual += bytes_read as u64;

        if self.actual > self.expected || (bytes_read == 0 && self.actual < self.expected) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                self.mismatch(),
            ));
        }

        Ok(bytes_read)
    }
}

/// Counts the bytes written to the underlying writer.
///
/// The zip writer insists on `Seek` just to learn its current offset, so this also implements
/// the seeks that don't move: to the current position, or to the position it's already at.
struct CountingWriter<W> {
    inner: W,
    counter: ByteCounter,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.inner.write(buf)?;
        self.counter.add(bytes_written as u64);

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<W> Seek for CountingWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let position = self.counter.get();

        match pos {
            SeekFrom::Current(0) => Ok(position),
            SeekFrom::Start(offset) if offset == position => Ok(position),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "archive output is a stream and can't seek",
            )),
        }
    }
}
