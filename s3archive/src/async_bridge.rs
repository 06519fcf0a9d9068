//! Blocking `Read` and `Write` adapters over the async object streams.
//!
//! Object bodies arrive as async streams and the archive leaves through an async pipe, while both
//! container crates (`tar` and `s-zip`) only speak synchronous `Read` and `Write`.  The encoder
//! runs those crates on a blocking thread, and these adapters reach back into the runtime from
//! there.
//!
//! Using either adapter from async code panics, because both block on the runtime.

use crate::Result;
use bytes::{Buf, Bytes};
use futures::{stream::BoxStream, StreamExt};
use std::io::Read;
use tokio::io::AsyncWrite;

/// Expose the body of an object as a blocking [`Read`].
///
/// Must be called within the runtime; the returned reader must only be used on a blocking thread.
pub(crate) fn blocking_reader(body: BoxStream<'static, Result<Bytes>>) -> BodyReader {
    BodyReader {
        body,
        chunk: Bytes::new(),
        handle: tokio::runtime::Handle::current(),
    }
}

/// Wrap the archive pipe in a blocking [`std::io::Write`].  Same restrictions as
/// [`blocking_reader`].
pub(crate) fn blocking_writer<W>(pipe: W) -> tokio_util::io::SyncIoBridge<W>
where
    W: AsyncWrite + Unpin + 'static,
{
    tokio_util::io::SyncIoBridge::new(pipe)
}

pub(crate) struct BodyReader {
    body: BoxStream<'static, Result<Bytes>>,

    /// Whatever is left of the last chunk the stream yielded
    chunk: Bytes,

    handle: tokio::runtime::Handle,
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Streams may yield empty chunks, which mustn't be mistaken for EOF
        while self.chunk.is_empty() {
            match self.handle.block_on(self.body.next()) {
                None => return Ok(0),
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(e)) => {
                    // `S3ArchiveError::from_io_error` recovers the original on the other side
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                }
            }
        }

        // One chunk per read at most; `Read` allows short reads
        let len = buf.len().min(self.chunk.len());
        self.chunk.copy_to_slice(&mut buf[..len]);

        Ok(len)
    }
}
