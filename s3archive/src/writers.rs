//! A helper that constructs a [`tokio::io::AsyncWrite`] impl which collects the written bytes into
//! fixed-size [`Chunk`]s and yields them on a channel for some upload worker to consume.
//!
//! The writer side is the pipe the archive encoder writes to; the receiver side is drained by the
//! object storage upload task.  Both halves are bounded, so a slow upload applies back-pressure
//! all the way to the encoder, and a slow encoder simply leaves the uploader waiting.
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, DuplexStream},
    sync::mpsc,
};
use tracing::{debug, warn};

pub(crate) struct Chunk {
    /// The number of the chunk starting from 0.
    pub part_number: usize,

    /// The contents of this chunk
    pub data: Bytes,
}

/// Construct a [`DuplexStream`] whose written data is cut into chunks of `chunk_size` bytes (the
/// last one possibly shorter) and sent to the returned channel, which holds at most
/// `chunks_channel_depth` chunks that haven't been picked up yet.
///
/// Dropping or shutting down the writer signals the end of the data; the channel closes after
/// the final chunk.  If the receiver is dropped, the background task exits and further writes
/// fail with `BrokenPipe`.
pub(crate) fn chunked(
    chunk_size: usize,
    chunks_channel_depth: usize,
) -> (DuplexStream, mpsc::Receiver<Chunk>) {
    let (bytes_sender, mut bytes_receiver) = tokio::io::duplex(chunk_size);
    let (chunks_sender, chunks_receiver) = mpsc::channel(chunks_channel_depth.max(1));

    tokio::spawn(async move {
        let mut part_number = 0usize;

        loop {
            let mut buffer = bytes::BytesMut::with_capacity(chunk_size);

            // Reads from a duplex are infallible; a dropped writer just means EOF.
            while buffer.len() < chunk_size {
                let bytes_read = bytes_receiver
                    .read_buf(&mut buffer)
                    .await
                    .expect("BUG: Reads from DuplexStream are infallible");

                if bytes_read == 0 {
                    break;
                }
            }

            if buffer.is_empty() {
                debug!(chunks = part_number, "encountered end of duplex stream; chunking task exiting");
                break;
            }

            let chunk = Chunk {
                part_number,
                data: buffer.freeze(),
            };
            let last = chunk.data.len() < chunk_size;
            part_number += 1;

            if chunks_sender.send(chunk).await.is_err() {
                warn!("chunks receiver was dropped; aborting the chunking task");
                break;
            }

            if last {
                // A short chunk only happens at EOF
                debug!(chunks = part_number, "final short chunk sent; chunking task exiting");
                break;
            }
        }
    });

    (bytes_sender, chunks_receiver)
}
