use super::{read_error_or, ContainerWriter, Entry};
use crate::Result;
use s_zip::{SZipError, StreamingZipWriter};
use snafu::{IntoError, ResultExt};
use std::io::{Read, Seek, Write};

/// How much entry data is handed to the compressor at a time
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// DEFLATE doesn't go past 9
const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Zip archives written front to back.  Sizes and CRCs follow each entry's data in a data
/// descriptor, so nothing already written is ever revisited.
pub(super) struct ZipWriter<W: Write + Seek> {
    writer: StreamingZipWriter<W>,
    buffer: Vec<u8>,
}

impl<W: Write + Seek> ZipWriter<W> {
    pub fn new(output: W, compression_level: u32) -> Result<Self> {
        let writer = StreamingZipWriter::from_writer_with_compression(
            output,
            compression_level.min(MAX_COMPRESSION_LEVEL),
        )
        .context(crate::error::ZipCreateSnafu)?;

        Ok(Self {
            writer,
            buffer: vec![0u8; COPY_BUFFER_SIZE],
        })
    }
}

impl<W: Write + Seek> ContainerWriter for ZipWriter<W> {
    fn append(&mut self, entry: &Entry, data: &mut dyn Read) -> Result<()> {
        let append_error = |e: SZipError| {
            crate::error::ZipAppendDataSnafu {
                name: entry.name.clone(),
            }
            .into_error(e)
        };

        self.writer
            .start_entry_with_hint(&entry.name, Some(entry.size))
            .map_err(append_error)?;

        loop {
            let bytes_read = match data.read(&mut self.buffer) {
                Ok(0) => break,
                Ok(bytes_read) => bytes_read,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_error_or(e, |e| append_error(SZipError::Io(e)))),
            };

            self.writer
                .write_data(&self.buffer[..bytes_read])
                .map_err(append_error)?;
        }

        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        // Finishes the last entry, then writes the central directory and end record
        let mut output = self
            .writer
            .finish()
            .context(crate::error::ZipFinishSnafu)?;

        output.flush().context(crate::error::FlushSnafu)
    }
}
