use super::{read_error_or, ContainerWriter, Entry};
use crate::Result;
use snafu::{IntoError, ResultExt};
use std::io::{Read, Write};

/// Regular files, readable by everyone, writable by the owner
const ENTRY_MODE: u32 = 0o644;

pub(super) struct TarWriter<W: Write> {
    builder: tar::Builder<W>,
}

impl<W: Write> TarWriter<W> {
    pub fn new(output: W) -> Self {
        Self {
            builder: tar::Builder::new(output),
        }
    }
}

impl<W: Write> ContainerWriter for TarWriter<W> {
    fn append(&mut self, entry: &Entry, data: &mut dyn Read) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(entry.size);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(
            entry
                .last_modified
                .map(|timestamp| timestamp.timestamp().max(0) as u64)
                .unwrap_or_default(),
        );

        // `append_data` fills in the path (with a GNU long name entry if needed) and the checksum
        self.builder
            .append_data(&mut header, &entry.name, data)
            .map_err(|e| {
                read_error_or(e, |e| {
                    crate::error::TarAppendDataSnafu {
                        name: entry.name.clone(),
                    }
                    .into_error(e)
                })
            })
    }

    fn finish(self: Box<Self>) -> Result<()> {
        // `into_inner` writes the two zero blocks that end the archive
        let mut output = self
            .builder
            .into_inner()
            .context(crate::error::TarFinishSnafu)?;

        output.flush().context(crate::error::FlushSnafu)
    }
}
