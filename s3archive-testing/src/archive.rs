//! Read back the zip and tar archives under test, so their entries can be checked
use crate::Result;
use bytes::Bytes;
use std::io::{Read, Write};

/// The entries of a tar archive in order, each as `(path, data)`
pub fn tar_entries(archive: &[u8]) -> Result<Vec<(String, Bytes)>> {
    let mut archive = tar::Archive::new(archive);
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        entries.push((path, data.into()));
    }

    Ok(entries)
}

/// The metadata recorded in the tar header of each entry, as `(path, mode, mtime)`
pub fn tar_headers(archive: &[u8]) -> Result<Vec<(String, u32, u64)>> {
    let mut archive = tar::Archive::new(archive);

    archive
        .entries()?
        .map(|entry| {
            let entry = entry?;
            let header = entry.header();

            Ok((
                entry.path()?.to_string_lossy().into_owned(),
                header.mode()?,
                header.mtime()?,
            ))
        })
        .collect()
}

/// The entries of a zip archive in central directory order, each as `(name, data)`
pub fn zip_entries(archive: &[u8]) -> Result<Vec<(String, Bytes)>> {
    // The zip reader only reads from files
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(archive)?;
    file.flush()?;

    let mut reader = s_zip::StreamingZipReader::open(file.path())?;
    let listing = reader.entries().to_vec();

    listing
        .into_iter()
        .map(|entry| {
            let data = reader.read_entry(&entry)?;

            Ok((entry.name, data.into()))
        })
        .collect()
}

/// Just the names of the entries of a zip archive
pub fn zip_entry_names(archive: &[u8]) -> Result<Vec<String>> {
    Ok(zip_entries(archive)?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}
