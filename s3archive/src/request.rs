use crate::objstore::UploadOptions;
use serde::Serialize;
use std::str::FromStr;

/// The name the archive gets when the caller doesn't choose one
pub const DEFAULT_OUTPUT_FILENAME: &str = "archive";

/// The container format of the archive
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ArchiveFormat {
    #[default]
    Zip,
    Tar,
}

impl ArchiveFormat {
    /// Interpret a format name, matched case-insensitively.
    ///
    /// Anything which isn't exactly a format name, including the empty string and names with
    /// surrounding whitespace, means zip.
    pub fn from_str_lossy(format: &str) -> Self {
        Self::from_str(format).unwrap_or_default()
    }

    /// The file extension of archives in this format, without the leading `.`
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Tar => "tar",
        }
    }
}

/// Describes one archive to produce: which objects go in it, and where it goes.
///
/// The archive is written to the source bucket, next to the objects it was made from, unless the
/// upload options say otherwise.
///
/// ```
/// use s3archive::{ArchiveFormat, ArchiveRequest};
///
/// let request = ArchiveRequest::new("reports", "2024/q1")
///     .with_source_files(["jan.csv", "feb.csv", "mar.csv"])
///     .with_output_filename("q1")
///     .with_output_format("TAR");
///
/// assert_eq!(ArchiveFormat::Tar, request.output_format());
/// assert_eq!("2024/q1/q1.tar", request.destination_key());
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveRequest {
    source_bucket: String,
    source_path: String,
    source_files: Vec<String>,
    output_filename: String,
    output_format: ArchiveFormat,
    upload_options: UploadOptions,
}

impl ArchiveRequest {
    /// Archive objects under `source_path` in `source_bucket`.
    ///
    /// An empty `source_path` means the whole bucket.
    pub fn new(source_bucket: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            source_bucket: source_bucket.into(),
            source_path: source_path.into(),
            source_files: Vec::new(),
            output_filename: DEFAULT_OUTPUT_FILENAME.to_string(),
            output_format: ArchiveFormat::default(),
            upload_options: UploadOptions::new(),
        }
    }

    /// Archive only these files, named relative to the source path, in this order.
    ///
    /// If no files are given, every object under the source path is archived.
    pub fn with_source_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// The base name of the archive, without extension
    pub fn with_output_filename(mut self, filename: impl Into<String>) -> Self {
        self.output_filename = filename.into();
        self
    }

    /// Set the archive format by name.  See [`ArchiveFormat::from_str_lossy`].
    pub fn with_output_format(mut self, format: &str) -> Self {
        self.output_format = ArchiveFormat::from_str_lossy(format);
        self
    }

    pub fn with_archive_format(mut self, format: ArchiveFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Options passed through to the storage backend when the archive is written
    pub fn with_upload_options(mut self, options: UploadOptions) -> Self {
        self.upload_options = options;
        self
    }

    pub fn source_bucket(&self) -> &str {
        &self.source_bucket
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn source_files(&self) -> &[String] {
        &self.source_files
    }

    pub fn output_filename(&self) -> &str {
        &self.output_filename
    }

    pub fn output_format(&self) -> ArchiveFormat {
        self.output_format
    }

    pub fn upload_options(&self) -> &UploadOptions {
        &self.upload_options
    }

    /// The key the archive is written to: `<path>/<filename>.<ext>`, or just `<filename>.<ext>`
    /// when the source path is empty
    pub fn destination_key(&self) -> String {
        self.qualify(&format!(
            "{}.{}",
            self.output_filename,
            self.output_format.extension()
        ))
    }

    /// The full key of one of the explicitly listed source files
    pub(crate) fn source_key(&self, file: &str) -> String {
        self.qualify(file)
    }

    /// Keys equal to this are folder placeholders, not files, and are never archived
    pub(crate) fn directory_marker(&self) -> String {
        format!("{}/", self.source_path)
    }

    fn qualify(&self, name: &str) -> String {
        if self.source_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.source_path, name)
        }
    }
}

/// The name an object gets inside the archive: everything in its key after the last `/`.
///
/// Objects with the same name in different folders produce entries with the same name.
pub(crate) fn entry_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Where the archive was written, and how big it is
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveResult {
    pub s3_bucket: String,
    pub file_key: String,

    /// Size of the archive in bytes
    pub file_size: u64,
}
