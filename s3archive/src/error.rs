use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::{
    complete_multipart_upload::CompleteMultipartUploadError,
    create_multipart_upload::CreateMultipartUploadError, get_object::GetObjectError,
    list_objects_v2::ListObjectsV2Error, put_object::PutObjectError,
    upload_part::UploadPartError,
};
use snafu::prelude::*;

pub type Result<T, E = S3ArchiveError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum S3ArchiveError {
    #[snafu(display("Error listing objects in S3 bucket '{bucket}' with prefix '{prefix}'"))]
    ListObjectsInPrefix {
        bucket: String,
        prefix: String,
        source: SdkError<ListObjectsV2Error>,
    },

    #[snafu(display("Listing objects in bucket '{bucket}' with prefix '{prefix}' failed: {reason}"))]
    ListingFailed {
        bucket: String,
        prefix: String,
        reason: String,
    },

    #[snafu(display("Error getting object '{key}' in S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: SdkError<GetObjectError>,
    },

    #[snafu(display("The object '{key}' does not exist in bucket '{bucket}'"))]
    ObjectNotFound { bucket: String, key: String },

    #[snafu(display("Error reading data from object '{key}' in S3 bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display("Reading object '{key}' in bucket '{bucket}' was interrupted after {offset} bytes"))]
    ReadInterrupted {
        bucket: String,
        key: String,
        offset: u64,
    },

    #[snafu(display(
        "Object '{key}' was expected to contain {expected} bytes but {actual} bytes were read"
    ))]
    ObjectSizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("The object '{key}' has no name to give its archive entry"))]
    EntryNameRequired { key: String },

    #[snafu(display("Error appending '{name}' to the tar archive"))]
    TarAppendData {
        name: String,
        source: std::io::Error,
    },

    #[snafu(display("Error writing the end of the tar archive"))]
    TarFinish { source: std::io::Error },

    #[snafu(display("Error starting the zip archive"))]
    ZipCreate { source: s_zip::SZipError },

    #[snafu(display("Error appending '{name}' to the zip archive"))]
    ZipAppendData {
        name: String,
        source: s_zip::SZipError,
    },

    #[snafu(display("Error writing the zip central directory"))]
    ZipFinish { source: s_zip::SZipError },

    #[snafu(display("Error flushing the archive writer"))]
    Flush { source: std::io::Error },

    #[snafu(display("The archive encoder was already finished or has failed"))]
    EncoderClosed,

    #[snafu(display("The archive writer thread exited unexpectedly"))]
    EncoderWorkerGone,

    #[snafu(display("Blocking task panicked or was canceled"))]
    SpawnBlocking { source: tokio::task::JoinError },

    #[snafu(display("The upload option '{option}' is not supported"))]
    UnsupportedUploadOption { option: String },

    #[snafu(display("The upload option '{option}' has an invalid value: {reason}"))]
    InvalidUploadOption { option: String, reason: String },

    #[snafu(display("Error putting object '{key}' in S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: SdkError<PutObjectError>,
    },

    #[snafu(display("Error creating multipart upload of object '{key}' in S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CreateMultipartUploadError>,
    },

    #[snafu(display(
        "Error uploading part {part_number} of object '{key}' in S3 bucket '{bucket}'"
    ))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: usize,
        source: SdkError<UploadPartError>,
    },

    #[snafu(display(
        "Error completing multipart upload of object '{key}' in S3 bucket '{bucket}'"
    ))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<CompleteMultipartUploadError>,
    },

    #[snafu(display("The archive uploaded to '{key}' in bucket '{bucket}' would need more than {max_parts} multipart chunks; increase the multipart chunk size"))]
    TooManyParts {
        bucket: String,
        key: String,
        max_parts: usize,
    },

    #[snafu(display("Upload of object '{key}' to bucket '{bucket}' was rejected: {reason}"))]
    UploadRejected {
        bucket: String,
        key: String,
        reason: String,
    },

    #[snafu(display(
        "The upload task for object '{key}' in bucket '{bucket}' ended without reporting a result"
    ))]
    UploadAbandoned { bucket: String, key: String },

    #[snafu(display("The archive operation was aborted"))]
    Aborted,
}

/// Coarse classification of [`S3ArchiveError`] by the pipeline stage that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum ErrorKind {
    Listing,
    Read,
    Encoding,
    Upload,
    Aborted,
}

impl S3ArchiveError {
    /// The pipeline stage this error originated in
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ListObjectsInPrefix { .. } | Self::ListingFailed { .. } => ErrorKind::Listing,

            Self::GetObject { .. }
            | Self::ObjectNotFound { .. }
            | Self::ReadByteStream { .. }
            | Self::ReadInterrupted { .. }
            | Self::ObjectSizeMismatch { .. } => ErrorKind::Read,

            Self::EntryNameRequired { .. }
            | Self::TarAppendData { .. }
            | Self::TarFinish { .. }
            | Self::ZipCreate { .. }
            | Self::ZipAppendData { .. }
            | Self::ZipFinish { .. }
            | Self::Flush { .. }
            | Self::EncoderClosed
            | Self::EncoderWorkerGone
            | Self::SpawnBlocking { .. } => ErrorKind::Encoding,

            Self::UnsupportedUploadOption { .. }
            | Self::InvalidUploadOption { .. }
            | Self::PutObject { .. }
            | Self::CreateMultipartUpload { .. }
            | Self::UploadPart { .. }
            | Self::CompleteMultipartUpload { .. }
            | Self::TooManyParts { .. }
            | Self::UploadRejected { .. }
            | Self::UploadAbandoned { .. } => ErrorKind::Upload,

            Self::Aborted => ErrorKind::Aborted,
        }
    }

    /// True if this error is the encoder failing to write because the uploader on the other end of
    /// the pipe has gone away.
    ///
    /// In that case the uploader's own result holds the error that actually matters.
    pub(crate) fn is_broken_pipe(&self) -> bool {
        let io_error = match self {
            Self::TarAppendData { source, .. }
            | Self::TarFinish { source }
            | Self::Flush { source } => Some(source),
            Self::ZipAppendData {
                source: s_zip::SZipError::Io(source),
                ..
            }
            | Self::ZipFinish {
                source: s_zip::SZipError::Io(source),
            } => Some(source),
            _ => None,
        };

        io_error.is_some_and(|e| e.kind() == std::io::ErrorKind::BrokenPipe)
    }

    /// Recover an [`S3ArchiveError`] that was smuggled through a [`std::io::Error`].
    ///
    /// Source object streams are read by the synchronous container writers via
    /// [`crate::async_bridge::blocking_reader`], which can only report failures as `io::Error`.
    /// Returns the original error if `e` wraps one, otherwise gives `e` back unchanged.
    pub(crate) fn from_io_error(e: std::io::Error) -> std::result::Result<Self, std::io::Error> {
        if !e.get_ref().is_some_and(|inner| inner.is::<Self>()) {
            return Err(e);
        }

        let kind = e.kind();
        match e.into_inner().map(|inner| inner.downcast::<Self>()) {
            Some(Ok(inner)) => Ok(*inner),
            Some(Err(inner)) => Err(std::io::Error::new(kind, inner)),
            None => Err(std::io::Error::from(kind)),
        }
    }
}
