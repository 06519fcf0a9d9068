#![doc = include_str!("../README.md")]

mod archive;
mod async_bridge;
mod config;
mod encoder;
mod error;
mod list;
mod objstore;
mod request;
mod writers;

pub use archive::{ArchiveProgressCallback, Archiver};
pub use config::Config;
pub use error::{ErrorKind, Result, S3ArchiveError};
pub use objstore::{
    ListObjectsPage, MemoryStorage, ObjectStorage, ObjectWriter, SourceObject, UploadCompletion,
    UploadOptions, UploadedObject, S3,
};
pub use request::{ArchiveFormat, ArchiveRequest, ArchiveResult, DEFAULT_OUTPUT_FILENAME};
