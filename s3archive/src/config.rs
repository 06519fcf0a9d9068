use url::Url;

/// The configuration settings that control how archives are built and uploaded.
///
/// Credentials aren't part of this; they come from the usual AWS sources (env vars, profile,
/// IMDS).
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  Path-style addressing is used
    /// for custom endpoints.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The AWS region to use.
    ///
    /// If not set, the region is taken from the AWS environment (env vars, profile, IMDS), falling
    /// back to `us-east-1`.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "REGION"))]
    pub aws_region: Option<String>,

    /// The chunk size used when uploading the archive to object storage.
    ///
    /// An archive smaller than one chunk is uploaded with a single request; anything bigger uses
    /// a multipart upload with parts of this size.  S3 requires parts to be at least 5MiB, smaller
    /// values are raised to that minimum.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    ///
    /// Note that the maximum number of chunks in an upload is 10,000, so this also caps the size
    /// of the archive at 10,000 times the chunk size.
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The maximum number of concurrent requests to the bucket when uploading the archive.
    ///
    /// Each chunk of a multipart upload counts as a separate request.  A higher number may be
    /// necessary to saturate very fast connections to S3, but this will also increase RAM usage
    /// because each in-flight chunk is held in memory.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_requests: usize,

    /// DEFLATE compression level for zip archives, from 0 (fastest) to 9 (smallest).
    ///
    /// Ignored for tar archives, which are not compressed.
    #[cfg_attr(feature = "clap", clap(long, default_value = "6", global = true))]
    pub zip_compression_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            s3_endpoint: None,
            aws_region: None,
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            max_concurrent_requests: 10,
            zip_compression_level: 6,
        }
    }
}
