//! Ephemeral instances of the `minio` server, so tests can run against real S3-compatible object
//! storage without touching AWS

use crate::Result;
use aws_sdk_s3::config::{Credentials, Region};
use bytes::Bytes;
use color_eyre::eyre::eyre;
use duct::Handle;
use once_cell::sync::Lazy;
use rand::prelude::*;
use regex::Regex;
use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    sync::{Arc, Weak},
    time::Duration,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;
use which::which;

/// Credentials minio accepts out of the box
const MINIO_ACCESS_KEY: &str = "minioadmin";
const MINIO_SECRET_KEY: &str = "minioadmin";

/// S3 bucket names can't be any longer than this
const MAX_BUCKET_NAME_LEN: usize = 63;

pub struct MinioServer {
    #[allow(dead_code)] // Only held so the data dir outlives the server
    temp_dir: TempDir,
    handle: Handle,
    endpoint: SocketAddr,
}

impl MinioServer {
    /// Get the minio server shared by all tests in this process, starting one if none is running.
    ///
    /// The server is stopped once the last test holding the `Arc` drops it.
    pub async fn get() -> Result<Arc<Self>> {
        // A tokio mutex because the lock is held while the server starts
        static SHARED: Lazy<Mutex<Weak<MinioServer>>> = Lazy::new(|| Mutex::new(Weak::new()));

        let mut shared = SHARED.lock().await;

        let server = match shared.upgrade() {
            Some(server) => server,
            None => {
                let server = Arc::new(Self::start().await?);
                *shared = Arc::downgrade(&server);

                server
            }
        };

        debug!(endpoint = %server.endpoint, "Using shared minio server");

        server.wait_for_service_start().await?;

        Ok(server)
    }

    /// Start a new minio server on a free local port.
    ///
    /// The `minio` binary is taken from the `MINIO_PATH` env var if set, otherwise from `PATH`.
    pub async fn start() -> Result<Self> {
        let path = Self::find_minio()?;
        let endpoint = Self::free_local_endpoint()?;
        let temp_dir = Self::temp_data_dir()?;

        let handle = duct::cmd!(
            path,
            "server",
            temp_dir.path(),
            "--address",
            endpoint.to_string(),
            "--quiet"
        )
        .start()?;

        let server = Self {
            temp_dir,
            handle,
            endpoint,
        };

        debug!(endpoint = %server.endpoint, "Waiting for minio to come online");

        server.wait_for_service_start().await?;

        debug!(endpoint = %server.endpoint, "Minio started");

        Ok(server)
    }

    /// The URL of the server's S3 API
    pub fn endpoint_url(&self) -> url::Url {
        format!("http://{}/", self.endpoint)
            .parse()
            .expect("BUG: socket addresses always make valid URLs")
    }

    /// An S3 client that talks to this server
    pub async fn aws_client(&self) -> Result<aws_sdk_s3::Client> {
        let aws_config = aws_config::from_env()
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::from_keys(
                MINIO_ACCESS_KEY,
                MINIO_SECRET_KEY,
                None,
            ))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .endpoint_url(self.endpoint_url().to_string())
            .force_path_style(true)
            .build();

        Ok(aws_sdk_s3::Client::from_conf(s3_config))
    }

    /// Make a new bucket whose name is derived from `bucket`.
    ///
    /// Every test shares the same server, so the actual name gets a random prefix, and anything
    /// that isn't valid in a bucket name is replaced.  Returns the actual name.
    pub async fn create_bucket(&self, bucket: impl AsRef<str>) -> Result<String> {
        static INVALID_CHARS: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"[^0-9a-z\.\-]+").unwrap());

        let bucket = INVALID_CHARS.replace_all(&bucket.as_ref().to_lowercase(), "-").into_owned();

        // Room for the 8 hex digits and a `-`
        let bucket = &bucket[..bucket.len().min(MAX_BUCKET_NAME_LEN - 9)];
        let bucket = format!("{:08x}-{bucket}", rand::thread_rng().next_u32());

        debug!(%bucket, "Creating bucket");

        let client = self.aws_client().await?;
        client.create_bucket().bucket(&bucket).send().await?;

        // Minio doesn't always make a new bucket usable right away
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        if let Err(e) = policy
            .retry(|| client.head_bucket().bucket(&bucket).send())
            .await
        {
            return Err(eyre!(
                "Bucket {bucket} is still not accessible after it was created.  Last error: \n{e}"
            ));
        }

        Ok(bucket)
    }

    /// Read back an entire object, such as an archive a test has just produced
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let client = self.aws_client().await?;
        let response = client.get_object().bucket(bucket).key(key).send().await?;

        Ok(response.body.collect().await?.into_bytes())
    }

    /// Keys of every object in a bucket
    pub async fn list_keys(&self, bucket: &str) -> Result<Vec<String>> {
        let client = self.aws_client().await?;
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let page = client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation_token)
                .send()
                .await?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            if !page.is_truncated().unwrap_or(false) {
                break;
            }

            continuation_token = page.next_continuation_token().map(str::to_string);
            if continuation_token.is_none() {
                break;
            }
        }

        Ok(keys)
    }

    /// Keep trying to list buckets until the server answers, or give up
    async fn wait_for_service_start(&self) -> Result<()> {
        // Startup takes a while, especially on slow CI boxes
        let policy = again::RetryPolicy::exponential(Duration::from_millis(100))
            .with_max_retries(10)
            .with_max_delay(Duration::from_secs(1));

        let client = self.aws_client().await?;

        policy
            .retry(|| client.list_buckets().send())
            .await
            .map(|_| ())
            .map_err(|e| {
                eyre!("Minio didn't come online in time.  The last ListBuckets error was:\n{e}")
            })
    }

    fn find_minio() -> Result<PathBuf> {
        std::env::var_os("MINIO_PATH")
            .map(PathBuf::from)
            .or_else(|| which("minio").ok())
            .ok_or_else(|| {
                eyre!("Unable to find `minio`; set MINIO_PATH or put the minio executable in your PATH")
            })
    }

    fn free_local_endpoint() -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0")?;

        Ok(listener.local_addr()?)
    }

    /// Minio refuses data directories on `tmpfs` (it needs `O_DIRECT`), which rules out `/tmp`
    /// on most Linux distros, so the data lives in a temp dir under the home directory instead.
    fn temp_data_dir() -> Result<TempDir> {
        let home = dirs::home_dir().ok_or_else(|| eyre!("Unable to determine home directory"))?;

        Ok(tempfile::Builder::new()
            .prefix("s3archive-minio-")
            .tempdir_in(home)?)
    }
}

impl Drop for MinioServer {
    fn drop(&mut self) {
        debug!(pids = ?self.handle.pids(), "Killing minio process(es)");

        if let Err(e) = self.handle.kill() {
            eprintln!("Error killing minio process: {}", e);
        }
    }
}
