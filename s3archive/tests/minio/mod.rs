//! Tests that exercise the S3 implementation against a local [minio](https://min.io) server.
//!
//! We're not testing minio's compatibility with S3 here, but rather that our code drives the S3
//! API correctly: single-request uploads, multipart uploads, upload options and error mapping.
//!
//! These need the `minio` binary, either on `PATH` or named by `MINIO_PATH`.
use crate::{progress::TestArchiveProgressCallback, Result};
use assert_matches::assert_matches;
use s3archive::{ArchiveFormat, ArchiveRequest, Archiver, Config, ErrorKind, S3};
use s3archive_testing::{archive, logging::test_with_logging, minio, test_data};
use std::sync::Arc;

/// Set up the config to use the specified minio server, with the smallest chunk size S3 allows
/// so that modest test objects are enough to force a multipart upload
fn config_for_minio(server: &minio::MinioServer) -> Config {
    Config {
        aws_region: Some("us-east-1".to_string()),
        s3_endpoint: Some(server.endpoint_url()),
        multipart_chunk_size: byte_unit::Byte::from_bytes(5 * 1024 * 1024),
        ..Config::default()
    }
}

async fn test_setup(bucket: &str) -> Result<(Arc<minio::MinioServer>, String, Archiver)> {
    let server = minio::MinioServer::get().await?;
    let bucket = server.create_bucket(bucket).await?;

    // The minio credentials aren't in the environment, so hand over a ready-made client
    let storage = S3::new(server.aws_client().await?, config_for_minio(&server));
    let archiver = Archiver::new(storage, config_for_minio(&server));

    Ok((server, bucket, archiver))
}

async fn archive_entries(
    server: &minio::MinioServer,
    result: &s3archive::ArchiveResult,
    format: ArchiveFormat,
) -> Result<Vec<(String, bytes::Bytes)>> {
    let data = server
        .get_object(&result.s3_bucket, &result.file_key)
        .await?;
    assert_eq!(result.file_size, data.len() as u64);

    match format {
        ArchiveFormat::Zip => archive::zip_entries(&data),
        ArchiveFormat::Tar => archive::tar_entries(&data),
    }
}

async fn small_archive(format: ArchiveFormat) -> Result<()> {
    let (server, bucket, archiver) = test_setup(&format!("small-{format}")).await?;
    let test_data = test_data::make_test_data(
        &server.aws_client().await?,
        &bucket,
        vec![
            test_data::TestObject::new("reports/jan.csv", "10 KiB"),
            test_data::TestObject::new("reports/feb.csv", "20 KiB"),
            test_data::TestObject::new("reports/nested/mar.csv", "1 KiB"),
        ],
    )
    .await?;

    let progress = TestArchiveProgressCallback::new();
    let result = archiver
        .archive_with_progress(
            ArchiveRequest::new(&bucket, "reports").with_archive_format(format),
            futures::future::pending(),
            progress.clone(),
        )
        .await?;
    progress.sanity_check_updates(&result);

    assert_eq!(bucket, result.s3_bucket);
    assert_eq!(format!("reports/archive.{}", format.extension()), result.file_key);

    let entries = archive_entries(&server, &result, format).await?;
    test_data::validate_archive_entries(
        &test_data,
        &entries,
        [
            ("feb.csv", "reports/feb.csv"),
            ("jan.csv", "reports/jan.csv"),
            ("mar.csv", "reports/nested/mar.csv"),
        ],
    );

    Ok(())
}

#[test]
fn small_zip_archive() -> Result<()> {
    test_with_logging(small_archive(ArchiveFormat::Zip))
}

#[test]
fn small_tar_archive() -> Result<()> {
    test_with_logging(small_archive(ArchiveFormat::Tar))
}

/// An archive bigger than two chunks goes up as a multipart upload
#[test]
fn large_archive_uses_multipart_upload() -> Result<()> {
    test_with_logging(async move {
        let (server, bucket, archiver) = test_setup("multipart").await?;
        let test_data = test_data::make_test_data(
            &server.aws_client().await?,
            &bucket,
            vec![
                test_data::TestObject::new("big/a.bin", "6 MiB"),
                test_data::TestObject::new("big/b.bin", "7 MiB"),
            ],
        )
        .await?;

        let progress = TestArchiveProgressCallback::new();
        let result = archiver
            .archive_with_progress(
                ArchiveRequest::new(&bucket, "big").with_output_format("tar"),
                futures::future::pending(),
                progress.clone(),
            )
            .await?;
        progress.sanity_check_updates(&result);

        // One progress update per part, and 13MiB of data needs three 5MiB parts
        let uploads = progress
            .events()
            .into_iter()
            .filter(|event| {
                matches!(
                    event,
                    crate::progress::ArchiveProgressEvent::ArchiveBytesUploaded { .. }
                )
            })
            .count();
        assert_eq!(3, uploads);

        let entries = archive_entries(&server, &result, ArchiveFormat::Tar).await?;
        test_data::validate_archive_entries(
            &test_data,
            &entries,
            [("a.bin", "big/a.bin"), ("b.bin", "big/b.bin")],
        );

        Ok(())
    })
}

/// An empty prefix still produces a valid, empty archive
#[test]
fn empty_prefix_uploads_empty_archive() -> Result<()> {
    test_with_logging(async move {
        let (server, bucket, archiver) = test_setup("empty").await?;

        let result = archiver
            .archive(ArchiveRequest::new(&bucket, "nothing-here"))
            .await?;

        assert_eq!("nothing-here/archive.zip", result.file_key);
        assert!(archive_entries(&server, &result, ArchiveFormat::Zip)
            .await?
            .is_empty());

        Ok(())
    })
}

/// Upload options end up on the archive object
#[test]
fn upload_options_are_applied() -> Result<()> {
    test_with_logging(async move {
        let (server, bucket, archiver) = test_setup("options").await?;
        test_data::make_test_data(
            &server.aws_client().await?,
            &bucket,
            vec![test_data::TestObject::new("in/a.bin", "1 KiB")],
        )
        .await?;

        let options = serde_json::json!({
            "ContentType": "application/zip",
            "Metadata": { "job": "42" },
            "Key": "out/custom.zip",
        });
        let options = options.as_object().unwrap().clone();

        let result = archiver
            .archive(ArchiveRequest::new(&bucket, "in").with_upload_options(options))
            .await?;
        assert_eq!("out/custom.zip", result.file_key);

        let head = server
            .aws_client()
            .await?
            .head_object()
            .bucket(&bucket)
            .key("out/custom.zip")
            .send()
            .await?;
        assert_eq!(Some("application/zip"), head.content_type());
        assert_eq!(
            Some("42"),
            head.metadata()
                .and_then(|metadata| metadata.get("job"))
                .map(String::as_str)
        );

        // Nothing at the default destination
        assert!(!server
            .list_keys(&bucket)
            .await?
            .contains(&"in/archive.zip".to_string()));

        Ok(())
    })
}

/// A listed file that doesn't exist fails the archive as a read error, and no archive is left
/// in the bucket
#[test]
fn missing_file_fails_without_archive() -> Result<()> {
    test_with_logging(async move {
        let (server, bucket, archiver) = test_setup("missing").await?;
        test_data::make_test_data(
            &server.aws_client().await?,
            &bucket,
            vec![test_data::TestObject::new("in/a.bin", "1 KiB")],
        )
        .await?;

        let err = archiver
            .archive(ArchiveRequest::new(&bucket, "in").with_source_files(["a.bin", "ghost.bin"]))
            .await
            .unwrap_err();
        assert_matches!(err.kind(), ErrorKind::Read);

        assert_eq!(vec!["in/a.bin".to_string()], server.list_keys(&bucket).await?);

        Ok(())
    })
}

/// Listing a bucket that doesn't exist is a listing error
#[test]
fn missing_bucket_is_a_listing_error() -> Result<()> {
    test_with_logging(async move {
        let (_server, _bucket, archiver) = test_setup("unused").await?;

        let err = archiver
            .archive(ArchiveRequest::new("no-such-bucket-s3archive", "in"))
            .await
            .unwrap_err();
        assert_matches!(err.kind(), ErrorKind::Listing);

        Ok(())
    })
}
