//! End-to-end archive tests against [`s3archive::MemoryStorage`].
//!
//! These run the whole pipeline (listing, streaming reads, encoding, upload) without any network,
//! with objects big enough to span many read chunks, and check the archive that lands in storage
//! entry by entry.
use crate::{progress::TestArchiveProgressCallback, Result};
use assert_matches::assert_matches;
use s3archive::{ArchiveFormat, ArchiveRequest, Archiver, Config, ErrorKind, MemoryStorage};
use s3archive_testing::{archive, logging::test_with_logging, test_data};
use std::collections::HashMap;

const BUCKET: &str = "archives";

/// Small enough that every object here is read in several pieces
const READ_CHUNK_SIZE: usize = 16 * 1024;

fn storage_with(
    objects: impl IntoIterator<Item = test_data::TestObject>,
) -> (MemoryStorage, HashMap<String, test_data::TestObjectWithData>) {
    let storage = MemoryStorage::new().with_read_chunk_size(READ_CHUNK_SIZE);
    storage.create_bucket(BUCKET);

    let test_data = test_data::generate_test_data(objects);
    for object in test_data.values() {
        storage.put_object(BUCKET, object.key.clone(), object.data.clone());
    }

    (storage, test_data)
}

/// Run the archive request to completion and return the result with the entries of the archive
/// it produced
async fn run_archive(
    storage: &MemoryStorage,
    request: ArchiveRequest,
) -> Result<(s3archive::ArchiveResult, Vec<(String, bytes::Bytes)>)> {
    let format = request.output_format();
    let progress = TestArchiveProgressCallback::new();
    let archiver = Archiver::new(storage.clone(), Config::default());

    let result = archiver
        .archive_with_progress(request, futures::future::pending(), progress.clone())
        .await?;

    progress.sanity_check_updates(&result);

    let data = storage
        .get_object(&result.s3_bucket, &result.file_key)
        .expect("archive was not stored");
    assert_eq!(result.file_size, data.len() as u64);

    let entries = match format {
        ArchiveFormat::Zip => archive::zip_entries(&data)?,
        ArchiveFormat::Tar => archive::tar_entries(&data)?,
    };

    Ok((result, entries))
}

/// Defines one test module per case, with a test for each archive format.
///
/// Each case states the objects in the bucket, the source path and optional explicit file list
/// of the request, and the entries the archive should end up with, in order, each paired with
/// the key of the object it came from.
macro_rules! archive_and_verify_test {
    ($test_name:ident {
        @bucket_contents: [$($test_data_key:expr => $test_data_size:expr),+],
        @source_path: $source_path:expr,
        @source_files: [$($file:expr),*],
        @expected_entries: [$($entry_name:expr => $entry_key:expr),*]
    }) => {
        mod $test_name {
            use super::*;

            fn test_setup() -> (MemoryStorage, HashMap<String, test_data::TestObjectWithData>) {
                storage_with(vec![
                    $(test_data::TestObject::new($test_data_key, $test_data_size)),+
                ])
            }

            fn make_request(format: ArchiveFormat) -> ArchiveRequest {
                let files: Vec<&str> = vec![$($file),*];
                let request = ArchiveRequest::new(BUCKET, $source_path).with_archive_format(format);

                if files.is_empty() {
                    request
                } else {
                    request.with_source_files(files)
                }
            }

            async fn run_and_validate(format: ArchiveFormat) -> Result<()> {
                let (storage, test_data) = test_setup();
                let request = make_request(format);
                let expected_key = request.destination_key();

                let (result, entries) = run_archive(&storage, request).await?;

                assert_eq!(BUCKET, result.s3_bucket);
                assert_eq!(expected_key, result.file_key);

                test_data::validate_archive_entries(
                    &test_data,
                    &entries,
                    [$(($entry_name, $entry_key)),*],
                );

                Ok(())
            }

            #[test]
            fn zip() -> Result<()> {
                test_with_logging(run_and_validate(ArchiveFormat::Zip))
            }

            #[test]
            fn tar() -> Result<()> {
                test_with_logging(run_and_validate(ArchiveFormat::Tar))
            }
        }
    };
}

archive_and_verify_test!(whole_prefix {
    @bucket_contents: [
        "data/a.bin" => "10 KiB",
        "data/b.bin" => "100 KiB",
        "data/c.bin" => "1 MiB",
        "other/d.bin" => "1 KiB"
    ],
    @source_path: "data",
    @source_files: [],
    @expected_entries: [
        "a.bin" => "data/a.bin",
        "b.bin" => "data/b.bin",
        "c.bin" => "data/c.bin"
    ]
});

archive_and_verify_test!(explicit_files_in_request_order {
    @bucket_contents: [
        "data/a.bin" => "10 KiB",
        "data/b.bin" => "100 KiB",
        "data/c.bin" => "64 KiB"
    ],
    @source_path: "data",
    @source_files: ["c.bin", "a.bin"],
    @expected_entries: [
        "c.bin" => "data/c.bin",
        "a.bin" => "data/a.bin"
    ]
});

archive_and_verify_test!(nested_keys_are_flattened {
    @bucket_contents: [
        "logs/2024/01/app.log" => "30 KiB",
        "logs/2024/db.log" => "20 KiB",
        "logs/top.log" => "1 KiB"
    ],
    @source_path: "logs",
    @source_files: [],
    @expected_entries: [
        "app.log" => "logs/2024/01/app.log",
        "db.log" => "logs/2024/db.log",
        "top.log" => "logs/top.log"
    ]
});

archive_and_verify_test!(empty_and_tiny_objects {
    @bucket_contents: [
        "tiny/empty.bin" => "0 B",
        "tiny/one.bin" => "1 B",
        "tiny/chunk.bin" => "16 KiB"
    ],
    @source_path: "tiny",
    @source_files: [],
    @expected_entries: [
        "chunk.bin" => "tiny/chunk.bin",
        "empty.bin" => "tiny/empty.bin",
        "one.bin" => "tiny/one.bin"
    ]
});

archive_and_verify_test!(folder_marker_is_skipped {
    @bucket_contents: [
        "folder/" => "0 B",
        "folder/a.bin" => "5 KiB"
    ],
    @source_path: "folder",
    @source_files: [],
    @expected_entries: [
        "a.bin" => "folder/a.bin"
    ]
});

/// Enough objects that the listing spans many pages
#[test]
fn many_objects_across_listing_pages() -> Result<()> {
    test_with_logging(async move {
        let (storage, test_data) = storage_with(
            (0..150).map(|i| test_data::TestObject::new(format!("many/{i:04}.bin"), "1 KiB")),
        );
        let storage = storage.with_page_size(7);

        let (_, entries) = run_archive(
            &storage,
            ArchiveRequest::new(BUCKET, "many").with_archive_format(ArchiveFormat::Tar),
        )
        .await?;

        let names = (0..150).map(|i| format!("{i:04}.bin")).collect::<Vec<_>>();
        let keys = names
            .iter()
            .map(|name| format!("many/{name}"))
            .collect::<Vec<_>>();

        test_data::validate_archive_entries(
            &test_data,
            &entries,
            names
                .iter()
                .map(String::as_str)
                .zip(keys.iter().map(String::as_str)),
        );

        // 150 keys in pages of 7
        assert_eq!(22, storage.list_requests());

        Ok(())
    })
}

/// One archiver can build several archives at the same time
#[test]
fn concurrent_archives_share_an_archiver() -> Result<()> {
    test_with_logging(async move {
        let (storage, test_data) = storage_with(vec![
            test_data::TestObject::new("shared/a.bin", "200 KiB"),
            test_data::TestObject::new("shared/b.bin", "300 KiB"),
        ]);
        let archiver = Archiver::new(storage.clone(), Config::default());

        let requests = (0..4).map(|i| {
            let format = if i % 2 == 0 {
                ArchiveFormat::Zip
            } else {
                ArchiveFormat::Tar
            };
            ArchiveRequest::new(BUCKET, "shared")
                .with_source_files(["a.bin", "b.bin"])
                .with_output_filename(format!("copy-{i}"))
                .with_archive_format(format)
        });

        let results =
            futures::future::try_join_all(requests.map(|request| archiver.archive(request)))
                .await?;

        for (i, result) in results.into_iter().enumerate() {
            let data = storage
                .get_object(BUCKET, &result.file_key)
                .expect("archive was not stored");
            let entries = if i % 2 == 0 {
                assert_eq!(format!("shared/copy-{i}.zip"), result.file_key);
                archive::zip_entries(&data)?
            } else {
                assert_eq!(format!("shared/copy-{i}.tar"), result.file_key);
                archive::tar_entries(&data)?
            };

            test_data::validate_archive_entries(
                &test_data,
                &entries,
                [("a.bin", "shared/a.bin"), ("b.bin", "shared/b.bin")],
            );
        }

        Ok(())
    })
}

/// The tar headers carry the entry sizes and a fixed file mode
#[test]
fn tar_headers_describe_regular_files() -> Result<()> {
    test_with_logging(async move {
        let (storage, _) = storage_with(vec![
            test_data::TestObject::new("meta/a.bin", "3 KiB"),
            test_data::TestObject::new("meta/b.bin", "0 B"),
        ]);

        let result = Archiver::new(storage.clone(), Config::default())
            .archive(ArchiveRequest::new(BUCKET, "meta").with_output_format("tar"))
            .await?;
        let data = storage.get_object(BUCKET, &result.file_key).unwrap();

        // Memory storage doesn't track modification times
        assert_eq!(
            vec![
                ("a.bin".to_string(), 0o644, 0),
                ("b.bin".to_string(), 0o644, 0)
            ],
            archive::tar_headers(&data)?
        );

        Ok(())
    })
}

/// A read that fails partway through an object fails the whole archive, and leaves nothing
/// behind in storage
#[test]
fn failed_read_leaves_no_archive() -> Result<()> {
    test_with_logging(async move {
        let (storage, _) = storage_with(vec![
            test_data::TestObject::new("broken/a.bin", "100 KiB"),
            test_data::TestObject::new("broken/b.bin", "100 KiB"),
        ]);
        storage.interrupt_reads_of("broken/b.bin");

        let request = ArchiveRequest::new(BUCKET, "broken");
        let destination_key = request.destination_key();

        let err = Archiver::new(storage.clone(), Config::default())
            .archive(request)
            .await
            .unwrap_err();

        assert_matches!(err.kind(), ErrorKind::Read);
        assert_eq!(None, storage.get_object(BUCKET, &destination_key));

        Ok(())
    })
}
