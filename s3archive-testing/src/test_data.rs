//! Random test objects, and checks that an archive holds exactly what was put into it
use crate::Result;
use aws_sdk_s3::{primitives::ByteStream, Client};
use bytes::Bytes;
use futures::StreamExt;
use rand::prelude::*;
use sha2::Digest;
use std::collections::HashMap;

/// Max concurrent S3 operations when dealing with test data
const MAX_CONCURRENCY: usize = 10;

/// A test object to create: its key and how big it is
#[derive(Clone, Debug)]
pub struct TestObject {
    pub key: String,
    pub size: usize,
}

impl TestObject {
    /// The size is a human-friendly string like "10 KB" or "20 MiB"
    pub fn new(key: impl Into<String>, size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap();

        Self {
            key: key.into(),
            size: size.get_bytes() as usize,
        }
    }
}

/// A [`TestObject`] along with the random data it was filled with
#[derive(Clone, Debug)]
pub struct TestObjectWithData {
    pub key: String,
    pub data: Bytes,
    pub hash: [u8; 32],
}

impl TestObjectWithData {
    pub fn generate(object: TestObject) -> Self {
        let mut data = vec![0u8; object.size];
        rand::thread_rng().fill(&mut data[..]);

        Self {
            hash: sha256(&data),
            key: object.key,
            data: data.into(),
        }
    }
}

/// SHA-256 of some data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&sha2::Sha256::digest(data));

    hash
}

/// Generate random data for each object spec, keyed by object key
pub fn generate_test_data(
    objects: impl IntoIterator<Item = TestObject>,
) -> HashMap<String, TestObjectWithData> {
    let mut test_data = HashMap::new();

    for object in objects {
        let object = TestObjectWithData::generate(object);
        let key = object.key.clone();

        assert!(
            test_data.insert(key.clone(), object).is_none(),
            "BUG: test data contains the same key '{key}' more than once"
        );
    }

    test_data
}

/// Generate the test objects and upload them all to `bucket`.
///
/// Returns the same objects with the data they now hold.
pub async fn make_test_data(
    client: &Client,
    bucket: &str,
    objects: impl IntoIterator<Item = TestObject>,
) -> Result<HashMap<String, TestObjectWithData>> {
    let test_data = generate_test_data(objects);

    let mut uploads = futures::stream::iter(test_data.values().map(|object| async move {
        client
            .put_object()
            .bucket(bucket)
            .key(&object.key)
            .body(ByteStream::from(object.data.clone()))
            .send()
            .await
    }))
    .buffer_unordered(MAX_CONCURRENCY);

    while let Some(result) = uploads.next().await {
        result?;
    }
    drop(uploads);

    Ok(test_data)
}

/// Assert that archive entries (as `(name, data)` pairs, in archive order) match the expected
/// test objects in both order and content.
///
/// `expected` lists the entry names in the order they should appear, each with the key of the
/// test object whose data the entry should hold.
#[track_caller]
pub fn validate_archive_entries<'a>(
    test_data: &HashMap<String, TestObjectWithData>,
    entries: &[(String, Bytes)],
    expected: impl IntoIterator<Item = (&'a str, &'a str)>,
) {
    let expected = expected.into_iter().collect::<Vec<_>>();

    println!("Archive contains {} entries:", entries.len());
    for (name, data) in entries {
        println!("  {name} ({} bytes)", data.len());
    }

    assert_eq!(
        expected.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
        entries.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
        "Archive entry names don't match"
    );

    for ((name, key), (_, data)) in expected.into_iter().zip(entries) {
        let object = test_data.get(key).unwrap_or_else(|| {
            panic!("BUG: test expects key '{key}' but the test data has no such object")
        });

        assert_eq!(
            object.hash,
            sha256(data),
            "Entry '{name}' doesn't hold the data of object '{key}'"
        );
    }
}
