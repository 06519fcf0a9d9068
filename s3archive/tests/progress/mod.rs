//! Test helper that implements [`s3archive::ArchiveProgressCallback`] which keeps a record of every
//! progress update in order so we can write tests that verify progress reporting.
use more_asserts::*;
use s3archive::ArchiveProgressCallback;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq, strum::EnumDiscriminants)]
#[allow(dead_code)] // Not every field is checked, but all of them are captured
pub(crate) enum ArchiveProgressEvent {
    SourceFilesResolved {
        count: usize,
    },

    EntryStarted {
        key: String,
        name: String,
        size: u64,
    },

    EntryAppended {
        key: String,
        name: String,
        size: u64,
        archive_bytes_written: u64,
    },

    ArchiveFinalized {
        total_bytes_written: u64,
    },

    ArchiveBytesUploaded {
        bytes: u64,
    },

    ArchiveUploaded {
        bucket: String,
        key: String,
        size: u64,
    },
}

#[derive(Clone, Default)]
pub(crate) struct TestArchiveProgressCallback {
    events: Arc<Mutex<Vec<ArchiveProgressEvent>>>,
}

impl TestArchiveProgressCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ArchiveProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Review all updates after an archive was uploaded successfully, checking that they are
    /// consistent with each other and with the result.
    ///
    /// Not applicable to an archive operation that failed.
    pub fn sanity_check_updates(&self, result: &s3archive::ArchiveResult) {
        let events = self.events();

        // Resolution comes first and is reported exactly once
        let count = match events.first() {
            Some(ArchiveProgressEvent::SourceFilesResolved { count }) => *count,
            other => panic!("First progress event should be the resolved files, got {other:?}"),
        };
        assert_eq!(
            1,
            self.count(ArchiveProgressEventDiscriminants::SourceFilesResolved)
        );

        // Every entry is started and then appended, one entry at a time
        let entry_events = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    ArchiveProgressEvent::EntryStarted { .. }
                        | ArchiveProgressEvent::EntryAppended { .. }
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(count * 2, entry_events.len());

        let mut last_bytes_written = 0;
        for pair in entry_events.chunks(2) {
            match (pair[0], pair[1]) {
                (
                    ArchiveProgressEvent::EntryStarted { key, name, size },
                    ArchiveProgressEvent::EntryAppended {
                        key: appended_key,
                        name: appended_name,
                        size: appended_size,
                        archive_bytes_written,
                    },
                ) => {
                    assert_eq!(key, appended_key);
                    assert_eq!(name, appended_name);
                    assert_eq!(size, appended_size);

                    // The compressor may still hold some of the entry, so the count only ever
                    // grows, not necessarily by `size`
                    assert_ge!(*archive_bytes_written, last_bytes_written);
                    last_bytes_written = *archive_bytes_written;
                }
                other => panic!("Entry events out of order: {other:?}"),
            }
        }

        // The archive is finalized once, after the last entry, with the final size
        let finalized = events
            .iter()
            .position(|event| matches!(event, ArchiveProgressEvent::ArchiveFinalized { .. }))
            .expect("archive was never finalized");
        assert_eq!(
            1,
            self.count(ArchiveProgressEventDiscriminants::ArchiveFinalized)
        );
        assert_eq!(
            ArchiveProgressEvent::ArchiveFinalized {
                total_bytes_written: result.file_size
            },
            events[finalized]
        );
        assert_ge!(result.file_size, last_bytes_written);

        // The uploaded byte counts add up to the archive size
        let uploaded = events
            .iter()
            .filter_map(|event| match event {
                ArchiveProgressEvent::ArchiveBytesUploaded { bytes } => Some(*bytes),
                _ => None,
            })
            .sum::<u64>();
        assert_eq!(result.file_size, uploaded);

        // The very last event is the upload completing
        assert_eq!(
            Some(&ArchiveProgressEvent::ArchiveUploaded {
                bucket: result.s3_bucket.clone(),
                key: result.file_key.clone(),
                size: result.file_size,
            }),
            events.last()
        );
    }

    fn count(&self, discriminant: ArchiveProgressEventDiscriminants) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| ArchiveProgressEventDiscriminants::from(*event) == discriminant)
            .count()
    }

    fn report_event(&self, event: ArchiveProgressEvent) {
        self.events.lock().unwrap().push(event)
    }
}

impl ArchiveProgressCallback for TestArchiveProgressCallback {
    fn source_files_resolved(&self, count: usize) {
        self.report_event(ArchiveProgressEvent::SourceFilesResolved { count })
    }

    fn entry_started(&self, key: &str, name: &str, size: u64) {
        self.report_event(ArchiveProgressEvent::EntryStarted {
            key: key.to_string(),
            name: name.to_string(),
            size,
        })
    }

    fn entry_appended(&self, key: &str, name: &str, size: u64, archive_bytes_written: u64) {
        self.report_event(ArchiveProgressEvent::EntryAppended {
            key: key.to_string(),
            name: name.to_string(),
            size,
            archive_bytes_written,
        })
    }

    fn archive_finalized(&self, total_bytes_written: u64) {
        self.report_event(ArchiveProgressEvent::ArchiveFinalized {
            total_bytes_written,
        })
    }

    fn archive_bytes_uploaded(&self, bytes: u64) {
        self.report_event(ArchiveProgressEvent::ArchiveBytesUploaded { bytes })
    }

    fn archive_uploaded(&self, bucket: &str, key: &str, size: u64) {
        self.report_event(ArchiveProgressEvent::ArchiveUploaded {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
        })
    }
}
