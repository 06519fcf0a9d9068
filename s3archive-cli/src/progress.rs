//! Progress bars for the archive operation
use s3archive::{ArchiveRequest, ArchiveResult, Archiver, Result};
use std::time::Instant;

/// Run the archive operation with progress bars, aborting it cleanly on Ctrl-C
pub(crate) async fn run_archive(
    globals: &super::Globals,
    archiver: &Archiver,
    request: ArchiveRequest,
) -> Result<ArchiveResult> {
    let progress = ArchiveProgressReport::new(hide_progress(globals));

    let abort = async {
        // If the signal handler can't be installed, carry on without abort support
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await
        }
    };

    archiver
        .archive_with_progress(request, abort, progress)
        .await
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// Renders progress updates from the lib crate.
///
/// One bar counts the entries written to the archive.  The size of the archive isn't known until
/// it's finished, so the upload is a spinner that just counts bytes.
struct ArchiveProgressReport {
    multi: indicatif::MultiProgress,
    entries: indicatif::ProgressBar,
    uploaded: indicatif::ProgressBar,
    started: Instant,
}

impl ArchiveProgressReport {
    fn new(hide_progress: bool) -> Self {
        let multi = if !hide_progress {
            indicatif::MultiProgress::new()
        } else {
            indicatif::MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
        };

        let entries = multi.add(indicatif::ProgressBar::new(0));
        entries.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix:>16}: {msg:<40!} [{bar:20.cyan/blue}] {pos}/{len}",
            )
            .expect("BUG: invalid progress template")
            .progress_chars("#>-"),
        );
        entries.set_prefix("Entries");
        entries.set_message("Listing objects...");

        let uploaded = multi.add(indicatif::ProgressBar::new_spinner());
        uploaded.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix:>16}: {msg:<40!} {bytes} ({bytes_per_sec})",
            )
            .expect("BUG: invalid progress template"),
        );
        uploaded.set_prefix("Uploaded");
        uploaded.set_message("Waiting for data");

        Self {
            multi,
            entries,
            uploaded,
            started: Instant::now(),
        }
    }
}

impl s3archive::ArchiveProgressCallback for ArchiveProgressReport {
    fn source_files_resolved(&self, count: usize) {
        self.entries.set_length(count as u64);
        self.entries.set_message("Starting...");
    }

    fn entry_started(&self, _key: &str, name: &str, _size: u64) {
        self.entries.set_message(name.to_string());
    }

    fn entry_appended(&self, _key: &str, _name: &str, _size: u64, _archive_bytes_written: u64) {
        self.entries.inc(1);
    }

    fn archive_finalized(&self, total_bytes_written: u64) {
        self.entries.finish_with_message(format!(
            "Archive written ({})",
            indicatif::BinaryBytes(total_bytes_written)
        ));
    }

    fn archive_bytes_uploaded(&self, bytes: u64) {
        self.uploaded.inc(bytes);
        self.uploaded.set_message("Upload in progress");
    }

    fn archive_uploaded(&self, bucket: &str, key: &str, size: u64) {
        let duration = self.started.elapsed();
        let bytes_per_second = (size as f64 / duration.as_secs_f64().max(f64::EPSILON)) as u64;

        self.uploaded.finish_and_clear();
        let _ = self.multi.println(format!(
            "Uploaded s3://{bucket}/{key} ({} in {}, {}/s)",
            indicatif::BinaryBytes(size),
            indicatif::HumanDuration(duration),
            indicatif::BinaryBytes(bytes_per_second)
        ));
    }
}
