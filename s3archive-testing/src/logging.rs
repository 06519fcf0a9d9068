//! Per-test log capture.
//!
//! `cargo test` runs tests in parallel, and the default global `tracing` subscriber would mix the
//! log output of all of them.  Instead each test gets its own subscriber and its own tokio runtime
//! whose worker threads all log to that subscriber, and the captured output is printed when the
//! test finishes.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Used when `RUST_LOG` isn't set.  The AWS SDK and the HTTP stack under it are very chatty at
/// `debug`.
const DEFAULT_FILTER: &str =
    "aws_smithy_runtime=info,aws_config=info,hyper=info,h2=warn,rustls=info,s3archive=trace,debug";

/// How long to let background tasks wind down after the test future completes
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

std::thread_local! {
    /// Keeps the test's dispatcher the default on each runtime worker thread
    static WORKER_DISPATCH: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
}

/// Buffer that collects every formatted log line of one test
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Take everything logged so far
    fn drain(&self) -> String {
        let bytes = std::mem::take(&mut *self.0.lock().unwrap());

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

struct CapturedLogsWriter<'a>(&'a CapturedLogs);

impl io::Write for CapturedLogsWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 .0.lock().unwrap().extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogsWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        CapturedLogsWriter(self)
    }
}

/// Run a test with logging enabled.
///
/// This takes the place of `#[tokio::test]`: it builds a multi-threaded runtime for this test
/// alone, with the test's `tracing` dispatcher installed on every worker thread so log events
/// from spawned tasks and blocking threads are captured too.  The log output is printed after the
/// test completes, including when it panics, so it shows up in the output of failed tests only.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let logs = CapturedLogs::default();
    let dispatch = make_dispatch(logs.clone())?;

    let outcome = tracing::dispatcher::with_default(&dispatch, || {
        let runtime = make_runtime(&dispatch)?;

        // Test futures aren't required to be unwind safe; the runtime is discarded after a panic
        // anyway
        Result::<_>::Ok(std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

            result
        })))
    })?;

    println!("Log events from this test: \n{}", logs.drain());

    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn make_dispatch(logs: CapturedLogs) -> Result<tracing::Dispatch> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };

    // Thread IDs matter here: the encoder runs on a blocking thread, everything else on workers
    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(logs);

    Ok(tracing::Dispatch::new(
        tracing_subscriber::registry().with(filter).with(format),
    ))
}

fn make_runtime(dispatch: &tracing::Dispatch) -> Result<tokio::runtime::Runtime> {
    let dispatch = dispatch.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&dispatch);
            WORKER_DISPATCH.with(|cell| *cell.borrow_mut() = Some(guard));
        })
        .on_thread_stop(|| {
            WORKER_DISPATCH.with(|cell| drop(cell.borrow_mut().take()));
        })
        .build()?;

    Ok(runtime)
}
