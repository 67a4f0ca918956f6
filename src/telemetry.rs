//! Logging setup for the `stride` binary.
//!
//! Events go to stderr (so `stride status --json` and `--ui json` keep a clean
//! stdout) and, once the project is initialized, to a daily rolling file in
//! `.stride/logs/`.
//!
//! The filter is read from `STRIDE_LOG`, then `RUST_LOG`, and defaults to
//! `stride=info` (`stride=debug` with `--verbose`).

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const LOG_ENV: &str = "STRIDE_LOG";
const LOG_FILE_PREFIX: &str = "stride.log";

#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryOptions {
    pub verbose: bool,
    pub json: bool,
}

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "stride=debug" } else { "stride=info" };
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when a log directory was given; dropping
/// it flushes buffered lines, so hold it until the process exits. A second
/// call is a no-op.
pub fn init(log_dir: Option<&Path>, options: TelemetryOptions) -> Option<WorkerGuard> {
    let stderr_layer = if options.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(options.verbose))
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter(options.verbose))
            .boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) if dir.is_dir() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(env_filter(true))
                .boxed();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_without_log_dir_has_no_guard() {
        assert!(init(None, TelemetryOptions::default()).is_none());
    }

    #[test]
    fn test_missing_log_dir_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(init(Some(&missing), TelemetryOptions::default()).is_none());
    }
}
