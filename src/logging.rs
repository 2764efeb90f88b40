//! `tracing` subscriber setup.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

/// Env var checked before `RUST_LOG`.
pub const LOG_ENV: &str = "STUDIO_LOG";

const LOG_FILE_PREFIX: &str = "studio.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "forge_studio=debug,info"
    } else {
        "forge_studio=info,warn"
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber: stderr output (human or JSON), plus a
/// daily-rotated file under `file_dir` when given. Keep the returned guard
/// alive for the life of the process or buffered file lines are lost.
///
/// A second call is a no-op.
pub fn init(verbose: bool, json: bool, file_dir: Option<&Path>) -> Option<WorkerGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    });

    let guard = file_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: cannot create log directory {}: {}", dir.display(), e);
            return None;
        }
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(if json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        });
        Some(guard)
    });

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(verbose))
        .try_init();
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_parses() {
        for verbose in [false, true] {
            assert!(EnvFilter::try_new(default_directive(verbose)).is_ok());
        }
    }

    #[test]
    fn test_init_twice_is_harmless_and_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let guard = init(false, true, Some(&logs));
        assert!(guard.is_some());
        assert!(logs.is_dir());
        let _ = init(true, false, None);
    }
}
