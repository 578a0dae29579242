//! Logging setup.

use std::path::PathBuf;

use meshkube_shared::errors::{MeshkubeError, MeshkubeResult};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Where and how verbosely a run logs.
#[derive(Clone, Debug, Default)]
pub struct LoggingOptions {
    /// `EnvFilter` directives. `RUST_LOG` wins when set; falls back to "info".
    pub filter: Option<String>,

    /// Write daily-rotated `meshkube.log` here instead of stderr.
    pub log_dir: Option<PathBuf>,
}

fn env_filter(directives: Option<&str>) -> MeshkubeResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(directives.unwrap_or("info"))
        .map_err(|e| MeshkubeError::Config(format!("invalid log filter: {e}")))
}

/// Install the global subscriber.
///
/// Returns the background writer's guard when logging to a file; it must
/// be kept alive for the duration of the run. Calling this twice is
/// harmless: the second subscriber is dropped.
pub fn init_logging(options: &LoggingOptions) -> MeshkubeResult<Option<WorkerGuard>> {
    let filter = env_filter(options.filter.as_deref())?;

    match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                MeshkubeError::Config(format!("cannot create log dir {}: {e}", dir.display()))
            })?;
            let appender = tracing_appender::rolling::daily(dir, "meshkube.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            register_to_tracing(non_blocking, filter);
            Ok(Some(guard))
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .try_init();
            Ok(None)
        }
    }
}

fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_is_a_config_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let err = env_filter(Some("meshkube=loud")).unwrap_err();
        assert!(matches!(err, MeshkubeError::Config(_)));
    }

    #[test]
    fn file_logging_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let guard = init_logging(&LoggingOptions {
            filter: Some("debug".into()),
            log_dir: Some(log_dir.clone()),
        })
        .unwrap();
        assert!(guard.is_some());
        assert!(log_dir.is_dir());
    }
}
