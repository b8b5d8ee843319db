use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::checkpoint::unix_now;
use crate::config::LoggingConfig;

/// Installs the global subscriber: console output plus, when `log_dir` is
/// set, a plain-text copy in `<log_dir>/run_<unix_secs>_<label>.log`.
///
/// `RUST_LOG` takes precedence over the configured filter. Returns the log
/// file path, if any.
///
/// # Errors
///
/// Fails if the log file cannot be created or a global subscriber is
/// already installed.
pub fn init(
    config: &LoggingConfig,
    run_label: &str,
) -> Result<Option<PathBuf>, Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let console = fmt::layer().with_target(false);

    let Some(dir) = config.log_dir.as_deref() else {
        tracing_subscriber::registry().with(env_filter).with(console).try_init()?;
        return Ok(None);
    };

    let path = log_file_path(dir, unix_now(), run_label);
    std::fs::create_dir_all(dir)?;
    let file = File::create(&path)?;
    let file_layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()?;
    Ok(Some(path))
}

fn log_file_path(dir: &Path, started_at: i64, run_label: &str) -> PathBuf {
    let label: String = run_label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("run_{}_{}.log", started_at, label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name() {
        let path = log_file_path(Path::new("logs"), 1_700_000_000, "datasets page 3");
        assert_eq!(path, PathBuf::from("logs/run_1700000000_datasets_page_3.log"));
    }
}
