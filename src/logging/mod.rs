use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;

const LOG_FILE: &str = "varsync.log";
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024; // 10 MB

/// Set to any value to log everything, to stderr as well as the file.
pub const DEBUG_ENV: &str = "VARSYNC_DEBUG";

pub fn debug_mode() -> bool {
    std::env::var_os(DEBUG_ENV).is_some()
}

pub fn log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE)
}

// Rotate logs if they get too large
pub fn rotate_if_needed(log_dir: &Path) -> io::Result<bool> {
    let path = log_path(log_dir);
    match fs::metadata(&path) {
        Ok(metadata) if metadata.len() > MAX_LOG_SIZE => {
            fs::rename(&path, path.with_extension("log.old"))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// File layer plus a stderr layer for warnings and errors.
///
/// In debug mode both layers take every level.
pub fn build_subscriber(log_dir: &Path, debug: bool) -> io::Result<impl Subscriber + Send + Sync> {
    fs::create_dir_all(log_dir)?;
    rotate_if_needed(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path(log_dir))?;

    let (file_level, stderr_level) = if debug {
        (LevelFilter::DEBUG, LevelFilter::DEBUG)
    } else {
        (LevelFilter::INFO, LevelFilter::WARN)
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_filter(file_level);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(stderr_level);

    Ok(tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer))
}

/// Installs the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init(log_dir: &Path) -> io::Result<()> {
    let subscriber = build_subscriber(log_dir, debug_mode())?;
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Global logger already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_logging() {
        let temp_dir = TempDir::new().unwrap();
        let subscriber = build_subscriber(temp_dir.path(), false).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("Hidden message");
            tracing::info!("Test message");
            tracing::error!("Test error");
        });

        let log_content = fs::read_to_string(log_path(temp_dir.path())).unwrap();
        assert!(log_content.contains("Test message"));
        assert!(log_content.contains("Test error"));
        assert!(!log_content.contains("Hidden message"));
    }

    #[test]
    fn test_debug_mode_keeps_debug_lines() {
        let temp_dir = TempDir::new().unwrap();
        let subscriber = build_subscriber(temp_dir.path(), true).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!("Scan details");
        });

        let log_content = fs::read_to_string(log_path(temp_dir.path())).unwrap();
        assert!(log_content.contains("Scan details"));
    }

    #[test]
    fn test_rotation() {
        let temp_dir = TempDir::new().unwrap();
        assert!(!rotate_if_needed(temp_dir.path()).unwrap());

        let big = vec![b'x'; (MAX_LOG_SIZE + 1) as usize];
        fs::write(log_path(temp_dir.path()), big).unwrap();
        assert!(rotate_if_needed(temp_dir.path()).unwrap());
        assert!(temp_dir.path().join("varsync.log.old").exists());
        assert!(!log_path(temp_dir.path()).exists());
    }
}
