//! # Logging Setup
//!
//! Installs a `fern` dispatcher that writes to stdout and to a timestamped
//! file, keeping only the newest log file of the application around.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Maps a level name to a filter. Unknown names fall back to `Info`.
pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Installs the global logger for `app_name`.
///
/// Returns the path of the log file being written.
pub fn setup_logging(app_name: &str, log_dir: &Path, log_level: &str) -> Result<PathBuf> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    cleanup_old_logs(app_name, log_dir)?;

    let log_file_name = format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        // Request logging from the HTTP stack is noise at info.
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .level_for("tungstenite", log::LevelFilter::Warn)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

/// Deletes all but the most recent `<app_name>_*.log` file in `log_dir`.
pub fn cleanup_old_logs(app_name: &str, log_dir: &Path) -> Result<()> {
    let prefix = format!("{}_", app_name);
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .collect();

    // Newest first; names embed the start time so they sort chronologically.
    entries.sort_by_key(|e| std::cmp::Reverse(e.file_name()));

    for entry in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(entry.path()) {
            eprintln!("Failed to delete old log file {:?}: {}", entry.path(), e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("warn"), log::LevelFilter::Warn);
        assert_eq!(parse_level("fatal"), log::LevelFilter::Info);
    }

    #[test]
    fn test_cleanup_keeps_newest_file_of_app_only() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        fs::write(p.join("portdash_2024-01-01_00-00-00.log"), "old").unwrap();
        fs::write(p.join("portdash_2024-06-01_00-00-00.log"), "new").unwrap();
        fs::write(p.join("other_2023-01-01_00-00-00.log"), "keep").unwrap();

        cleanup_old_logs("portdash", p).unwrap();

        assert!(!p.join("portdash_2024-01-01_00-00-00.log").exists());
        assert!(p.join("portdash_2024-06-01_00-00-00.log").exists());
        assert!(p.join("other_2023-01-01_00-00-00.log").exists());
    }
}
