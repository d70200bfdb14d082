//! Logging setup for the SPV client.
//!
//! Console output goes to stderr. File output goes to `<log_dir>/spv.log`, and the
//! log of the previous session is archived under a timestamped name on startup.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{LoggingError, LoggingResult};

const SESSION_LOG: &str = "spv.log";
const ARCHIVE_PREFIX: &str = "spv-";
const ARCHIVE_SUFFIX: &str = ".log";
const ARCHIVE_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Keeps the background log writer alive. Dropping it flushes pending lines.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Where log lines go and how verbose they are.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Explicit level. `None` defers to `RUST_LOG`, then INFO.
    pub level: Option<LevelFilter>,
    pub console: bool,
    pub file: Option<LogFileConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            console: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogFileConfig {
    pub log_dir: PathBuf,
    /// Archived session logs to keep besides the active one.
    pub max_archives: usize,
}

/// Parse a level name as accepted on the command line (`error` .. `trace`, `off`).
pub fn parse_level(name: &str) -> LoggingResult<LevelFilter> {
    LevelFilter::from_str(name)
        .map_err(|_| LoggingError::SubscriberInit(format!("unknown log level '{}'", name)))
}

/// Console-only logging at a fixed level.
pub fn init_console_logging(level: LevelFilter) -> LoggingResult<LoggingGuard> {
    init_logging(LoggingConfig {
        level: Some(level),
        console: true,
        file: None,
    })
}

/// Install the global subscriber described by `config`.
///
/// Fails if a global subscriber is already installed or the log directory
/// cannot be prepared. With no outputs enabled this is a no-op.
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _worker_guard: None,
        });
    }

    let filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, worker_guard) = match config.file {
        Some(ref file_config) => {
            let (writer, guard) = open_session_log(file_config)?;
            let layer = fmt::layer().with_ansi(false).with_target(true).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = config.console.then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _worker_guard: worker_guard,
    })
}

fn open_session_log(config: &LogFileConfig) -> LoggingResult<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir)?;
    archive_session_log(&config.log_dir)?;
    prune_archives(&config.log_dir, config.max_archives)?;

    let file = File::create(config.log_dir.join(SESSION_LOG))?;
    Ok(tracing_appender::non_blocking(file))
}

/// Move the previous session's log aside, named after its last modification time.
fn archive_session_log(log_dir: &Path) -> LoggingResult<Option<PathBuf>> {
    let session = log_dir.join(SESSION_LOG);
    if !session.exists() {
        return Ok(None);
    }

    let stamp = modified_at(&session).unwrap_or_else(Local::now).format(ARCHIVE_TIME_FORMAT).to_string();

    let target = (0..1000)
        .map(|n| match n {
            0 => log_dir.join(format!("{ARCHIVE_PREFIX}{stamp}{ARCHIVE_SUFFIX}")),
            n => log_dir.join(format!("{ARCHIVE_PREFIX}{stamp}.{n}{ARCHIVE_SUFFIX}")),
        })
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| LoggingError::RotationFailed(format!("no free archive name for {}", stamp)))?;

    fs::rename(&session, &target).map_err(|e| LoggingError::RotationFailed(e.to_string()))?;
    Ok(Some(target))
}

fn modified_at(path: &Path) -> Option<DateTime<Local>> {
    fs::metadata(path).and_then(|m| m.modified()).ok().map(DateTime::from)
}

fn is_archive(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(ARCHIVE_SUFFIX)
}

/// Delete the oldest archives until at most `keep` remain. The session log is never touched.
fn prune_archives(log_dir: &Path, keep: usize) -> LoggingResult<usize> {
    let entries = fs::read_dir(log_dir)
        .map_err(|e| LoggingError::RotationFailed(format!("cannot list {}: {}", log_dir.display(), e)))?;

    let mut archives: Vec<(Option<std::time::SystemTime>, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_archive))
        .map(|entry| (entry.metadata().and_then(|m| m.modified()).ok(), entry.path()))
        .collect();

    if archives.len() <= keep {
        return Ok(0);
    }

    archives.sort();
    let excess = archives.len() - keep;
    let mut removed = 0;
    for (_, path) in archives.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Could not remove old log {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}
