//! Log sink selection.
//!
//! Two sinks: `env_logger` to stdout for interactive use, or an append-only
//! size-rotated file (`node.log`) for daemon use. Both sit behind the `log`
//! facade; modules never know which sink is installed.

use anyhow::{Context, Result};
use log::{LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Which sink to install.
pub enum LogSink {
    Stdout,
    /// Rotating file under the home directory with a byte cap.
    File { path: PathBuf, max_size: u64 },
}

/// Install the global logger. Safe to call once per process; a second call
/// reports the underlying `set_logger` error.
pub fn init(sink: LogSink, level: LevelFilter) -> Result<()> {
    match sink {
        LogSink::Stdout => {
            env_logger::Builder::new().filter_level(level).try_init()?;
            Ok(())
        }
        LogSink::File { path, max_size } => {
            let logger = RotatingFileLogger::open(&path, max_size)
                .with_context(|| format!("failed to open log file {:?}", path))?;
            log::set_boxed_logger(Box::new(logger))?;
            log::set_max_level(level);
            Ok(())
        }
    }
}

struct RotatingFileLogger {
    path: PathBuf,
    max_size: u64,
    state: Mutex<LogState>,
}

struct LogState {
    file: File,
    written: u64,
}

impl RotatingFileLogger {
    fn open(path: &Path, max_size: u64) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            max_size,
            state: Mutex::new(LogState { file, written }),
        })
    }

    fn rotate(&self, state: &mut LogState) -> std::io::Result<()> {
        let old = self.path.with_extension("log.old");
        let _ = std::fs::rename(&self.path, &old);
        state.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        state.written = 0;
        Ok(())
    }
}

impl log::Log for RotatingFileLogger {
    // Level filtering happens in the facade via set_max_level.
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let line = format!(
            "{} [{}] {} - {}\n",
            crate::time::now_ms(),
            record.level(),
            record.target(),
            record.args()
        );
        let mut state = self.state.lock().unwrap();
        if state.written + line.len() as u64 > self.max_size {
            let _ = self.rotate(&mut state);
        }
        if state.file.write_all(line.as_bytes()).is_ok() {
            state.written += line.len() as u64;
        }
    }

    fn flush(&self) {
        let _ = self.state.lock().unwrap().file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    #[test]
    fn file_logger_rotates_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let logger = RotatingFileLogger::open(&path, 256).unwrap();

        for i in 0..32 {
            logger.log(
                &Record::builder()
                    .args(format_args!("line {}", i))
                    .level(log::Level::Info)
                    .target("test")
                    .build(),
            );
        }
        logger.flush();

        let rotated = path.with_extension("log.old");
        assert!(rotated.exists(), "rotation should have produced node.log.old");
        assert!(std::fs::metadata(&path).unwrap().len() <= 256 + 128);
    }
}
