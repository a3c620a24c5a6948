//! Console and rotating-file log sinks.
//!
//! The controller can retarget logging at runtime through the
//! `ConfigureLogging` control, so the backend keeps its sinks behind a
//! mutex and swaps them in place. Severity names follow the control wire
//! protocol: NONE, ERROR, WARNING, INFO, DEBUG, VERBOSE.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::Deserialize;

use crate::error::{AgentError, AgentResult};

/// Logging configuration as carried by the `ConfigureLogging` control and
/// the `-l` command-line option.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(rename = "Device")]
    pub device: String,
    #[serde(rename = "Directory")]
    pub directory: String,
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "MaxFileSize")]
    pub max_file_size: u64,
    #[serde(rename = "MaxArchives")]
    pub max_archives: u32,
    #[serde(rename = "Level")]
    pub level: String,
    #[serde(rename = "ConsoleLevel")]
    pub console_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            device: "Console".to_string(),
            directory: String::new(),
            filename: "tincan_log".to_string(),
            max_file_size: 1 << 20,
            max_archives: 1,
            level: "WARNING".to_string(),
            console_level: "WARNING".to_string(),
        }
    }
}

fn parse_level(name: &str) -> AgentResult<LevelFilter> {
    match name.to_ascii_uppercase().as_str() {
        "NONE" => Ok(LevelFilter::Off),
        "ERROR" => Ok(LevelFilter::Error),
        "WARNING" => Ok(LevelFilter::Warn),
        "INFO" => Ok(LevelFilter::Info),
        "DEBUG" => Ok(LevelFilter::Debug),
        "VERBOSE" => Ok(LevelFilter::Trace),
        other => Err(AgentError::config(format!(
            "unrecognized log level: {}",
            other
        ))),
    }
}

struct FileSink {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    max_archives: u32,
    level: LevelFilter,
}

impl FileSink {
    fn open(cfg: &LogConfig, level: LevelFilter) -> AgentResult<Self> {
        let dir = PathBuf::from(&cfg.directory);
        if !cfg.directory.is_empty() {
            fs::create_dir_all(&dir)?;
        }
        let path = dir.join(&cfg.filename);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            file,
            written,
            max_size: cfg.max_file_size.max(1),
            max_archives: cfg.max_archives,
            level,
        })
    }

    fn write_line(&mut self, line: &str) {
        if self.written + line.len() as u64 > self.max_size {
            self.rotate();
        }
        if self.file.write_all(line.as_bytes()).is_ok() {
            self.written += line.len() as u64;
        }
    }

    /// Shift archives `path.N` up by one, dropping the oldest, then reopen.
    fn rotate(&mut self) {
        let archive = |n: u32| {
            let mut p = self.path.clone().into_os_string();
            p.push(format!(".{}", n));
            PathBuf::from(p)
        };
        if self.max_archives == 0 {
            let _ = fs::remove_file(&self.path);
        } else {
            let _ = fs::remove_file(archive(self.max_archives));
            for n in (1..self.max_archives).rev() {
                let _ = fs::rename(archive(n), archive(n + 1));
            }
            let _ = fs::rename(&self.path, archive(1));
        }
        if let Ok(file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            self.file = file;
            self.written = 0;
        }
    }
}

#[derive(Default)]
struct Sinks {
    console_level: Option<LevelFilter>,
    file: Option<FileSink>,
}

/// The process-wide logger. Installed once; reconfigured in place.
pub struct AgentLogger {
    sinks: Mutex<Sinks>,
}

static LOGGER: OnceLock<AgentLogger> = OnceLock::new();

impl AgentLogger {
    /// Install the logger with a console sink at the given level. Must be
    /// called once, before any logging.
    pub fn init(console_level: LevelFilter) {
        let logger = LOGGER.get_or_init(|| AgentLogger {
            sinks: Mutex::new(Sinks {
                console_level: Some(console_level),
                file: None,
            }),
        });
        if log::set_logger(logger).is_ok() {
            log::set_max_level(console_level);
        }
    }

    /// Retarget the sinks per the supplied configuration.
    pub fn configure(cfg: &LogConfig) -> AgentResult<()> {
        let logger = LOGGER
            .get()
            .ok_or_else(|| AgentError::state("logger not installed"))?;
        let file_level = parse_level(&cfg.level)?;
        let console_level = parse_level(&cfg.console_level)?;
        let device = cfg.device.to_ascii_lowercase();
        let want_file = matches!(device.as_str(), "file" | "all");
        let want_console = matches!(device.as_str(), "console" | "all");

        let file = if want_file && file_level != LevelFilter::Off {
            Some(FileSink::open(cfg, file_level)?)
        } else {
            None
        };

        let mut sinks = logger.sinks.lock().expect("log sinks poisoned");
        sinks.console_level = want_console.then_some(console_level);
        sinks.file = file;
        let max = sinks
            .console_level
            .unwrap_or(LevelFilter::Off)
            .max(sinks.file.as_ref().map(|f| f.level).unwrap_or(LevelFilter::Off));
        log::set_max_level(max);
        Ok(())
    }
}

fn format_record(record: &Record) -> String {
    format!(
        "{} {:5} [{}] {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

impl Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record);
        let mut sinks = self.sinks.lock().expect("log sinks poisoned");
        if let Some(level) = sinks.console_level {
            if record.level() <= level {
                if record.level() <= Level::Warn {
                    let _ = std::io::stderr().write_all(line.as_bytes());
                } else {
                    let _ = std::io::stdout().write_all(line.as_bytes());
                }
            }
        }
        if let Some(file) = sinks.file.as_mut() {
            if record.level() <= file.level {
                file.write_line(&line);
            }
        }
    }

    fn flush(&self) {
        let mut sinks = self.sinks.lock().expect("log sinks poisoned");
        if let Some(file) = sinks.file.as_mut() {
            let _ = file.file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_names() {
        assert_eq!(parse_level("VERBOSE").unwrap(), LevelFilter::Trace);
        assert_eq!(parse_level("warning").unwrap(), LevelFilter::Warn);
        assert_eq!(parse_level("NONE").unwrap(), LevelFilter::Off);
        assert!(parse_level("LOUD").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let cfg: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.device, "Console");
        assert_eq!(cfg.console_level, "WARNING");
    }

    #[test]
    fn test_file_sink_rotation() {
        let dir = std::env::temp_dir().join(format!("tincan-log-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let cfg = LogConfig {
            device: "File".into(),
            directory: dir.to_string_lossy().into_owned(),
            filename: "agent.log".into(),
            max_file_size: 64,
            max_archives: 2,
            level: "INFO".into(),
            console_level: "NONE".into(),
        };
        let mut sink = FileSink::open(&cfg, LevelFilter::Info).unwrap();
        for i in 0..20 {
            sink.write_line(&format!("log entry number {}\n", i));
        }
        assert!(dir.join("agent.log").exists());
        assert!(dir.join("agent.log.1").exists());
        assert!(!dir.join("agent.log.3").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
