//! Logging setup and runtime log control.
//!
//! Tracing is initialized once at startup with a reloadable level filter
//! and a target-switching writer, so `set loglevel`, `set logtarget` and
//! `flushlogs` work without restarting. `SYSLOG` and `SYSTEMD-JOURNAL`
//! are accepted for protocol compatibility and mapped onto stderr; the
//! platform sinks themselves are not shipped.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::warn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use jail_proto::LogLevel;

use crate::config::LogFormat;
use crate::error::{Error, Result};

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// A file, reopened after `flushlogs`.
    File(PathBuf),
}

impl LogTarget {
    /// Parse a protocol log target. Formatting options in brackets
    /// (`STDOUT[datetime=off]`) are accepted and ignored.
    pub fn parse(token: &str) -> LogTarget {
        let bare = token.split('[').next().unwrap_or(token);
        match bare.to_ascii_uppercase().as_str() {
            "STDOUT" => LogTarget::Stdout,
            "STDERR" => LogTarget::Stderr,
            "SYSLOG" | "SYSTEMD-JOURNAL" => {
                warn!(target = %bare, "Log target not shipped on this platform, using STDERR");
                LogTarget::Stderr
            }
            _ => LogTarget::File(PathBuf::from(token)),
        }
    }

    /// The protocol name of the target.
    pub fn name(&self) -> String {
        match self {
            LogTarget::Stdout => "STDOUT".to_string(),
            LogTarget::Stderr => "STDERR".to_string(),
            LogTarget::File(path) => path.display().to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct WriterState {
    target: RwLock<Option<LogTarget>>,
    file: Mutex<Option<File>>,
}

/// `MakeWriter` that consults the current target on every write batch.
#[derive(Clone)]
struct TargetWriter {
    state: Arc<WriterState>,
}

enum TargetWriterKind {
    Stdout(std::io::Stdout),
    Stderr(std::io::Stderr),
    File(Arc<WriterState>),
}

impl Write for TargetWriterKind {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            TargetWriterKind::Stdout(out) => out.write(buf),
            TargetWriterKind::Stderr(err) => err.write(buf),
            TargetWriterKind::File(state) => {
                let path = match &*state.target.read() {
                    Some(LogTarget::File(path)) => path.clone(),
                    _ => return Ok(buf.len()),
                };
                let mut file = state.file.lock();
                if file.is_none() {
                    *file = OpenOptions::new().create(true).append(true).open(path).ok();
                }
                match file.as_mut() {
                    Some(file) => file.write(buf),
                    // a broken target must never take the daemon down
                    None => Ok(buf.len()),
                }
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            TargetWriterKind::Stdout(out) => out.flush(),
            TargetWriterKind::Stderr(err) => err.flush(),
            TargetWriterKind::File(state) => {
                if let Some(file) = state.file.lock().as_mut() {
                    file.flush()?;
                }
                Ok(())
            }
        }
    }
}

impl<'a> MakeWriter<'a> for TargetWriter {
    type Writer = TargetWriterKind;

    fn make_writer(&'a self) -> Self::Writer {
        match &*self.state.target.read() {
            Some(LogTarget::Stdout) => TargetWriterKind::Stdout(std::io::stdout()),
            None | Some(LogTarget::Stderr) => TargetWriterKind::Stderr(std::io::stderr()),
            Some(LogTarget::File(_)) => TargetWriterKind::File(self.state.clone()),
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle for runtime log control.
pub struct Telemetry {
    filter: Option<FilterHandle>,
    writer_state: Arc<WriterState>,
    level: RwLock<LogLevel>,
    syslog_socket: RwLock<String>,
}

impl Telemetry {
    /// Install the global subscriber; call once from `main`.
    pub fn init(level: LogLevel, target: LogTarget, format: LogFormat) -> Arc<Telemetry> {
        let writer_state = Arc::new(WriterState::default());
        *writer_state.target.write() = Some(target);

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.tracing_directive()));
        let (filter_layer, handle) = reload::Layer::new(env_filter);

        let writer = TargetWriter {
            state: writer_state.clone(),
        };
        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter_layer)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_target(true)
                            .json()
                            .with_writer(writer),
                    )
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(filter_layer)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_target(true)
                            .with_writer(writer),
                    )
                    .init();
            }
        }

        Arc::new(Telemetry {
            filter: Some(handle),
            writer_state,
            level: RwLock::new(level),
            syslog_socket: RwLock::new("auto".to_string()),
        })
    }

    /// A disconnected handle (tests): state is tracked, tracing untouched.
    pub fn disabled() -> Arc<Telemetry> {
        Arc::new(Telemetry {
            filter: None,
            writer_state: Arc::new(WriterState::default()),
            level: RwLock::new(LogLevel::Info),
            syslog_socket: RwLock::new("auto".to_string()),
        })
    }

    /// The current protocol log level.
    pub fn level(&self) -> LogLevel {
        *self.level.read()
    }

    /// Change the log level at runtime.
    pub fn set_level(&self, level: LogLevel) -> Result<()> {
        if let Some(handle) = &self.filter {
            handle
                .reload(EnvFilter::new(level.tracing_directive()))
                .map_err(|e| Error::InvalidArgument(format!("failed to set log level: {}", e)))?;
        }
        *self.level.write() = level;
        Ok(())
    }

    /// The current log target.
    pub fn target(&self) -> LogTarget {
        self.writer_state
            .target
            .read()
            .clone()
            .unwrap_or(LogTarget::Stderr)
    }

    /// Switch the log target at runtime.
    pub fn set_target(&self, target: LogTarget) {
        *self.writer_state.file.lock() = None;
        *self.writer_state.target.write() = Some(target);
    }

    /// Close the current log file so the next write reopens it.
    ///
    /// Returns the reply text expected by clients.
    pub fn flush_logs(&self) -> &'static str {
        let had_file = self.writer_state.file.lock().take().is_some()
            || matches!(self.target(), LogTarget::File(_));
        if had_file {
            "rolled over"
        } else {
            "flushed"
        }
    }

    /// The configured syslog socket path (or `auto`).
    pub fn syslog_socket(&self) -> String {
        self.syslog_socket.read().clone()
    }

    /// Store the syslog socket path; only used when a syslog target is
    /// configured, which this platform maps to stderr.
    pub fn set_syslog_socket(&self, value: &str) {
        *self.syslog_socket.write() = value.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parsing() {
        assert_eq!(LogTarget::parse("STDOUT"), LogTarget::Stdout);
        assert_eq!(LogTarget::parse("stderr"), LogTarget::Stderr);
        assert_eq!(LogTarget::parse("STDERR[datetime=off,padding=off]"), LogTarget::Stderr);
        assert_eq!(LogTarget::parse("STDOUT[format=simple]"), LogTarget::Stdout);
        assert_eq!(
            LogTarget::parse("/var/log/jaild.log"),
            LogTarget::File(PathBuf::from("/var/log/jaild.log"))
        );
    }

    #[test]
    fn test_disabled_handle_tracks_state() {
        let telemetry = Telemetry::disabled();
        telemetry.set_level(LogLevel::Debug).unwrap();
        assert_eq!(telemetry.level(), LogLevel::Debug);

        telemetry.set_target(LogTarget::Stdout);
        assert_eq!(telemetry.target(), LogTarget::Stdout);
        assert_eq!(telemetry.flush_logs(), "flushed");

        telemetry.set_target(LogTarget::File(PathBuf::from("/tmp/x.log")));
        assert_eq!(telemetry.flush_logs(), "rolled over");
    }
}
