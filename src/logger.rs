//! The monitor's own diagnostics.
//!
//! Tor's log lines are data: they arrive as `LOG` events and are kept in a
//! [`LogBuffer`](crate::logdedup::LogBuffer). This module is about the other
//! kind, what arm-rs itself reports: reconnect attempts, resolver fallbacks,
//! the periodic summary line. Those go through [`plog`] into a `tracing`
//! subscriber installed once by [`init`].
//!
//! Where output goes is chosen by the `logfile` setting:
//!
//! | `logfile` | [`LogTarget`] | Writer |
//! |-----------|---------------|--------|
//! | unset | `Stdout` | stdout, with colors |
//! | `:syslog:` | `Syslog` | datagrams to `/dev/log` or `/var/run/syslog` |
//! | any path | `File` | appended through a non-blocking writer |
//!
//! Tor has a NOTICE runlevel and tracing does not, so [`LogLevel::Notice`]
//! is emitted at `info`. `RUST_LOG` replaces the configured filter.
//!
//! ```rust,no_run
//! use arm_rs::{LogLevel, logger};
//!
//! logger::init(LogLevel::Notice, None).unwrap();
//! logger::plog(LogLevel::Notice, "Monitoring Tor 0.4.8.12");
//! ```

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

const SYSLOG_SOCKETS: [&str; 2] = ["/dev/log", "/var/run/syslog"];

/// `daemon.info` priority prefix.
const SYSLOG_PRIORITY: &str = "<30>";

static INSTALLED: OnceLock<LogTarget> = OnceLock::new();

/// Flushes buffered file output when the process exits.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where the monitor's diagnostics are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// The local syslog socket.
    Syslog,
    /// A file, opened for appending.
    File(PathBuf),
}

impl LogTarget {
    /// Interprets the `logfile` setting.
    pub fn from_setting(logfile: Option<&str>) -> Self {
        match logfile.map(str::trim) {
            None | Some("") => LogTarget::Stdout,
            Some(":syslog:") => LogTarget::Syslog,
            Some(path) => LogTarget::File(PathBuf::from(path)),
        }
    }
}

/// Filter directive for `level`, used when `RUST_LOG` is unset.
fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info | LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// Installs the global subscriber. Only the first call has any effect.
///
/// # Errors
///
/// [`Error::Io`] if the log file cannot be opened. [`Error::Config`] if no
/// syslog socket exists or another subscriber is already installed.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive(level)));
    let target = LogTarget::from_setting(logfile);

    match target {
        LogTarget::Stdout => install(filter, true, std::io::stdout)?,
        LogTarget::Syslog => {
            let socket = syslog_socket()?;
            install(filter, false, move || SyslogWriter::connect(socket))?;
        }
        LogTarget::File(ref path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            install(filter, false, writer)?;
            let _ = FILE_GUARD.set(guard);
        }
    }

    let _ = INSTALLED.set(target);
    Ok(())
}

fn install<W>(filter: EnvFilter, ansi: bool, writer: W) -> Result<()>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(ansi)
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))
}

fn syslog_socket() -> Result<&'static str> {
    SYSLOG_SOCKETS
        .into_iter()
        .find(|path| Path::new(path).exists())
        .ok_or_else(|| Error::Config("no syslog socket found".to_string()))
}

/// One syslog datagram per formatted event. Messages are dropped if the
/// socket cannot be reached.
struct SyslogWriter {
    socket: Option<UnixDatagram>,
}

impl SyslogWriter {
    fn connect(path: &str) -> Self {
        let socket = UnixDatagram::unbound()
            .and_then(|sock| sock.connect(path).map(|()| sock))
            .ok();
        Self { socket }
    }
}

fn syslog_message(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    format!(
        "{}arm-rs[{}]: {}",
        SYSLOG_PRIORITY,
        std::process::id(),
        text.trim_end()
    )
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(ref socket) = self.socket {
            socket.send(syslog_message(buf).as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Logs `message` at `level`.
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info | LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_setting() {
        assert_eq!(LogTarget::from_setting(None), LogTarget::Stdout);
        assert_eq!(LogTarget::from_setting(Some("  ")), LogTarget::Stdout);
        assert_eq!(LogTarget::from_setting(Some(":syslog:")), LogTarget::Syslog);
        assert_eq!(
            LogTarget::from_setting(Some("/var/log/arm-rs.log")),
            LogTarget::File(PathBuf::from("/var/log/arm-rs.log"))
        );
    }

    #[test]
    fn test_notice_shares_info_filter() {
        assert_eq!(directive(LogLevel::Notice), directive(LogLevel::Info));
        assert_eq!(directive(LogLevel::Debug), "debug");
        assert_eq!(directive(LogLevel::Error), "error");
    }

    #[test]
    fn test_syslog_message_format() {
        let msg = syslog_message(b" INFO Resolved 12 connections via proc\n");
        assert!(msg.starts_with("<30>arm-rs["));
        assert!(msg.ends_with("]:  INFO Resolved 12 connections via proc"));
    }

    #[test]
    fn test_unreachable_syslog_swallows_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SyslogWriter::connect(dir.path().join("missing").to_str().unwrap());
        assert!(writer.socket.is_none());
        assert_eq!(writer.write(b"dropped").unwrap(), 7);
    }
}
