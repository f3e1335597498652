//! Configuration management for arm-rs.
//!
//! Configuration is parsed from a TOML file, command-line arguments and
//! environment variables, applied in order: defaults → config file →
//! command-line arguments, with later sources overriding earlier ones.
//!
//! # Configuration Sources
//!
//! | Source | Priority | Description |
//! |--------|----------|-------------|
//! | Defaults | Lowest | Built-in defaults |
//! | Config File | Medium | TOML file (`--config` or `ARM_CONFIG`) |
//! | CLI Arguments | Highest | Command-line flags override all |
//!
//! # Example Configuration File
//!
//! ```toml
//! # Connection settings
//! control_ip = "127.0.0.1"
//! control_port = 9051
//! # control_socket = "/run/tor/control"
//! # control_pass = "my_password"
//! # cookie_path = "/var/run/tor/control.authcookie"
//!
//! loglevel = "notice"
//! # logfile = "/var/log/arm-rs.log"
//!
//! [session]
//! request_timeout_secs = 10
//! reconnect_min_secs = 5
//! listener_queue_size = 256
//! # retry_limit = 10
//!
//! [resolver]
//! connections_min_rate = 5.0
//! process_name = "tor"
//! alternate_names = ["tor.real", "tor.exe"]
//! # resolver_override = "ss"
//! name_lookups = false
//!
//! [logs]
//! buffer_limit = 1000
//! dedup_budget_ms = 50
//! runlevel = "notice"
//!
//! [status]
//! ps_rate_secs = 5
//! summary_interval_secs = 10
//! ```
//!
//! # What This Module Does NOT Do
//!
//! - **Tor configuration**: `torrc` is never read or written; Tor's settings are
//!   queried over the control port
//! - **Config file watching**: Changes require a restart

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::sysconn::ResolverCommand;

/// Log level for arm-rs output and for the Tor log runlevel filter.
///
/// From most to least verbose:
/// [`Debug`](LogLevel::Debug) > [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error)
///
/// # Example
///
/// ```rust
/// use arm_rs::LogLevel;
///
/// let level: LogLevel = "warn".parse().unwrap();
/// assert!(LogLevel::Notice < level);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Control session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Seconds to wait for a reply before failing a request with `Timeout`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Minimum seconds between reconnect attempts.
    #[serde(default = "default_reconnect_min_secs")]
    pub reconnect_min_secs: u64,
    /// Capacity of each event listener's queue.
    #[serde(default = "default_listener_queue_size")]
    pub listener_queue_size: usize,
    /// Maximum reconnection attempts. None for infinite.
    #[serde(default)]
    pub retry_limit: Option<u32>,
}

fn default_request_timeout_secs() -> u64 {
    10
}
fn default_reconnect_min_secs() -> u64 {
    5
}
fn default_listener_queue_size() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_min_secs: default_reconnect_min_secs(),
            listener_queue_size: default_listener_queue_size(),
            retry_limit: None,
        }
    }
}

impl SessionConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Connection resolver settings.
///
/// # Fields
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `connections_min_rate` | 5.0 | Minimum seconds between lookups |
/// | `process_name` | `tor` | Process whose sockets are listed |
/// | `process_pid` | None | Pid, queried from Tor when unset |
/// | `alternate_names` | `tor.real`, `tor.exe` | Names tried when the primary lookup fails |
/// | `resolver_override` | None | Force one lookup command |
/// | `name_lookups` | false | Allow reverse DNS for eligible connections |
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolverConfig {
    /// Minimum seconds between connection lookups.
    #[serde(default = "default_connections_min_rate")]
    pub connections_min_rate: f64,
    /// Name of the monitored process.
    #[serde(default = "default_process_name")]
    pub process_name: String,
    /// Pid of the monitored process.
    #[serde(default)]
    pub process_pid: Option<u32>,
    /// Alternate process names for the fallback lookup.
    #[serde(default = "default_alternate_names")]
    pub alternate_names: Vec<String>,
    /// Lookup command to use instead of automatic selection.
    #[serde(default)]
    pub resolver_override: Option<String>,
    /// Allow hostname lookups for connections that pass the naming filter.
    #[serde(default)]
    pub name_lookups: bool,
}

fn default_connections_min_rate() -> f64 {
    5.0
}
fn default_process_name() -> String {
    "tor".to_string()
}
fn default_alternate_names() -> Vec<String> {
    vec!["tor.real".to_string(), "tor.exe".to_string()]
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            connections_min_rate: default_connections_min_rate(),
            process_name: default_process_name(),
            process_pid: None,
            alternate_names: default_alternate_names(),
            resolver_override: None,
            name_lookups: false,
        }
    }
}

/// Tor log buffering and deduplication settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogsConfig {
    /// Maximum number of Tor log entries kept.
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit: usize,
    /// Time budget for one deduplication pass, in milliseconds.
    #[serde(default = "default_dedup_budget_ms")]
    pub dedup_budget_ms: u64,
    /// Minimum Tor runlevel to subscribe to.
    #[serde(default)]
    pub runlevel: LogLevel,
}

fn default_buffer_limit() -> usize {
    1000
}
fn default_dedup_budget_ms() -> u64 {
    50
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            buffer_limit: default_buffer_limit(),
            dedup_budget_ms: default_dedup_budget_ms(),
            runlevel: LogLevel::Notice,
        }
    }
}

impl LogsConfig {
    /// Deduplication budget as a [`Duration`].
    pub fn dedup_budget(&self) -> Duration {
        Duration::from_millis(self.dedup_budget_ms)
    }
}

/// Relay status polling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    /// Seconds between `ps` samples of the Tor process.
    #[serde(default = "default_ps_rate_secs")]
    pub ps_rate_secs: u64,
    /// Seconds between summary log lines in headless mode.
    #[serde(default = "default_summary_interval_secs")]
    pub summary_interval_secs: u64,
}

fn default_ps_rate_secs() -> u64 {
    5
}
fn default_summary_interval_secs() -> u64 {
    10
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            ps_rate_secs: default_ps_rate_secs(),
            summary_interval_secs: default_summary_interval_secs(),
        }
    }
}

/// Main configuration struct for arm-rs.
///
/// # Example
///
/// ```rust
/// use arm_rs::{Config, LogLevel};
///
/// let mut config = Config::default();
/// config.control_port = Some(9051);
/// config.loglevel = LogLevel::Debug;
/// config.validate().expect("valid configuration");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// IP address of the Tor control port.
    #[serde(default = "default_control_ip")]
    pub control_ip: String,
    /// Port number of the Tor control port.
    #[serde(default)]
    pub control_port: Option<u16>,
    /// Path to the Tor control socket.
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
    /// Password for Tor control authentication.
    #[serde(default)]
    pub control_pass: Option<String>,
    /// Cookie file to use instead of the path Tor advertises.
    #[serde(default)]
    pub cookie_path: Option<PathBuf>,
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None for stdout, ":syslog:" for syslog.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Control session settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Connection resolver settings.
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// Tor log settings.
    #[serde(default)]
    pub logs: LogsConfig,
    /// Relay status settings.
    #[serde(default)]
    pub status: StatusConfig,
}

fn default_control_ip() -> String {
    "127.0.0.1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_ip: default_control_ip(),
            control_port: None,
            control_socket: None,
            control_pass: None,
            cookie_path: None,
            loglevel: LogLevel::default(),
            logfile: None,
            session: SessionConfig::default(),
            resolver: ResolverConfig::default(),
            logs: LogsConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.session.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.session.listener_queue_size == 0 {
            return Err(Error::Config(
                "listener_queue_size must be positive".to_string(),
            ));
        }
        if !(self.resolver.connections_min_rate > 0.0) {
            return Err(Error::Config(
                "connections_min_rate must be positive".to_string(),
            ));
        }
        if self.resolver.process_name.trim().is_empty() {
            return Err(Error::Config("process_name must not be empty".to_string()));
        }
        if let Some(ref name) = self.resolver.resolver_override {
            name.parse::<ResolverCommand>()?;
        }
        if self.logs.buffer_limit == 0 {
            return Err(Error::Config("buffer_limit must be positive".to_string()));
        }
        Ok(())
    }

    /// Resolve hostname to IP address if control_ip is a domain name.
    pub fn resolve_control_ip(&mut self) -> Result<()> {
        if self.control_ip.parse::<IpAddr>().is_err() {
            let addr = format!("{}:0", self.control_ip)
                .to_socket_addrs()
                .map_err(|e| {
                    Error::Config(format!(
                        "failed to resolve hostname {}: {}",
                        self.control_ip, e
                    ))
                })?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!(
                        "no addresses found for hostname {}",
                        self.control_ip
                    ))
                })?;
            self.control_ip = addr.ip().to_string();
        }
        Ok(())
    }
}

/// Command-line arguments for arm-rs.
///
/// Arguments override configuration file values.
///
/// ```text
/// arm-rs [OPTIONS]
/// ```
///
/// | Option | Description |
/// |--------|-------------|
/// | `--config <FILE>` | Configuration file [env: ARM_CONFIG] [default: arm.conf] |
/// | `--generate_config <FILE>` | Write default config to file and exit |
/// | `--control-ip <IP>` | Tor control port address |
/// | `--control-port <PORT>` | Tor control port number |
/// | `--control-socket <PATH>` | Tor control socket |
/// | `--control-pass <PASS>` | Control password |
/// | `--cookie <PATH>` | Authentication cookie file |
/// | `--loglevel <LEVEL>` | DEBUG, INFO, NOTICE, WARN, ERROR |
/// | `--logfile <FILE>` | Log to file (":syslog:" for syslog) |
/// | `--retry-limit <N>` | Reconnection attempt limit |
/// | `--process-name <NAME>` | Monitored process name |
/// | `--pid <PID>` | Monitored process id |
/// | `--resolver <CMD>` | Force a connection lookup command |
/// | `--enable-name-lookups` | Allow reverse DNS for eligible connections |
#[derive(Parser, Debug)]
#[command(name = "arm-rs")]
#[command(about = "Live status monitor for Tor relays")]
#[command(version)]
pub struct CliArgs {
    /// Write default config to file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout (use ":syslog:" for syslog).
    #[arg(long)]
    pub logfile: Option<String>,

    /// Path to configuration file.
    #[arg(long = "config", env = "ARM_CONFIG", default_value = "arm.conf")]
    pub config_file: PathBuf,

    /// IP address of the Tor control port.
    #[arg(long)]
    pub control_ip: Option<String>,

    /// Tor control port number.
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Path to Tor control socket.
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Tor control port password.
    #[arg(long)]
    pub control_pass: Option<String>,

    /// Authentication cookie file.
    #[arg(long = "cookie")]
    pub cookie_path: Option<PathBuf>,

    /// Reconnection attempt limit (default: infinite).
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Name of the monitored process.
    #[arg(long)]
    pub process_name: Option<String>,

    /// Pid of the monitored process.
    #[arg(long = "pid")]
    pub process_pid: Option<u32>,

    /// Connection lookup command (netstat, ss, lsof, sockstat, proc, ...).
    #[arg(long = "resolver")]
    pub resolver_override: Option<String>,

    /// Allow hostname lookups for non-entry, public connections.
    #[arg(long)]
    pub enable_name_lookups: bool,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref loglevel) = self.loglevel {
            if let Ok(level) = loglevel.parse() {
                config.loglevel = level;
            }
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(ref control_ip) = self.control_ip {
            config.control_ip = control_ip.clone();
        }
        if let Some(control_port) = self.control_port {
            config.control_port = Some(control_port);
        }
        if let Some(ref control_socket) = self.control_socket {
            config.control_socket = Some(control_socket.clone());
        }
        if let Some(ref control_pass) = self.control_pass {
            config.control_pass = Some(control_pass.clone());
        }
        if let Some(ref cookie_path) = self.cookie_path {
            config.cookie_path = Some(cookie_path.clone());
        }
        if let Some(retry_limit) = self.retry_limit {
            config.session.retry_limit = Some(retry_limit);
        }
        if let Some(ref name) = self.process_name {
            config.resolver.process_name = name.clone();
        }
        if let Some(pid) = self.process_pid {
            config.resolver.process_pid = Some(pid);
        }
        if let Some(ref cmd) = self.resolver_override {
            config.resolver.resolver_override = Some(cmd.clone());
        }
        if self.enable_name_lookups {
            config.resolver.name_lookups = true;
        }
    }
}

/// Load configuration from file and CLI arguments.
///
/// 1. Start with defaults
/// 2. Apply config file if it exists
/// 3. Apply CLI arguments (override)
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.resolve_control_ip()?;
    config.validate()?;

    Ok(config)
}
