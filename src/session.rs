//! Control port session.
//!
//! A [`Session`] owns one control connection. It multiplexes synchronous
//! request/reply exchanges with the asynchronous event feed Tor interleaves on
//! the same socket.
//!
//! # Architecture
//!
//! ```text
//!   callers (any task)                         reader task
//!   ──────────────────                         ───────────
//!   request("GETINFO x")                       read line
//!     │ lock writer                              │
//!     │ push oneshot ─────► pending FIFO ◄────── │ 2xx/4xx/5xx: pop front, send reply
//!     │ write line                               │ 6xx: decode Event
//!     │ unlock                                   ▼
//!     ▼                                        event feed (unbounded)
//!   await oneshot (with timeout)                 │
//!                                                ▼
//!                                          EventStream ──► dispatcher
//! ```
//!
//! Replies carry no request id, so the writer lock covers both the FIFO push
//! and the write: queue order always equals wire order.
//!
//! # Failure Semantics
//!
//! | Condition | Effect |
//! |-----------|--------|
//! | read/write error, EOF | session closes; pending and later requests get [`Error::Disconnected`] |
//! | no reply in time | that request gets [`Error::Timeout`]; its late reply is discarded |
//! | unclassifiable reply | that request gets [`Error::Protocol`]; session continues |
//! | malformed event | logged and skipped |
//!
//! # Example
//!
//! ```rust,no_run
//! use arm_rs::session::{Credentials, Endpoint, Session};
//!
//! # async fn example() -> arm_rs::Result<()> {
//! let session = Session::connect(&Endpoint::Tcp("127.0.0.1:9051".parse().unwrap())).await?;
//! session.authenticate(Credentials::Auto { password: None, cookie_path: None }).await?;
//! let version = session.get_info("version").await?;
//! println!("Tor {}", version);
//! session.close().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::config::{Config, LogLevel, SessionConfig};
use crate::error::{AuthError, Error, Result};
use crate::events::{Event, EventKind};
use crate::logger::plog;
use crate::lock;
use crate::protocol::{format_setconf, parse_arguments, quote, Frame, Reply, ReplyAssembler};

/// Length of Tor's control authentication cookie.
pub const COOKIE_LEN: usize = 32;

/// Default control socket tried when none is configured.
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/tor/control";

/// Default control port tried when none is configured.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Where the control port lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP `ip:port`.
    Tcp(SocketAddr),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Endpoints to try, in order, for a configuration.
    ///
    /// A configured socket or port is used alone. With neither configured the
    /// default socket is tried before the default port.
    pub fn candidates(config: &Config) -> Result<Vec<Endpoint>> {
        let tcp = |port: u16| -> Result<Endpoint> {
            format!("{}:{}", config.control_ip, port)
                .parse()
                .map(Endpoint::Tcp)
                .map_err(|e| Error::Config(format!("invalid control address: {}", e)))
        };

        if let Some(ref socket) = config.control_socket {
            return Ok(vec![Endpoint::Unix(socket.clone())]);
        }
        if let Some(port) = config.control_port {
            return Ok(vec![tcp(port)?]);
        }
        Ok(vec![
            Endpoint::Unix(PathBuf::from(DEFAULT_CONTROL_SOCKET)),
            tcp(DEFAULT_CONTROL_PORT)?,
        ])
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Credential forms accepted by [`Session::authenticate`].
#[derive(Clone)]
pub enum Credentials {
    /// Open control port.
    Null,
    /// Raw cookie bytes.
    Cookie(Zeroizing<Vec<u8>>),
    /// Cookie file to read.
    CookieFile(PathBuf),
    /// Control password.
    Password(Zeroizing<String>),
    /// Pick from what the control port advertises: NULL, then COOKIE, then
    /// HASHEDPASSWORD when a password is available.
    Auto {
        /// Password to use if the port requires one.
        password: Option<Zeroizing<String>>,
        /// Cookie file overriding the advertised path.
        cookie_path: Option<PathBuf>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Null => write!(f, "Null"),
            Credentials::Cookie(_) => write!(f, "Cookie(<redacted>)"),
            Credentials::CookieFile(path) => write!(f, "CookieFile({})", path.display()),
            Credentials::Password(_) => write!(f, "Password(<redacted>)"),
            Credentials::Auto { cookie_path, .. } => {
                write!(f, "Auto {{ cookie_path: {:?} }}", cookie_path)
            }
        }
    }
}

impl Credentials {
    /// Credentials derived from the configuration.
    pub fn from_config(config: &Config) -> Self {
        Credentials::Auto {
            password: config.control_pass.clone().map(Zeroizing::new),
            cookie_path: config.cookie_path.clone(),
        }
    }
}

/// Authentication progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Connected, nothing sent yet or last attempt failed.
    Unauthenticated,
    /// `PROTOCOLINFO`/`AUTHENTICATE` in flight.
    Authenticating,
    /// Ready for commands.
    Authenticated,
    /// Session closed.
    Closed,
}

/// Facts from the `PROTOCOLINFO` reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProtocolInfo {
    /// Control protocol version.
    pub protocol_version: u32,
    /// Tor version string.
    pub tor_version: Option<String>,
    /// Advertised auth methods (`NULL`, `COOKIE`, `SAFECOOKIE`, `HASHEDPASSWORD`).
    pub auth_methods: Vec<String>,
    /// Advertised cookie file.
    pub cookie_file: Option<PathBuf>,
}

impl ProtocolInfo {
    /// Parses a `PROTOCOLINFO` reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the reply is not a `2xx` or lacks the
    /// `PROTOCOLINFO` line.
    pub fn parse(reply: &Reply) -> Result<Self> {
        let reply = ensure_ok(reply.clone())?;
        let mut info = ProtocolInfo::default();
        let mut seen_header = false;

        for line in &reply.lines {
            let (keyword, rest) = line.text.split_once(' ').unwrap_or((line.text.as_str(), ""));
            match keyword {
                "PROTOCOLINFO" => {
                    info.protocol_version = rest.trim().parse().map_err(|_| {
                        Error::Protocol(format!("bad PROTOCOLINFO version: {}", rest))
                    })?;
                    seen_header = true;
                }
                "AUTH" => {
                    let (_, args) = parse_arguments(rest);
                    if let Some(methods) = args.get("METHODS") {
                        info.auth_methods = methods.split(',').map(str::to_string).collect();
                    }
                    info.cookie_file = args.get("COOKIEFILE").map(PathBuf::from);
                }
                "VERSION" => {
                    let (_, args) = parse_arguments(rest);
                    info.tor_version = args.get("Tor").cloned();
                }
                _ => {}
            }
        }

        if !seen_header {
            return Err(Error::Protocol("reply lacks PROTOCOLINFO line".to_string()));
        }
        Ok(info)
    }

    fn supports(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

/// Fails non-`2xx` replies with [`Error::Protocol`].
pub fn ensure_ok(reply: Reply) -> Result<Reply> {
    if reply.is_ok() {
        Ok(reply)
    } else {
        Err(Error::Protocol(format!("request rejected: {}", reply)))
    }
}

type PendingReply = oneshot::Sender<Result<Reply>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    writer: tokio::sync::Mutex<Writer>,
    pending: Mutex<VecDeque<PendingReply>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    closed: AtomicBool,
    auth_state: Mutex<AuthState>,
    protocol_info: Mutex<Option<ProtocolInfo>>,
    malformed_events: AtomicU64,
}

impl Shared {
    fn teardown(&self, reason: &str) {
        let drained: Vec<PendingReply> = {
            let mut pending = lock(&self.pending);
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            pending.drain(..).collect()
        };
        plog(
            LogLevel::Info,
            &format!(
                "Control session closed ({}), failing {} pending request(s)",
                reason,
                drained.len()
            ),
        );
        for waiter in drained {
            let _ = waiter.send(Err(Error::Disconnected));
        }
        lock(&self.events_tx).take();
        *lock(&self.auth_state) = AuthState::Closed;
    }

    fn complete(&self, result: Result<Reply>) {
        let waiter = lock(&self.pending).pop_front();
        match waiter {
            Some(waiter) => {
                if waiter.send(result).is_err() {
                    plog(LogLevel::Debug, "Discarding reply to a timed out request");
                }
            }
            None => plog(LogLevel::Debug, "Discarding unsolicited reply"),
        }
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = lock(&self.events_tx).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn on_async_reply(&self, reply: &Reply) {
        match Event::from_reply(reply) {
            Ok(event) => self.emit(event),
            Err(e) => self.on_malformed_event(&e.to_string()),
        }
    }

    fn on_malformed_event(&self, reason: &str) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
        plog(
            LogLevel::Warn,
            &format!("Skipping malformed event: {}", reason),
        );
    }
}

/// The event feed of one session.
///
/// Yields events in transport order and ends when the session closes.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Next event, or `None` once the session is closed and the feed drained.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// A control port session.
///
/// Share it between tasks with an [`Arc`]; every method takes `&self`.
pub struct Session {
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("auth_state", &self.auth_state())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Session {
    /// Connects with default session settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the connection cannot be opened.
    pub async fn connect(endpoint: &Endpoint) -> Result<Session> {
        Self::connect_with(endpoint, &SessionConfig::default()).await
    }

    /// Connects using the given session settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the connection cannot be opened.
    pub async fn connect_with(endpoint: &Endpoint, config: &SessionConfig) -> Result<Session> {
        let transport_err =
            |e: std::io::Error| Error::Transport(format!("cannot connect to {}: {}", endpoint, e));
        match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr)
                    .await
                    .map_err(transport_err)?;
                Ok(Self::from_stream_with(stream, config))
            }
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(transport_err)?;
                Ok(Self::from_stream_with(stream, config))
            }
        }
    }

    /// Wraps an already open transport with default settings.
    pub fn from_stream<S>(stream: S) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream_with(stream, &SessionConfig::default())
    }

    /// Wraps an already open transport and starts its reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream_with<S>(stream: S, config: &SessionConfig) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            pending: Mutex::new(VecDeque::new()),
            events_tx: Mutex::new(Some(events_tx)),
            closed: AtomicBool::new(false),
            auth_state: Mutex::new(AuthState::Unauthenticated),
            protocol_info: Mutex::new(None),
            malformed_events: AtomicU64::new(0),
        });

        let reader = tokio::spawn(read_loop(read_half, shared.clone()));

        Session {
            shared,
            events_rx: Mutex::new(Some(events_rx)),
            reader: Mutex::new(Some(reader)),
            request_timeout: config.request_timeout(),
        }
    }

    /// Takes the event feed. Returns `None` on every call after the first.
    pub fn events(&self) -> Option<EventStream> {
        lock(&self.events_rx).take().map(|rx| EventStream { rx })
    }

    /// Sends one command line and waits for its reply.
    ///
    /// Non-`2xx` replies are returned as-is; see [`ensure_ok`].
    ///
    /// # Errors
    ///
    /// - [`Error::Disconnected`] if the session is or becomes closed
    /// - [`Error::Timeout`] if no reply arrives within the request timeout
    /// - [`Error::Protocol`] if the reply cannot be parsed
    /// - [`Error::Transport`] if the write fails (the session closes)
    /// - [`Error::Validation`] if the command contains a line break
    pub async fn request(&self, command: &str) -> Result<Reply> {
        if command.contains(['\r', '\n']) {
            return Err(Error::Validation(
                "control commands must be a single line".to_string(),
            ));
        }

        let rx = {
            let mut writer = self.shared.writer.lock().await;
            let (tx, rx) = oneshot::channel();
            {
                let mut pending = lock(&self.shared.pending);
                if self.shared.closed.load(Ordering::SeqCst) {
                    return Err(Error::Disconnected);
                }
                pending.push_back(tx);
            }

            let line = Zeroizing::new(format!("{}\r\n", command));
            let written = match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                drop(writer);
                self.shared.teardown("write failed");
                return Err(Error::Transport(format!("write failed: {}", e)));
            }
            rx
        };

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::Disconnected),
            Err(_) => return Err(Error::Timeout(self.request_timeout)),
        };

        if reply.is_ok() {
            if let Some(changed) = conf_changes(command) {
                self.shared.emit(Event::ConfChanged(changed));
            }
        }
        Ok(reply)
    }

    /// Queries `PROTOCOLINFO` and authenticates.
    ///
    /// # Errors
    ///
    /// - [`AuthError::ProtocolMismatch`] if the credential form is not
    ///   advertised
    /// - [`AuthError::BadCredentials`] if Tor rejects the value
    /// - [`AuthError::CookieUnreadable`] if a cookie file cannot be used
    /// - any [`request`](Self::request) error
    pub async fn authenticate(&self, credentials: Credentials) -> Result<()> {
        self.set_auth_state(AuthState::Authenticating);
        let result = self.authenticate_inner(credentials).await;
        self.set_auth_state(match result {
            Ok(()) => AuthState::Authenticated,
            Err(_) => AuthState::Unauthenticated,
        });
        result
    }

    async fn authenticate_inner(&self, credentials: Credentials) -> Result<()> {
        let reply = self.request("PROTOCOLINFO 1").await?;
        let info = ProtocolInfo::parse(&reply)?;
        *lock(&self.shared.protocol_info) = Some(info.clone());

        let command: Zeroizing<String> = match credentials {
            Credentials::Null => {
                require(&info, "NULL")?;
                Zeroizing::new("AUTHENTICATE".to_string())
            }
            Credentials::Cookie(bytes) => {
                require(&info, "COOKIE")?;
                cookie_command(&bytes)?
            }
            Credentials::CookieFile(path) => {
                require(&info, "COOKIE")?;
                cookie_command(&read_cookie(&path).await?)?
            }
            Credentials::Password(password) => {
                require(&info, "HASHEDPASSWORD")?;
                Zeroizing::new(format!("AUTHENTICATE {}", quote(&password)))
            }
            Credentials::Auto {
                password,
                cookie_path,
            } => {
                if info.supports("NULL") {
                    Zeroizing::new("AUTHENTICATE".to_string())
                } else if info.supports("COOKIE") {
                    let path = cookie_path.or_else(|| info.cookie_file.clone()).ok_or_else(|| {
                        AuthError::CookieUnreadable("no cookie file advertised".to_string())
                    })?;
                    cookie_command(&read_cookie(&path).await?)?
                } else if let (true, Some(password)) = (info.supports("HASHEDPASSWORD"), password)
                {
                    Zeroizing::new(format!("AUTHENTICATE {}", quote(&password)))
                } else {
                    return Err(AuthError::ProtocolMismatch(format!(
                        "no usable method among {}",
                        info.auth_methods.join(",")
                    ))
                    .into());
                }
            }
        };

        let reply = self.request(&command).await?;
        match reply.code() {
            250 => {
                plog(
                    LogLevel::Info,
                    &format!(
                        "Authenticated to Tor {}",
                        info.tor_version.as_deref().unwrap_or("(unknown version)")
                    ),
                );
                Ok(())
            }
            515 => Err(AuthError::BadCredentials(reply.message().to_string()).into()),
            _ => Err(Error::Protocol(format!("unexpected AUTHENTICATE reply: {}", reply))),
        }
    }

    /// `GETINFO` for one key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if Tor rejects the key or omits it.
    pub async fn get_info(&self, key: &str) -> Result<String> {
        let reply = ensure_ok(self.request(&format!("GETINFO {}", key)).await?)?;
        reply
            .key_values()
            .into_iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v)
            .ok_or_else(|| Error::Protocol(format!("GETINFO reply lacks {}", key)))
    }

    /// `GETINFO` for several keys at once.
    pub async fn get_info_map(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let reply = ensure_ok(self.request(&format!("GETINFO {}", keys.join(" "))).await?)?;
        Ok(reply
            .key_values()
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    /// `GETCONF` in reply order. Options may repeat; unset ones have `None`.
    pub async fn get_conf(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>> {
        let reply = ensure_ok(self.request(&format!("GETCONF {}", keys.join(" "))).await?)?;
        Ok(reply.key_values())
    }

    /// First value of one option.
    pub async fn get_conf_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get_conf(&[key])
            .await?
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v))
    }

    /// `SETCONF`. Like any successful config change sent through
    /// [`request`](Self::request), it injects an [`Event::ConfChanged`].
    pub async fn set_conf(&self, pairs: &[(&str, &str)]) -> Result<()> {
        ensure_ok(self.request(&format_setconf(pairs)).await?)?;
        Ok(())
    }

    /// `RESETCONF`. On success an [`Event::ConfChanged`] is injected.
    pub async fn reset_conf(&self, keys: &[&str]) -> Result<()> {
        ensure_ok(self.request(&format!("RESETCONF {}", keys.join(" "))).await?)?;
        Ok(())
    }

    /// `SETEVENTS` with the given kinds. Unknown kinds are ignored.
    pub async fn set_events(&self, kinds: &[EventKind]) -> Result<()> {
        let mut keywords: Vec<&str> = kinds.iter().filter_map(EventKind::keyword).collect();
        keywords.sort_unstable();
        keywords.dedup();
        let mut command = String::from("SETEVENTS");
        for keyword in keywords {
            command.push(' ');
            command.push_str(keyword);
        }
        ensure_ok(self.request(&command).await?)?;
        Ok(())
    }

    /// Closes the session. Idempotent.
    pub async fn close(&self) {
        self.shared.teardown("closed by caller");
        {
            let mut writer = self.shared.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }

    /// Returns `true` until the session closes.
    pub fn is_alive(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    /// Current authentication state.
    pub fn auth_state(&self) -> AuthState {
        *lock(&self.shared.auth_state)
    }

    /// `PROTOCOLINFO` facts, once authentication has started.
    pub fn protocol_info(&self) -> Option<ProtocolInfo> {
        lock(&self.shared.protocol_info).clone()
    }

    /// Number of events dropped because they could not be decoded.
    pub fn malformed_events(&self) -> u64 {
        self.shared.malformed_events.load(Ordering::Relaxed)
    }

    fn set_auth_state(&self, state: AuthState) {
        let mut current = lock(&self.shared.auth_state);
        if *current != AuthState::Closed {
            *current = state;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.teardown("dropped");
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

/// Options changed by a `SETCONF` or `RESETCONF` command line, or `None`
/// for any other command. Bare keys map to `None` (reset to default).
fn conf_changes(command: &str) -> Option<Vec<(String, Option<String>)>> {
    let (keyword, rest) = command
        .trim_start()
        .split_once(' ')
        .unwrap_or((command.trim(), ""));
    if !keyword.eq_ignore_ascii_case("SETCONF") && !keyword.eq_ignore_ascii_case("RESETCONF") {
        return None;
    }

    let (bare, assigned) = parse_arguments(rest);
    let mut changed: Vec<(String, Option<String>)> =
        bare.into_iter().map(|key| (key, None)).collect();
    let mut assigned: Vec<(String, String)> = assigned.into_iter().collect();
    assigned.sort();
    changed.extend(assigned.into_iter().map(|(k, v)| (k, Some(v))));
    Some(changed)
}

fn require(info: &ProtocolInfo, method: &str) -> Result<()> {
    if info.supports(method) {
        Ok(())
    } else {
        Err(AuthError::ProtocolMismatch(format!(
            "{} not among advertised methods {}",
            method,
            info.auth_methods.join(",")
        ))
        .into())
    }
}

fn cookie_command(cookie: &[u8]) -> Result<Zeroizing<String>> {
    if cookie.len() != COOKIE_LEN {
        return Err(AuthError::CookieUnreadable(format!(
            "expected {} bytes, got {}",
            COOKIE_LEN,
            cookie.len()
        ))
        .into());
    }
    Ok(Zeroizing::new(format!("AUTHENTICATE {}", hex::encode(cookie))))
}

async fn read_cookie(path: &std::path::Path) -> Result<Zeroizing<Vec<u8>>> {
    tokio::fs::read(path)
        .await
        .map(Zeroizing::new)
        .map_err(|e| AuthError::CookieUnreadable(format!("{}: {}", path.display(), e)).into())
}

async fn read_loop<R>(read_half: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read_half);
    let mut assembler = ReplyAssembler::new();
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                shared.teardown("connection closed by peer");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                shared.teardown(&format!("read failed: {}", e));
                return;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.strip_suffix('\n').unwrap_or(&text);
        match assembler.push_line(line) {
            None => {}
            Some(Frame::Reply(reply)) if reply.is_async() => shared.on_async_reply(&reply),
            Some(Frame::Reply(reply)) => shared.complete(Ok(reply)),
            Some(Frame::Malformed {
                is_async: true,
                reason,
            }) => shared.on_malformed_event(&reason),
            Some(Frame::Malformed {
                is_async: false,
                reason,
            }) => shared.complete(Err(Error::Protocol(reason))),
        }
    }
}

/// Enforces a minimum interval between connection attempts.
///
/// Reconnection is never automatic: callers ask for it and get
/// [`Error::ReconnectThrottled`] when asking too early.
#[derive(Debug)]
pub struct Reconnector {
    min_interval: Duration,
    last_attempt: Option<Instant>,
}

impl Reconnector {
    /// Creates a throttle allowing one attempt per `min_interval`.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_attempt: None,
        }
    }

    /// Records an attempt, or fails if the previous one was too recent.
    pub fn check(&mut self) -> Result<()> {
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            let elapsed = now.duration_since(last);
            if elapsed < self.min_interval {
                return Err(Error::ReconnectThrottled {
                    retry_in: self.min_interval - elapsed,
                });
            }
        }
        self.last_attempt = Some(now);
        Ok(())
    }

    /// Connects to the first reachable endpoint and authenticates.
    ///
    /// # Errors
    ///
    /// [`Error::ReconnectThrottled`] inside the interval, otherwise the last
    /// connect error or the authentication error.
    pub async fn reconnect(
        &mut self,
        endpoints: &[Endpoint],
        credentials: Credentials,
        config: &SessionConfig,
    ) -> Result<Session> {
        self.check()?;

        let mut last_err = Error::Transport("no control endpoint configured".to_string());
        for endpoint in endpoints {
            match Session::connect_with(endpoint, config).await {
                Ok(session) => {
                    plog(
                        LogLevel::Notice,
                        &format!("Connected to Tor control port at {}", endpoint),
                    );
                    session.authenticate(credentials).await?;
                    return Ok(session);
                }
                Err(e) => {
                    plog(LogLevel::Debug, &format!("{}", e));
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory control port for tests.

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, WriteHalf};

    /// The Tor side of a duplex transport.
    pub struct FakeTor {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeTor {
        pub fn new(stream: DuplexStream) -> Self {
            let (r, w) = tokio::io::split(stream);
            Self {
                lines: BufReader::new(r).lines(),
                writer: w,
            }
        }

        /// Next command the session sent.
        pub async fn expect_line(&mut self) -> String {
            self.lines.next_line().await.unwrap().unwrap()
        }

        /// Writes reply lines, each terminated with CRLF.
        pub async fn send(&mut self, lines: &[&str]) {
            for line in lines {
                self.writer.write_all(line.as_bytes()).await.unwrap();
                self.writer.write_all(b"\r\n").await.unwrap();
            }
            self.writer.flush().await.unwrap();
        }

        /// Answers `PROTOCOLINFO` advertising the given methods.
        pub async fn protocolinfo(&mut self, methods: &str, cookie: Option<&str>) {
            let line = self.expect_line().await;
            assert_eq!(line, "PROTOCOLINFO 1");
            let auth = match cookie {
                Some(path) => format!("250-AUTH METHODS={} COOKIEFILE=\"{}\"", methods, path),
                None => format!("250-AUTH METHODS={}", methods),
            };
            self.send(&[
                "250-PROTOCOLINFO 1",
                &auth,
                "250-VERSION Tor=\"0.4.8.12\"",
                "250 OK",
            ])
            .await;
        }
    }

    pub fn pair() -> (super::Session, FakeTor) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (super::Session::from_stream(client), FakeTor::new(server))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{pair, FakeTor};
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_request_reply_fifo() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);

        let s1 = session.clone();
        let first = tokio::spawn(async move { s1.get_info("version").await });
        assert_eq!(tor.expect_line().await, "GETINFO version");

        let s2 = session.clone();
        let second = tokio::spawn(async move { s2.get_info("address").await });
        assert_eq!(tor.expect_line().await, "GETINFO address");

        tor.send(&["250-version=0.4.8.12", "250 OK"]).await;
        tor.send(&["650 BW 1 2"]).await;
        tor.send(&["250-address=203.0.113.5", "250 OK"]).await;

        assert_eq!(first.await.unwrap().unwrap(), "0.4.8.12");
        assert_eq!(second.await.unwrap().unwrap(), "203.0.113.5");

        let mut events = session.events().unwrap();
        assert!(matches!(events.next().await, Some(Event::Bandwidth(_))));
        assert!(session.events().is_none());
    }

    #[tokio::test]
    async fn test_pending_requests_fail_on_disconnect() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);

        let mut handles = Vec::new();
        for key in ["a", "b", "c"] {
            let s = session.clone();
            handles.push(tokio::spawn(async move {
                s.get_info(key).await
            }));
        }
        for _ in 0..3 {
            tor.expect_line().await;
        }
        drop(tor);

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(Error::Disconnected)));
        }
        assert!(matches!(
            session.get_info("version").await,
            Err(Error::Disconnected)
        ));
        assert!(!session.is_alive());
        assert_eq!(session.auth_state(), AuthState::Closed);
    }

    #[tokio::test]
    async fn test_event_stream_ends_on_close() {
        let (session, mut tor) = pair();
        let mut events = session.events().unwrap();
        tor.send(&["650 SIGNAL RELOAD"]).await;
        assert_eq!(events.next().await, Some(Event::Signal("RELOAD".to_string())));

        session.close().await;
        session.close().await;
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_timeout_discards_late_reply() {
        let (client, server) = tokio::io::duplex(4096);
        let config = SessionConfig {
            request_timeout_secs: 1,
            ..Default::default()
        };
        let session = Arc::new(Session::from_stream_with(client, &config));
        let mut tor = FakeTor::new(server);

        let first = session.get_info("slow").await;
        assert!(matches!(first, Err(Error::Timeout(_))));
        assert_eq!(tor.expect_line().await, "GETINFO slow");

        let s = session.clone();
        let second = tokio::spawn(async move { s.get_info("fast").await });
        assert_eq!(tor.expect_line().await, "GETINFO fast");
        tor.send(&["250-slow=late", "250 OK"]).await;
        tor.send(&["250-fast=ok", "250 OK"]).await;

        assert_eq!(second.await.unwrap().unwrap(), "ok");
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_malformed_reply_fails_only_that_request() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);

        let s = session.clone();
        let bad = tokio::spawn(async move { s.request("GETINFO x").await });
        tor.expect_line().await;
        tor.send(&["this is not a reply"]).await;
        assert!(matches!(bad.await.unwrap(), Err(Error::Protocol(_))));

        let s = session.clone();
        let good = tokio::spawn(async move { s.get_info("version").await });
        tor.expect_line().await;
        tor.send(&["250-version=1", "250 OK"]).await;
        assert_eq!(good.await.unwrap().unwrap(), "1");
    }

    #[tokio::test]
    async fn test_malformed_event_skipped() {
        let (session, mut tor) = pair();
        let mut events = session.events().unwrap();
        tor.send(&["650 BW x y", "650 BW 3 4"]).await;
        assert_eq!(
            events.next().await,
            Some(Event::Bandwidth(crate::events::BandwidthSample {
                read: 3,
                written: 4
            }))
        );
        assert_eq!(session.malformed_events(), 1);
    }

    #[tokio::test]
    async fn test_cookie_file_auth() {
        let mut cookie = NamedTempFile::new().unwrap();
        cookie.write_all(&[0xAB; COOKIE_LEN]).unwrap();
        let path = cookie.path().to_path_buf();

        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let s = session.clone();
        let auth = tokio::spawn(async move { s.authenticate(Credentials::CookieFile(path)).await });

        tor.protocolinfo("COOKIE,SAFECOOKIE", Some("/var/run/tor/control.authcookie"))
            .await;
        let line = tor.expect_line().await;
        assert_eq!(line, format!("AUTHENTICATE {}", "ab".repeat(COOKIE_LEN)));
        tor.send(&["250 OK"]).await;

        auth.await.unwrap().unwrap();
        assert_eq!(session.auth_state(), AuthState::Authenticated);
        let info = session.protocol_info().unwrap();
        assert_eq!(info.tor_version.as_deref(), Some("0.4.8.12"));
        assert_eq!(
            info.cookie_file,
            Some(PathBuf::from("/var/run/tor/control.authcookie"))
        );
    }

    #[tokio::test]
    async fn test_wrong_form_is_protocol_mismatch() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let s = session.clone();
        let auth = tokio::spawn(async move {
            s.authenticate(Credentials::Cookie(Zeroizing::new(vec![0; COOKIE_LEN])))
                .await
        });
        tor.protocolinfo("HASHEDPASSWORD", None).await;
        assert!(matches!(
            auth.await.unwrap(),
            Err(Error::Auth(AuthError::ProtocolMismatch(_)))
        ));
        assert_eq!(session.auth_state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_wrong_password_is_bad_credentials() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let s = session.clone();
        let auth = tokio::spawn(async move {
            s.authenticate(Credentials::Password(Zeroizing::new("hunter2".to_string())))
                .await
        });
        tor.protocolinfo("HASHEDPASSWORD", None).await;
        assert_eq!(tor.expect_line().await, "AUTHENTICATE \"hunter2\"");
        tor.send(&["515 Authentication failed: Password did not match"])
            .await;
        assert!(matches!(
            auth.await.unwrap(),
            Err(Error::Auth(AuthError::BadCredentials(_)))
        ));
    }

    #[tokio::test]
    async fn test_auto_prefers_null() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let s = session.clone();
        let auth = tokio::spawn(async move {
            s.authenticate(Credentials::Auto {
                password: Some(Zeroizing::new("unused".to_string())),
                cookie_path: None,
            })
            .await
        });
        tor.protocolinfo("NULL,HASHEDPASSWORD", None).await;
        assert_eq!(tor.expect_line().await, "AUTHENTICATE");
        tor.send(&["250 OK"]).await;
        auth.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_cookie() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let s = session.clone();
        let auth = tokio::spawn(async move {
            s.authenticate(Credentials::CookieFile(PathBuf::from(
                "/nonexistent/control.authcookie",
            )))
            .await
        });
        tor.protocolinfo("COOKIE", None).await;
        assert!(matches!(
            auth.await.unwrap(),
            Err(Error::Auth(AuthError::CookieUnreadable(_)))
        ));
    }

    #[tokio::test]
    async fn test_set_conf_injects_conf_changed() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let mut events = session.events().unwrap();

        let s = session.clone();
        let set = tokio::spawn(async move { s.set_conf(&[("BandwidthRate", "2 MB")]).await });
        assert_eq!(tor.expect_line().await, "SETCONF BandwidthRate=\"2 MB\"");
        tor.send(&["250 OK"]).await;
        set.await.unwrap().unwrap();

        assert_eq!(
            events.next().await,
            Some(Event::ConfChanged(vec![(
                "BandwidthRate".to_string(),
                Some("2 MB".to_string())
            )]))
        );
    }

    #[tokio::test]
    async fn test_raw_setconf_request_injects_conf_changed() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let mut events = session.events().unwrap();

        let s = session.clone();
        let req = tokio::spawn(async move { s.request("SETCONF BandwidthRate=1000").await });
        assert_eq!(tor.expect_line().await, "SETCONF BandwidthRate=1000");
        tor.send(&["250 OK"]).await;
        assert!(req.await.unwrap().unwrap().is_ok());
        tor.send(&["650 BW 1 1"]).await;

        assert_eq!(
            events.next().await,
            Some(Event::ConfChanged(vec![(
                "BandwidthRate".to_string(),
                Some("1000".to_string())
            )]))
        );
        assert!(matches!(events.next().await, Some(Event::Bandwidth(_))));
    }

    #[tokio::test]
    async fn test_rejected_setconf_injects_nothing() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let mut events = session.events().unwrap();

        let s = session.clone();
        let req = tokio::spawn(async move { s.request("setconf Bogus=1").await });
        assert_eq!(tor.expect_line().await, "setconf Bogus=1");
        tor.send(&["552 Unrecognized option"]).await;
        assert_eq!(req.await.unwrap().unwrap().code(), 552);
        tor.send(&["650 BW 1 1"]).await;

        assert!(matches!(events.next().await, Some(Event::Bandwidth(_))));
    }

    #[test]
    fn test_conf_changes() {
        assert_eq!(conf_changes("GETINFO version"), None);
        assert_eq!(
            conf_changes("RESETCONF ExitPolicy ORPort"),
            Some(vec![
                ("ExitPolicy".to_string(), None),
                ("ORPort".to_string(), None)
            ])
        );
        assert_eq!(
            conf_changes("SETCONF Nickname=\"my relay\" ORPort=9001"),
            Some(vec![
                ("Nickname".to_string(), Some("my relay".to_string())),
                ("ORPort".to_string(), Some("9001".to_string()))
            ])
        );
    }

    #[tokio::test]
    async fn test_set_events_command() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let s = session.clone();
        let set = tokio::spawn(async move {
            s.set_events(&[EventKind::Bw, EventKind::Circ, EventKind::Bw, EventKind::Unknown])
                .await
        });
        assert_eq!(tor.expect_line().await, "SETEVENTS BW CIRC");
        tor.send(&["250 OK"]).await;
        set.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rejected_getinfo_is_protocol_error() {
        let (session, mut tor) = pair();
        let session = Arc::new(session);
        let s = session.clone();
        let get = tokio::spawn(async move { s.get_info("bogus").await });
        tor.expect_line().await;
        tor.send(&["552 Unrecognized key \"bogus\""]).await;
        assert!(matches!(get.await.unwrap(), Err(Error::Protocol(_))));
        assert!(session.is_alive());
    }

    #[tokio::test]
    async fn test_multiline_command_rejected() {
        let (session, _tor) = pair();
        assert!(matches!(
            session.request("GETINFO a\r\nQUIT").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnector_throttles() {
        let mut reconnector = Reconnector::new(Duration::from_secs(5));
        reconnector.check().unwrap();
        match reconnector.check() {
            Err(Error::ReconnectThrottled { retry_in }) => {
                assert!(retry_in <= Duration::from_secs(5));
                assert!(retry_in > Duration::from_secs(4));
            }
            other => panic!("expected throttle, got {:?}", other),
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        reconnector.check().unwrap();
    }

    #[test]
    fn test_endpoint_candidates() {
        let mut config = Config::default();
        let defaults = Endpoint::candidates(&config).unwrap();
        assert_eq!(defaults.len(), 2);
        assert_eq!(defaults[0], Endpoint::Unix(PathBuf::from(DEFAULT_CONTROL_SOCKET)));

        config.control_port = Some(9151);
        assert_eq!(
            Endpoint::candidates(&config).unwrap(),
            vec![Endpoint::Tcp("127.0.0.1:9151".parse().unwrap())]
        );
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let creds = Credentials::Password(Zeroizing::new("secret".to_string()));
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}
