//! Typed asynchronous events.
//!
//! Every `6xx` reply the session reads is decoded into one [`Event`]. Kinds
//! the monitor has no use for become [`Event::Unknown`] with their keyword and
//! raw text, so newer Tor versions never break decoding.
//!
//! # Event Kinds
//!
//! | Keyword | Variant | Store effect |
//! |---------|---------|--------------|
//! | `CIRC` | [`Event::Circuit`] | circuit table |
//! | `STREAM` | [`Event::Stream`] | - |
//! | `BW` | [`Event::Bandwidth`] | latest sample |
//! | `DEBUG` .. `ERR` | [`Event::Log`] | log buffer |
//! | `CONF_CHANGED` | [`Event::ConfChanged`] | invalidates config-derived entries |
//! | `STATUS_SERVER` | [`Event::Status`] | external address |
//! | `STATUS_CLIENT` / `STATUS_GENERAL` | [`Event::Status`] | - |
//! | `NEWCONSENSUS` | [`Event::NewConsensus`] | relay records |
//! | `ORCONN` | [`Event::OrConn`] | - |
//! | `SIGNAL` | [`Event::Signal`] | - |
//!
//! # Example
//!
//! ```rust
//! use arm_rs::events::{Event, EventKind};
//! use arm_rs::protocol::{Frame, ReplyAssembler};
//!
//! let mut asm = ReplyAssembler::new();
//! let Some(Frame::Reply(reply)) = asm.push_line("650 BW 1024 2048") else {
//!     panic!("incomplete");
//! };
//! let event = Event::from_reply(&reply).unwrap();
//! assert_eq!(event.kind(), EventKind::Bw);
//! ```

use std::collections::HashMap;

use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::protocol::{parse_arguments, Reply, Separator};
use crate::relay::{parse_router_statuses, RelayRecord, RelayRef};

/// Event kind, used for subscriptions and cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// `CIRC`
    Circ,
    /// `STREAM`
    Stream,
    /// `BW`
    Bw,
    /// Tor log message at the given runlevel.
    Log(LogLevel),
    /// `CONF_CHANGED`
    ConfChanged,
    /// `STATUS_SERVER`
    StatusServer,
    /// `STATUS_CLIENT`
    StatusClient,
    /// `STATUS_GENERAL`
    StatusGeneral,
    /// `NEWCONSENSUS`
    NewConsensus,
    /// `ORCONN`
    OrConn,
    /// `SIGNAL`
    Signal,
    /// Anything else.
    Unknown,
}

impl EventKind {
    /// Keyword used with `SETEVENTS`. `None` for [`EventKind::Unknown`].
    pub fn keyword(&self) -> Option<&'static str> {
        Some(match self {
            EventKind::Circ => "CIRC",
            EventKind::Stream => "STREAM",
            EventKind::Bw => "BW",
            EventKind::Log(LogLevel::Debug) => "DEBUG",
            EventKind::Log(LogLevel::Info) => "INFO",
            EventKind::Log(LogLevel::Notice) => "NOTICE",
            EventKind::Log(LogLevel::Warn) => "WARN",
            EventKind::Log(LogLevel::Error) => "ERR",
            EventKind::ConfChanged => "CONF_CHANGED",
            EventKind::StatusServer => "STATUS_SERVER",
            EventKind::StatusClient => "STATUS_CLIENT",
            EventKind::StatusGeneral => "STATUS_GENERAL",
            EventKind::NewConsensus => "NEWCONSENSUS",
            EventKind::OrConn => "ORCONN",
            EventKind::Signal => "SIGNAL",
            EventKind::Unknown => return None,
        })
    }

    /// Parses an event keyword.
    pub fn from_keyword(keyword: &str) -> EventKind {
        match keyword {
            "CIRC" => EventKind::Circ,
            "STREAM" => EventKind::Stream,
            "BW" => EventKind::Bw,
            "DEBUG" => EventKind::Log(LogLevel::Debug),
            "INFO" => EventKind::Log(LogLevel::Info),
            "NOTICE" => EventKind::Log(LogLevel::Notice),
            "WARN" => EventKind::Log(LogLevel::Warn),
            "ERR" => EventKind::Log(LogLevel::Error),
            "CONF_CHANGED" => EventKind::ConfChanged,
            "STATUS_SERVER" => EventKind::StatusServer,
            "STATUS_CLIENT" => EventKind::StatusClient,
            "STATUS_GENERAL" => EventKind::StatusGeneral,
            "NEWCONSENSUS" => EventKind::NewConsensus,
            "ORCONN" => EventKind::OrConn,
            "SIGNAL" => EventKind::Signal,
            _ => EventKind::Unknown,
        }
    }

    /// Log kinds at or above `min`, most verbose first.
    pub fn log_kinds_from(min: LogLevel) -> Vec<EventKind> {
        [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Notice,
            LogLevel::Warn,
            LogLevel::Error,
        ]
        .into_iter()
        .filter(|level| *level >= min)
        .map(EventKind::Log)
        .collect()
    }
}

/// Circuit build state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Circuit id assigned, nothing built yet.
    Launched,
    /// All hops built.
    Built,
    /// Built, waiting for a better guard.
    GuardWait,
    /// One more hop added.
    Extended,
    /// Never finished building.
    Failed,
    /// Torn down.
    Closed,
}

impl CircuitStatus {
    fn from_keyword(s: &str) -> Option<Self> {
        Some(match s {
            "LAUNCHED" => CircuitStatus::Launched,
            "BUILT" => CircuitStatus::Built,
            "GUARD_WAIT" => CircuitStatus::GuardWait,
            "EXTENDED" => CircuitStatus::Extended,
            "FAILED" => CircuitStatus::Failed,
            "CLOSED" => CircuitStatus::Closed,
            _ => return None,
        })
    }

    fn parse(s: &str) -> Result<Self> {
        Self::from_keyword(s)
            .ok_or_else(|| Error::Protocol(format!("unknown circuit status {}", s)))
    }

    /// Returns `true` once the circuit is gone.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CircuitStatus::Failed | CircuitStatus::Closed)
    }
}

/// A `CIRC` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    /// Circuit id.
    pub id: u64,
    /// Build state.
    pub status: CircuitStatus,
    /// Hops, first hop (entry) first.
    pub path: Vec<RelayRef>,
    /// `PURPOSE` argument, if present.
    pub purpose: Option<String>,
}

impl CircuitEvent {
    /// Parses one `GETINFO circuit-status` line. The layout matches a `CIRC`
    /// event body.
    pub fn parse(line: &str) -> Result<CircuitEvent> {
        parse_circ(line)
    }
}

/// A `STREAM` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Stream id.
    pub id: u64,
    /// Stream status keyword (`NEW`, `SUCCEEDED`, `CLOSED`, ...).
    pub status: String,
    /// Zero when the stream is not yet attached.
    pub circuit_id: u64,
    /// `host:port` the stream is for.
    pub target: String,
}

/// A `BW` event: bytes read and written in the last second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandwidthSample {
    /// Bytes read.
    pub read: u64,
    /// Bytes written.
    pub written: u64,
}

/// A Tor log message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Tor runlevel.
    pub runlevel: LogLevel,
    /// Message text, lines joined with `\n`.
    pub message: String,
}

/// Which `STATUS_*` event this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// `STATUS_SERVER`
    Server,
    /// `STATUS_CLIENT`
    Client,
    /// `STATUS_GENERAL`
    General,
}

/// A `STATUS_SERVER`, `STATUS_CLIENT` or `STATUS_GENERAL` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Which status event.
    pub kind: StatusKind,
    /// `NOTICE`, `WARN` or `ERR`.
    pub severity: String,
    /// Status action keyword, e.g. `EXTERNAL_ADDRESS`.
    pub action: String,
    /// `KEY=VALUE` arguments.
    pub arguments: HashMap<String, String>,
}

/// An `ORCONN` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrConnEvent {
    /// Relay reference or `address:port`.
    pub target: String,
    /// `LAUNCHED`, `CONNECTED`, `FAILED`, `CLOSED`, ...
    pub status: String,
}

/// A decoded asynchronous event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Event {
    Circuit(CircuitEvent),
    Stream(StreamEvent),
    Bandwidth(BandwidthSample),
    Log(LogEvent),
    /// Changed options with their new values (`None` when reset).
    ConfChanged(Vec<(String, Option<String>)>),
    Status(StatusEvent),
    NewConsensus(Vec<RelayRecord>),
    OrConn(OrConnEvent),
    Signal(String),
    Unknown { keyword: String, raw: String },
}

impl Event {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Circuit(_) => EventKind::Circ,
            Event::Stream(_) => EventKind::Stream,
            Event::Bandwidth(_) => EventKind::Bw,
            Event::Log(log) => EventKind::Log(log.runlevel),
            Event::ConfChanged(_) => EventKind::ConfChanged,
            Event::Status(status) => match status.kind {
                StatusKind::Server => EventKind::StatusServer,
                StatusKind::Client => EventKind::StatusClient,
                StatusKind::General => EventKind::StatusGeneral,
            },
            Event::NewConsensus(_) => EventKind::NewConsensus,
            Event::OrConn(_) => EventKind::OrConn,
            Event::Signal(_) => EventKind::Signal,
            Event::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Decodes an asynchronous reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when a known event kind is missing required
    /// fields or carries values of the wrong type. A `CIRC` event with a status
    /// this crate does not know decodes to [`Event::Unknown`] instead.
    pub fn from_reply(reply: &Reply) -> Result<Event> {
        let first = reply
            .lines
            .first()
            .ok_or_else(|| Error::Protocol("empty event".to_string()))?;
        let (keyword, rest) = match first.text.split_once(' ') {
            Some((k, r)) => (k, r),
            None => (first.text.as_str(), ""),
        };

        match EventKind::from_keyword(keyword) {
            EventKind::Circ => {
                let status = rest.split_whitespace().nth(1);
                match status {
                    Some(status) if CircuitStatus::from_keyword(status).is_none() => {
                        Ok(unknown_event(keyword, reply))
                    }
                    _ => parse_circ(rest).map(Event::Circuit),
                }
            }
            EventKind::Stream => parse_stream(rest).map(Event::Stream),
            EventKind::Bw => parse_bw(rest).map(Event::Bandwidth),
            EventKind::Log(runlevel) => {
                let message = if first.separator == Separator::Data {
                    first.data.join("\n")
                } else {
                    rest.to_string()
                };
                Ok(Event::Log(LogEvent { runlevel, message }))
            }
            EventKind::ConfChanged => {
                let changed = reply
                    .lines
                    .iter()
                    .skip(1)
                    .filter(|l| !(l.separator == Separator::End && l.text == "OK"))
                    .map(|l| l.key_value())
                    .collect();
                Ok(Event::ConfChanged(changed))
            }
            EventKind::StatusServer => parse_status(StatusKind::Server, rest).map(Event::Status),
            EventKind::StatusClient => parse_status(StatusKind::Client, rest).map(Event::Status),
            EventKind::StatusGeneral => parse_status(StatusKind::General, rest).map(Event::Status),
            EventKind::NewConsensus => {
                let body = first.data.join("\n");
                Ok(Event::NewConsensus(parse_router_statuses(&body)))
            }
            EventKind::OrConn => {
                let mut words = rest.split_whitespace();
                match (words.next(), words.next()) {
                    (Some(target), Some(status)) => Ok(Event::OrConn(OrConnEvent {
                        target: target.to_string(),
                        status: status.to_string(),
                    })),
                    _ => Err(Error::Protocol(format!("malformed ORCONN event: {}", rest))),
                }
            }
            EventKind::Signal => Ok(Event::Signal(rest.trim().to_string())),
            EventKind::Unknown => Ok(unknown_event(keyword, reply)),
        }
    }
}

/// Raw-payload form of an event: every reply line's text, newline separated.
fn unknown_event(keyword: &str, reply: &Reply) -> Event {
    let raw = reply
        .lines
        .iter()
        .map(|line| line.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    Event::Unknown {
        keyword: keyword.to_string(),
        raw,
    }
}

fn parse_id(s: Option<&str>, what: &str) -> Result<u64> {
    s.and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("missing or invalid {}", what)))
}

fn parse_circ(rest: &str) -> Result<CircuitEvent> {
    let mut words = rest.split_whitespace();
    let id = parse_id(words.next(), "circuit id")?;
    let status = CircuitStatus::parse(
        words
            .next()
            .ok_or_else(|| Error::Protocol("CIRC event without status".to_string()))?,
    )?;

    let remaining: Vec<&str> = words.collect();
    let mut path = Vec::new();
    let mut args_start = 0;
    if let Some(first) = remaining.first() {
        if !first.contains('=') || first.starts_with('$') {
            for hop in first.split(',') {
                path.push(RelayRef::parse(hop).map_err(|e| Error::Protocol(e.to_string()))?);
            }
            args_start = 1;
        }
    }

    let (_, arguments) = parse_arguments(&remaining[args_start..].join(" "));
    Ok(CircuitEvent {
        id,
        status,
        path,
        purpose: arguments.get("PURPOSE").cloned(),
    })
}

fn parse_stream(rest: &str) -> Result<StreamEvent> {
    let mut words = rest.split_whitespace();
    let id = parse_id(words.next(), "stream id")?;
    let status = words
        .next()
        .ok_or_else(|| Error::Protocol("STREAM event without status".to_string()))?
        .to_string();
    let circuit_id = parse_id(words.next(), "stream circuit id")?;
    let target = words
        .next()
        .ok_or_else(|| Error::Protocol("STREAM event without target".to_string()))?
        .to_string();
    Ok(StreamEvent {
        id,
        status,
        circuit_id,
        target,
    })
}

fn parse_bw(rest: &str) -> Result<BandwidthSample> {
    let mut words = rest.split_whitespace();
    Ok(BandwidthSample {
        read: parse_id(words.next(), "bytes read")?,
        written: parse_id(words.next(), "bytes written")?,
    })
}

fn parse_status(kind: StatusKind, rest: &str) -> Result<StatusEvent> {
    let (positional, arguments) = parse_arguments(rest);
    let mut positional = positional.into_iter();
    match (positional.next(), positional.next()) {
        (Some(severity), Some(action)) => Ok(StatusEvent {
            kind,
            severity,
            action,
            arguments,
        }),
        _ => Err(Error::Protocol(format!("malformed status event: {}", rest))),
    }
}
