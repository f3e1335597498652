//! # arm-rs
//!
//! Core of a live status monitor for a running Tor relay or client.
//!
//! # Overview
//!
//! arm-rs talks to Tor's control port to track circuits, connections,
//! bandwidth and logs, and reconciles what Tor reports with what the
//! operating system says about the process's sockets:
//!
//! - **Control Session** ([`session`], [`protocol`]): one connection carrying
//!   request/reply exchanges and the asynchronous event feed
//! - **Event Dispatch** ([`events`], [`dispatcher`]): typed events fanned out
//!   to kind-filtered listeners with bounded queues
//! - **State Store** ([`store`]): the single shared snapshot, with cache
//!   entries invalidated by event kind
//! - **Connection Resolution** ([`resolver`], [`sysconn`], [`relay`]): OS
//!   socket listings tied to circuits and consensus relays
//! - **Log Deduplication** ([`logdedup`]): budgeted duplicate folding over
//!   Tor's log messages
//! - **Relay Status** ([`status`]): version, ports, flags, bandwidth limits
//!   and process stats
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Configuration management (TOML, CLI, environment) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`protocol`] | Control protocol framing and argument parsing |
//! | [`session`] | Control session, authentication, reconnect throttle |
//! | [`events`] | Event kinds and decoding |
//! | [`dispatcher`] | Event fan-out to listeners |
//! | [`store`] | Shared snapshot and invalidating cache |
//! | [`relay`] | Relay records, consensus parsing, family dedup |
//! | [`sysconn`] | OS connection listing with failover |
//! | [`resolver`] | Connection table construction |
//! | [`logdedup`] | Tor log buffer and deduplication |
//! | [`status`] | Relay header facts |
//! | [`monitor`] | Reconnect loop and periodic tasks |
//! | [`logger`] | Logging infrastructure using tracing |
//!
//! # What This Library Does NOT Do
//!
//! - **Rendering**: no terminal panels or menus; consumers read
//!   [`StateStore::snapshot`]
//! - **Editing torrc**: Tor's settings are only changed over the control
//!   port with [`Session::set_conf`]
//! - **Persistence**: everything lives in memory for the life of the process
//!
//! # Quick Start
//!
//! ## As a Library
//!
//! ```rust,no_run
//! use arm_rs::{Credentials, Endpoint, Session, StateStore};
//!
//! #[tokio::main]
//! async fn main() -> arm_rs::Result<()> {
//!     let session = Session::connect(&Endpoint::Tcp("127.0.0.1:9051".parse().unwrap())).await?;
//!     session.authenticate(Credentials::Null).await?;
//!
//!     let store = StateStore::new();
//!     arm_rs::monitor::seed_store(&session, &store).await?;
//!     println!("{} circuits", store.snapshot().circuits.len());
//!     Ok(())
//! }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Connect to the default control socket or port
//! arm-rs
//!
//! # Connect to a specific control port with a password
//! arm-rs --control-port 9051 --control-pass secret
//!
//! # Generate default configuration file
//! arm-rs --generate_config arm.conf
//! ```
//!
//! # Configuration
//!
//! ```text
//! ┌─────────────────┐
//! │   CLI Arguments │ ◄── Highest priority (overrides all)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Config File   │ ◄── TOML file (default: arm.conf, or ARM_CONFIG)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Defaults     │
//! └─────────────────┘
//! ```
//!
//! See [`Config`] for all available options.
//!
//! # Security Considerations
//!
//! - **Secrets**: control passwords and cookie bytes are zeroized on drop
//!   and never appear in `Debug` output
//! - **No shell**: OS lookup tools are run directly and their output is
//!   filtered in-process
//! - **Hostname lookups**: off by default, and never made for entry guards
//!   or private addresses
//!
//! # See Also
//!
//! - [Tor Control Protocol Specification](https://spec.torproject.org/control-spec) - Protocol reference

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logdedup;
pub mod logger;
pub mod monitor;
pub mod protocol;
pub mod relay;
pub mod resolver;
pub mod session;
pub mod status;
pub mod store;
pub mod sysconn;

pub use config::{
    CliArgs, Config, LogLevel, LogsConfig, ResolverConfig, SessionConfig, StatusConfig,
};
pub use dispatcher::{DispatchStats, Dispatcher, EventHandler, KindFilter, Subscription};
pub use error::{AuthError, Error, Result};
pub use events::{
    BandwidthSample, CircuitEvent, CircuitStatus, Event, EventKind, LogEvent, OrConnEvent,
    StatusEvent, StatusKind, StreamEvent,
};
pub use logdedup::{
    dedup, dedup_until, dedup_with_abort, AbortHandle, DedupResult, DedupStatus, Fingerprint,
    LogBuffer, LogEntry, LogView, LogViewEntry,
};
pub use logger::LogTarget;
pub use monitor::{run_main, Monitor, VERSION};
pub use protocol::{Reply, ReplyLine, Separator};
pub use relay::{dedup_family, dedup_relays, is_valid_fingerprint, RelayRecord, RelayRef};
pub use resolver::{
    Category, CircuitRole, ConnectionEntry, ConnectionSource, Direction, NameLookup, PortConfig,
    Resolution, ResolutionSource, Resolver, ResolverSchedule,
};
pub use session::{
    AuthState, Credentials, Endpoint, EventStream, ProtocolInfo, Reconnector, Session,
};
pub use status::{effective_bandwidth, AuthType, BandwidthLimits, PsStats, RelayStatus};
pub use store::{CacheEntry, CacheTicket, Cached, CircuitInfo, Snapshot, StateStore};
pub use sysconn::{RawConnection, RawRow, ResolverCommand, SystemConnections};

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
