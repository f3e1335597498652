//! Monitor loop: connects to Tor, keeps the [`StateStore`] current and
//! reconnects when the daemon goes away.
//!
//! # Session Lifecycle
//!
//! ```text
//!   ┌──────────────┐  throttled   ┌──────────────┐
//!   │ Reconnector  │ ───────────► │ wait retry_in│
//!   └──────┬───────┘              └──────────────┘
//!          │ session
//!          ▼
//!   ┌──────────────┐   SETEVENTS, GETINFO circuit-status / ns/all,
//!   │ seed store   │   listener ports, relay status
//!   └──────┬───────┘
//!          ▼
//!   ┌──────────────┐   resolver ─┐
//!   │ dispatcher   │   status   ─┼─ periodic tasks, aborted on close
//!   │ run(events)  │   log view ─┤
//!   └──────┬───────┘   summary  ─┘
//!          │ stream ends
//!          ▼
//!   mark_disconnected ──► back to the top
//! ```
//!
//! Derived state survives a disconnect and is only marked stale. The
//! resolver is kept across sessions so connection first-seen times and
//! lookup failover state carry over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, LogLevel};
use crate::dispatcher::{Dispatcher, KindFilter};
use crate::error::{Error, Result};
use crate::events::{CircuitEvent, Event, EventKind};
use crate::lock;
use crate::logdedup::{AbortHandle, LogBuffer, LogEntry};
use crate::logger::plog;
use crate::relay::parse_router_statuses;
use crate::resolver::{GetentLookup, PortConfig, Resolver, ResolverSchedule};
use crate::session::{Credentials, Endpoint, Reconnector, Session};
use crate::status::{effective_bandwidth, relay_flags, PsStats, RelayStatus};
use crate::store::{now_epoch, CircuitInfo, StateStore};
use crate::sysconn::{ResolverCommand, SystemConnections};

/// Version of arm-rs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the deduplicated log view is rebuilt.
const LOG_VIEW_INTERVAL: Duration = Duration::from_secs(1);

/// Event kinds the monitor subscribes to, with Tor logs at or above
/// `runlevel`.
pub fn monitored_events(runlevel: LogLevel) -> Vec<EventKind> {
    let mut kinds = vec![
        EventKind::Circ,
        EventKind::Stream,
        EventKind::Bw,
        EventKind::ConfChanged,
        EventKind::StatusServer,
        EventKind::StatusClient,
        EventKind::StatusGeneral,
        EventKind::NewConsensus,
        EventKind::OrConn,
        EventKind::Signal,
    ];
    kinds.extend(EventKind::log_kinds_from(runlevel));
    kinds
}

/// Loads circuits and consensus relays into the store.
///
/// # Errors
///
/// Fails if Tor rejects `GETINFO circuit-status`. A missing consensus is
/// logged and leaves the relay table as it was.
pub async fn seed_store(session: &Session, store: &StateStore) -> Result<()> {
    let circuits = session.get_info("circuit-status").await?;
    let mut parsed = Vec::new();
    for line in circuits.lines().filter(|l| !l.trim().is_empty()) {
        match CircuitEvent::parse(line) {
            Ok(circ) => parsed.push(CircuitInfo::from(&circ)),
            Err(e) => plog(LogLevel::Info, &format!("Skipping circuit line: {}", e)),
        }
    }
    store.set_circuits(parsed);

    match session.get_info("ns/all").await {
        Ok(body) => store.set_relays(parse_router_statuses(&body)),
        Err(e) => plog(
            LogLevel::Notice,
            &format!("Consensus unavailable, relay lookups disabled: {}", e),
        ),
    }
    Ok(())
}

/// Long-running monitor over a shared [`StateStore`].
pub struct Monitor {
    config: Config,
    store: StateStore,
    logs: Arc<Mutex<LogBuffer>>,
    logs_pushed: Arc<AtomicU64>,
    resolver: Arc<Mutex<Resolver>>,
    abort: AbortHandle,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Creates a monitor using the platform's connection lookup tools.
    pub fn new(config: Config) -> Self {
        let forced = config
            .resolver
            .resolver_override
            .as_deref()
            .and_then(|name| name.parse::<ResolverCommand>().ok());
        let mut resolver = Resolver::new(
            Box::new(SystemConnections::for_system(forced)),
            &config.resolver,
            PortConfig::default(),
        );
        if config.resolver.name_lookups {
            resolver = resolver.with_name_lookup(Box::new(GetentLookup));
        }
        Self::with_resolver(config, resolver)
    }

    /// Creates a monitor around an existing resolver.
    pub fn with_resolver(config: Config, resolver: Resolver) -> Self {
        let logs = LogBuffer::new(config.logs.buffer_limit, config.logs.runlevel);
        Self {
            config,
            store: StateStore::new(),
            logs: Arc::new(Mutex::new(logs)),
            logs_pushed: Arc::new(AtomicU64::new(0)),
            resolver: Arc::new(Mutex::new(resolver)),
            abort: AbortHandle::new(),
        }
    }

    /// The published state.
    pub fn store(&self) -> StateStore {
        self.store.clone()
    }

    /// Reconnects until shutdown or the retry limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unusable endpoint settings, or if Tor was
    /// never reached before the retry limit ran out.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let endpoints = Endpoint::candidates(&self.config)?;
        let mut reconnector =
            Reconnector::new(Duration::from_secs(self.config.session.reconnect_min_secs));
        let mut attempts = 0u32;
        let mut connected = false;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(limit) = self.config.session.retry_limit {
                if attempts >= limit {
                    break;
                }
            }

            let credentials = Credentials::from_config(&self.config);
            let result = match reconnector
                .reconnect(&endpoints, credentials, &self.config.session)
                .await
            {
                Ok(session) => {
                    connected = true;
                    self.session_loop(session, &mut shutdown).await
                }
                Err(Error::ReconnectThrottled { retry_in }) => {
                    tokio::select! {
                        _ = tokio::time::sleep(retry_in) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {}
                    }
                    continue;
                }
                Err(e) => format!("failed: {}", e),
            };

            self.store.mark_disconnected();
            attempts += 1;
            if *shutdown.borrow() {
                break;
            }

            let level = if attempts % 10 == 1 {
                LogLevel::Notice
            } else {
                LogLevel::Info
            };
            plog(
                level,
                &format!("Tor daemon connection {}. Trying again...", result),
            );
        }

        self.abort.abort();
        if !connected {
            return Err(Error::Config("Failed to connect to Tor".to_string()));
        }
        Ok(())
    }

    async fn session_loop(&mut self, session: Session, shutdown: &mut watch::Receiver<bool>) -> String {
        let session = Arc::new(session);
        let Some(events) = session.events() else {
            return "failed: event stream already taken".to_string();
        };

        if let Err(e) = session
            .set_events(&monitored_events(self.config.logs.runlevel))
            .await
        {
            return format!("failed: {}", e);
        }
        if let Err(e) = seed_store(&session, &self.store).await {
            return format!("failed: {}", e);
        }

        let ports = PortConfig::query(&session).await;
        plog(LogLevel::Debug, &format!("Tor listeners: {:?}", ports));
        let status = match RelayStatus::query(&session, &self.store).await {
            Ok(status) => status,
            Err(e) => return format!("failed: {}", e),
        };
        {
            let mut resolver = lock(&self.resolver);
            resolver.set_ports(ports);
            if self.config.resolver.process_pid.is_none() {
                resolver.set_pid(status.pid);
            }
        }
        plog(
            LogLevel::Notice,
            &format!(
                "Monitoring Tor {} ({}), nickname {:?}, auth {}",
                status.version, status.version_status, status.nickname, status.auth_type
            ),
        );
        self.store.set_relay_status(status);
        self.store.mark_connected();

        let dispatcher = Dispatcher::with_store(
            self.store.clone(),
            self.config.session.listener_queue_size,
        );
        let (logs, pushed) = (self.logs.clone(), self.logs_pushed.clone());
        dispatcher.subscribe(
            KindFilter::kinds(EventKind::log_kinds_from(LogLevel::Debug)),
            move |event: &Event| {
                if let Event::Log(log) = event {
                    let entry = LogEntry::new(now_epoch(), log.runlevel, log.message.clone());
                    if lock(&logs).push(entry) {
                        pushed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
        );

        let tasks = vec![
            self.spawn_resolver(),
            self.spawn_status(session.clone()),
            self.spawn_log_view(),
            self.spawn_summary(),
        ];

        let stats = tokio::select! {
            stats = dispatcher.run(events) => stats,
            _ = shutdown.wait_for(|stop| *stop) => {
                session.close().await;
                dispatcher.finish().await;
                dispatcher.stats()
            }
        };

        for task in tasks {
            task.abort();
        }
        plog(
            LogLevel::Info,
            &format!(
                "Event delivery: {} delivered, {} dropped, {} unknown, {} unmatched",
                stats.delivered, stats.dropped, stats.unknown, stats.unmatched
            ),
        );
        "closed".to_string()
    }

    fn spawn_resolver(&self) -> JoinHandle<()> {
        let resolver = self.resolver.clone();
        let store = self.store.clone();
        let mut schedule = ResolverSchedule::new(self.config.resolver.connections_min_rate);

        tokio::spawn(async move {
            loop {
                if !schedule.is_paused() {
                    let (resolver, store) = (resolver.clone(), store.clone());
                    let started = Instant::now();
                    let outcome =
                        tokio::task::spawn_blocking(move || lock(&resolver).resolve(&store)).await;
                    match outcome {
                        Ok(Ok(resolution)) => plog(
                            LogLevel::Debug,
                            &format!(
                                "Resolved {} connections via {}",
                                resolution.entries.len(),
                                resolution.source
                            ),
                        ),
                        Ok(Err(e)) => plog(LogLevel::Info, &e.to_string()),
                        Err(e) => plog(LogLevel::Warn, &format!("Resolver task failed: {}", e)),
                    }
                    schedule.record_lookup(started.elapsed());
                }
                tokio::time::sleep(schedule.interval()).await;
            }
        })
    }

    fn spawn_status(&self, session: Arc<Session>) -> JoinHandle<()> {
        let store = self.store.clone();
        let rate = Duration::from_secs(self.config.status.ps_rate_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rate);
            loop {
                ticker.tick().await;
                refresh_status(&session, &store).await;
            }
        })
    }

    fn spawn_log_view(&self) -> JoinHandle<()> {
        let logs = self.logs.clone();
        let pushed = self.logs_pushed.clone();
        let store = self.store.clone();
        let abort = self.abort.clone();
        let budget = self.config.logs.dedup_budget();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOG_VIEW_INTERVAL);
            let mut published: Option<u64> = None;
            loop {
                ticker.tick().await;
                let current = pushed.load(Ordering::Relaxed);
                if published == Some(current) {
                    continue;
                }
                let (logs, abort) = (logs.clone(), abort.clone());
                let view = tokio::task::spawn_blocking(move || lock(&logs).view(budget, &abort)).await;
                match view {
                    Ok(view) => {
                        // Retry truncated passes on the next tick.
                        if view.truncated {
                            plog(LogLevel::Debug, "Log deduplication ran out of time");
                        } else {
                            published = Some(current);
                        }
                        store.set_log_view(view);
                    }
                    Err(e) => plog(LogLevel::Warn, &format!("Log view task failed: {}", e)),
                }
            }
        })
    }

    fn spawn_summary(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let every = Duration::from_secs(self.config.status.summary_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snap = store.snapshot();
                let (read, written) = snap
                    .bandwidth
                    .map(|bw| (bw.read, bw.written))
                    .unwrap_or((0, 0));
                let source = snap
                    .resolution_source
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".to_string());
                plog(
                    LogLevel::Notice,
                    &format!(
                        "{} circuits, {} connections via {}, {} relays, {} B/s down, {} B/s up, {} log entries",
                        snap.circuits.len(),
                        snap.connections.len(),
                        source,
                        snap.relays.len(),
                        read,
                        written,
                        snap.log_view.entries.len()
                    ),
                );
                if let Some(latest) = snap.log_view.entries.last() {
                    plog(LogLevel::Debug, &format!("Latest Tor log: {}", latest.format()));
                }
            }
        })
    }
}

async fn refresh_status(session: &Session, store: &StateStore) {
    let snap = store.snapshot();
    let Some(mut status) = snap.relay_status.clone() else {
        return;
    };

    if let Some(addr) = snap.external_address {
        status.address = Some(addr.to_string());
    }
    if let Some(fp) = status.fingerprint.clone() {
        match relay_flags(session, store, &fp).await {
            Ok(flags) => status.flags = flags.value,
            Err(e) => plog(LogLevel::Debug, &format!("Flag refresh failed: {}", e)),
        }
    }
    if let Err(e) = effective_bandwidth(session, store).await {
        plog(LogLevel::Debug, &format!("Bandwidth refresh failed: {}", e));
    }
    if let Some(pid) = status.pid {
        status.ps = tokio::task::spawn_blocking(move || PsStats::query(pid))
            .await
            .ok()
            .flatten();
    }
    store.set_relay_status(status);
}

/// Runs the monitor until CTRL+C or the retry limit.
pub async fn run_main(config: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            plog(LogLevel::Notice, "Got CTRL+C. Exiting.");
            shutdown_tx.send_replace(true);
        }
    });

    Monitor::new(config).run(shutdown_rx).await
}
