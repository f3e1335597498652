//! Connection resolution: what is Tor connected to, and why.
//!
//! Each pass lists the monitored process's established connections, ties
//! them to circuits and consensus relays, and produces a sorted table that is
//! fully rebuilt every time.
//!
//! # Resolution Tiers
//!
//! ```text
//!  ┌───────────────┐ fail ┌───────────────┐ fail ┌───────────────┐ fail ┌───────────────┐
//!  │ Process       │ ───► │ ProcessName   │ ───► │ SocketTable   │ ───► │ Consensus     │
//!  │ name + pid    │      │ name, alts    │      │ all sockets   │      │ circuit hops  │
//!  └───────────────┘      └───────────────┘      └───────────────┘      └───────────────┘
//!                                                                              │ fail
//!                                                                              ▼
//!                                                                     Error::Resolution
//! ```
//!
//! An empty result counts as a failure. The socket table tier has no process
//! attribution, so it keeps only sockets that touch one of Tor's listener
//! ports or a consensus relay. The consensus tier has no local corroboration
//! at all: it reports the entry hop of every known circuit.
//!
//! Rows the OS tool printed but that could not be parsed are kept as
//! [`ResolutionSource::Degraded`] entries.
//!
//! # Ordering
//!
//! Entries sort by [`Category`], then newest first, then remote address text,
//! local address text and circuit id. Identical inputs give identical output.
//!
//! # Hostname Lookups
//!
//! Reverse lookups are never made for entry guards or for private, loopback
//! and link-local addresses. See [`should_lookup`].

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use std::time::Duration;

use ipnetwork::IpNetwork;

use crate::config::{LogLevel, ResolverConfig};
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::relay::{RelayRecord, RelayRef};
use crate::session::Session;
use crate::store::{now_epoch, CircuitInfo, Snapshot, StateStore};
use crate::sysconn::{RawConnection, RawRow};

/// Which tier produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionSource {
    /// Listed by pid and process name.
    Process,
    /// Listed by process name only.
    ProcessName,
    /// Unattributed system socket table.
    SocketTable,
    /// Inferred from circuit entry hops.
    Consensus,
    /// The OS row could not be parsed.
    Degraded,
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionSource::Process => "process",
            ResolutionSource::ProcessName => "process name",
            ResolutionSource::SocketTable => "socket table",
            ResolutionSource::Consensus => "consensus",
            ResolutionSource::Degraded => "degraded",
        };
        write!(f, "{}", s)
    }
}

/// Position of a relay within a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitRole {
    /// First hop.
    Entry,
    /// Any hop between the first and the last.
    Middle,
    /// Last hop.
    Exit,
}

/// Connection category, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// SOCKS users or clients using us as a relay.
    Client,
    /// Other relays.
    Relay,
    /// Control port connections.
    Control,
    /// Anything else.
    Unknown,
}

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Accepted on one of our listeners.
    Inbound,
    /// Opened by us.
    Outbound,
}

/// One row of the connection table.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEntry {
    /// Local endpoint. Unknown for consensus and degraded entries.
    pub local: Option<SocketAddr>,
    /// Remote endpoint. Unknown for degraded entries.
    pub remote: Option<SocketAddr>,
    /// Lowest circuit id running through the remote relay.
    pub circuit_id: Option<u64>,
    /// Remote relay's position in that circuit.
    pub role: Option<CircuitRole>,
    /// Who opened it.
    pub direction: Direction,
    /// Display category.
    pub category: Category,
    /// When the resolver first saw it, in epoch seconds.
    pub established_at: f64,
    /// Already open on the first pass, so `established_at` is a lower bound.
    pub estimated: bool,
    /// Tier that produced it.
    pub source: ResolutionSource,
    /// Reverse lookup result.
    pub hostname: Option<String>,
    /// Consensus relay at the remote end.
    pub relay: Option<RelayRef>,
    /// Raw OS row for degraded entries.
    pub detail: Option<String>,
}

/// Output of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Sorted entries.
    pub entries: Vec<ConnectionEntry>,
    /// Tier that succeeded.
    pub source: ResolutionSource,
    /// Addresses handed to the [`NameLookup`] this pass.
    pub naming_attempts: Vec<IpAddr>,
}

/// Lists established TCP connections.
pub trait ConnectionSource: Send {
    /// Connections owned by the named process (and pid when known).
    fn by_process(&mut self, name: &str, pid: Option<u32>) -> Result<Vec<RawRow>>;

    /// Every established connection on the host.
    fn all_established(&mut self) -> Result<Vec<RawRow>>;
}

/// Reverse hostname lookups.
pub trait NameLookup: Send {
    /// Hostname for `ip`, if any.
    fn lookup(&mut self, ip: IpAddr) -> Option<String>;
}

/// Reverse lookups through `getent hosts`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GetentLookup;

impl NameLookup for GetentLookup {
    fn lookup(&mut self, ip: IpAddr) -> Option<String> {
        let output = std::process::Command::new("getent")
            .args(["hosts", &ip.to_string()])
            .stderr(std::process::Stdio::null())
            .output()
            .ok()?;
        String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .nth(1)
            .map(str::to_string)
    }
}

/// Tor's local listener ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortConfig {
    /// ORPort listeners.
    pub or_ports: Vec<u16>,
    /// DirPort listeners.
    pub dir_ports: Vec<u16>,
    /// ControlPort listeners.
    pub control_ports: Vec<u16>,
    /// SocksPort listeners.
    pub socks_ports: Vec<u16>,
}

impl PortConfig {
    /// Parses a `GETINFO net/listeners/*` value such as
    /// `"127.0.0.1:9050" "[::1]:9050"`.
    pub fn parse_listeners(value: &str) -> Vec<u16> {
        let mut ports: Vec<u16> = value
            .split_whitespace()
            .filter_map(|addr| {
                let addr = addr.trim_matches('"');
                addr.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
            })
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Queries the listeners from Tor. Listener kinds Tor does not report
    /// are left empty.
    pub async fn query(session: &Session) -> PortConfig {
        let mut ports = PortConfig::default();
        let targets: [(&str, &mut Vec<u16>); 4] = [
            ("net/listeners/or", &mut ports.or_ports),
            ("net/listeners/dir", &mut ports.dir_ports),
            ("net/listeners/control", &mut ports.control_ports),
            ("net/listeners/socks", &mut ports.socks_ports),
        ];
        for (key, slot) in targets {
            match session.get_info(key).await {
                Ok(value) => *slot = Self::parse_listeners(&value),
                Err(e) => plog(LogLevel::Debug, &format!("GETINFO {} failed: {}", key, e)),
            }
        }
        ports
    }

    /// Returns `true` if `port` is any local listener.
    pub fn is_listener(&self, port: u16) -> bool {
        self.or_ports.contains(&port)
            || self.dir_ports.contains(&port)
            || self.control_ports.contains(&port)
            || self.socks_ports.contains(&port)
    }
}

fn private_networks() -> &'static [IpNetwork] {
    static NETWORKS: OnceLock<Vec<IpNetwork>> = OnceLock::new();
    NETWORKS.get_or_init(|| {
        [
            "0.0.0.0/8",
            "10.0.0.0/8",
            "100.64.0.0/10",
            "127.0.0.0/8",
            "169.254.0.0/16",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "::/128",
            "::1/128",
            "fc00::/7",
            "fe80::/10",
        ]
        .iter()
        .filter_map(|net| net.parse().ok())
        .collect()
    })
}

/// Returns `true` for private, loopback, link-local and unspecified
/// addresses.
pub fn is_private(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    private_networks().iter().any(|net| net.contains(ip))
}

/// Naming filter: hostnames are only looked up for public remotes that are
/// not our entry guards.
pub fn should_lookup(entry: &ConnectionEntry) -> bool {
    if entry.role == Some(CircuitRole::Entry) {
        return false;
    }
    match entry.remote {
        Some(remote) => !is_private(remote.ip()),
        None => false,
    }
}

/// Sorts entries into display order.
pub fn sort_entries(entries: &mut [ConnectionEntry]) {
    fn text(addr: &Option<SocketAddr>) -> String {
        addr.map(|a| a.to_string()).unwrap_or_default()
    }
    entries.sort_by(|a, b| {
        a.category
            .cmp(&b.category)
            .then_with(|| b.established_at.total_cmp(&a.established_at))
            .then_with(|| text(&a.remote).cmp(&text(&b.remote)))
            .then_with(|| text(&a.local).cmp(&text(&b.local)))
            .then_with(|| a.circuit_id.cmp(&b.circuit_id))
            .then_with(|| a.detail.cmp(&b.detail))
    });
}

type SeenKey = (Option<SocketAddr>, Option<SocketAddr>, Option<String>);

/// Resolves connections against Tor's circuits and the consensus.
pub struct Resolver {
    source: Box<dyn ConnectionSource>,
    names: Option<Box<dyn NameLookup>>,
    hostnames: HashMap<IpAddr, Option<String>>,
    process_name: String,
    alternate_names: Vec<String>,
    pid: Option<u32>,
    ports: PortConfig,
    first_seen: HashMap<SeenKey, (f64, bool)>,
    first_pass: bool,
    last_source: Option<ResolutionSource>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("process_name", &self.process_name)
            .field("pid", &self.pid)
            .field("ports", &self.ports)
            .field("tracked", &self.first_seen.len())
            .field("last_source", &self.last_source)
            .finish()
    }
}

impl Resolver {
    /// Creates a resolver without hostname lookups.
    pub fn new(source: Box<dyn ConnectionSource>, config: &ResolverConfig, ports: PortConfig) -> Self {
        Self {
            source,
            names: None,
            hostnames: HashMap::new(),
            process_name: config.process_name.clone(),
            alternate_names: config.alternate_names.clone(),
            pid: config.process_pid,
            ports,
            first_seen: HashMap::new(),
            first_pass: true,
            last_source: None,
        }
    }

    /// Enables hostname lookups.
    pub fn with_name_lookup(mut self, names: Box<dyn NameLookup>) -> Self {
        self.names = Some(names);
        self
    }

    /// Sets the monitored pid.
    pub fn set_pid(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }

    /// Replaces the listener ports.
    pub fn set_ports(&mut self, ports: PortConfig) {
        self.ports = ports;
    }

    /// Tier used by the last successful pass.
    pub fn last_source(&self) -> Option<ResolutionSource> {
        self.last_source
    }

    /// Runs a pass against the store's current facts and publishes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolution`] if every tier failed. The store keeps the
    /// previous table in that case.
    pub fn resolve(&mut self, store: &StateStore) -> Result<Resolution> {
        let resolution = self.resolve_at(&store.snapshot(), now_epoch())?;
        store.set_connections(resolution.entries.clone(), resolution.source);
        Ok(resolution)
    }

    /// Runs a pass against `facts` as if the time were `now`.
    pub fn resolve_at(&mut self, facts: &Snapshot, now: f64) -> Result<Resolution> {
        let (rows, source) = self.enumerate(facts)?;

        if self.last_source != Some(source) {
            if let Some(previous) = self.last_source {
                plog(
                    LogLevel::Notice,
                    &format!("Connection resolution moved from {} to {}", previous, source),
                );
            }
            self.last_source = Some(source);
        }

        let mut entries: Vec<ConnectionEntry> = rows
            .into_iter()
            .map(|row| self.classify(row, source, facts))
            .collect();

        let mut seen = HashSet::new();
        for entry in &mut entries {
            let key: SeenKey = (entry.local, entry.remote, entry.detail.clone());
            let first_pass = self.first_pass;
            let (at, estimated) = *self
                .first_seen
                .entry(key.clone())
                .or_insert((now, first_pass));
            entry.established_at = at;
            entry.estimated = estimated;
            seen.insert(key);
        }
        self.first_seen.retain(|key, _| seen.contains(key));
        self.first_pass = false;

        let mut naming_attempts = Vec::new();
        let mut named = HashSet::new();
        if let Some(names) = self.names.as_mut() {
            for entry in entries.iter_mut().filter(|e| should_lookup(e)) {
                let Some(ip) = entry.remote.map(|r| r.ip()) else {
                    continue;
                };
                let hostname = self.hostnames.entry(ip).or_insert_with(|| {
                    naming_attempts.push(ip);
                    names.lookup(ip)
                });
                entry.hostname = hostname.clone();
                named.insert(ip);
            }
        }
        // Only addresses still connected keep their cached hostname.
        self.hostnames.retain(|ip, _| named.contains(ip));

        sort_entries(&mut entries);
        Ok(Resolution {
            entries,
            source,
            naming_attempts,
        })
    }

    fn enumerate(&mut self, facts: &Snapshot) -> Result<(Vec<Enumerated>, ResolutionSource)> {
        if let Some(pid) = self.pid {
            match self.source.by_process(&self.process_name, Some(pid)) {
                Ok(rows) if !rows.is_empty() => {
                    return Ok((Enumerated::rows(rows), ResolutionSource::Process))
                }
                Ok(_) => plog(LogLevel::Info, "Process lookup found no connections"),
                Err(e) => plog(LogLevel::Info, &format!("Process lookup failed: {}", e)),
            }
        }

        let names: Vec<String> = std::iter::once(self.process_name.clone())
            .chain(self.alternate_names.iter().cloned())
            .collect();
        for name in &names {
            match self.source.by_process(name, None) {
                Ok(rows) if !rows.is_empty() => {
                    return Ok((Enumerated::rows(rows), ResolutionSource::ProcessName))
                }
                Ok(_) => {}
                Err(e) => plog(
                    LogLevel::Debug,
                    &format!("Lookup by name {} failed: {}", name, e),
                ),
            }
        }

        match self.source.all_established() {
            Ok(rows) => {
                let relay_addrs: HashSet<IpAddr> =
                    facts.relays.iter().filter_map(|r| r.address).collect();
                let rows: Vec<RawRow> = rows
                    .into_iter()
                    .filter(|row| match row {
                        RawRow::Parsed(conn) => {
                            self.ports.is_listener(conn.local.port())
                                || relay_addrs.contains(&conn.remote.ip())
                        }
                        RawRow::Unparsed(_) => true,
                    })
                    .collect();
                if rows.iter().any(|r| matches!(r, RawRow::Parsed(_))) {
                    return Ok((Enumerated::rows(rows), ResolutionSource::SocketTable));
                }
                plog(LogLevel::Info, "Socket table has no connections of ours");
            }
            Err(e) => plog(LogLevel::Info, &format!("Socket table lookup failed: {}", e)),
        }

        let hops = consensus_hops(facts);
        if !hops.is_empty() {
            return Ok((hops, ResolutionSource::Consensus));
        }

        Err(Error::Resolution(
            "unable to list connections by process, name, socket table or consensus".to_string(),
        ))
    }

    fn classify(&self, row: Enumerated, source: ResolutionSource, facts: &Snapshot) -> ConnectionEntry {
        let mut entry = ConnectionEntry {
            local: None,
            remote: None,
            circuit_id: None,
            role: None,
            direction: Direction::Outbound,
            category: Category::Unknown,
            established_at: 0.0,
            estimated: false,
            source,
            hostname: None,
            relay: None,
            detail: None,
        };

        let (local, remote) = match row {
            Enumerated::Row(RawRow::Unparsed(raw)) => {
                entry.source = ResolutionSource::Degraded;
                entry.detail = Some(raw);
                return entry;
            }
            Enumerated::Row(RawRow::Parsed(RawConnection { local, remote })) => {
                (Some(local), remote)
            }
            Enumerated::Hop { remote, relay, circuit_id } => {
                entry.remote = Some(remote);
                entry.relay = Some(relay);
                entry.circuit_id = Some(circuit_id);
                entry.role = Some(CircuitRole::Entry);
                entry.category = Category::Relay;
                return entry;
            }
        };
        entry.local = local;
        entry.remote = Some(remote);

        let local_port = local.map(|l| l.port()).unwrap_or(0);
        if self.ports.is_listener(local_port) {
            entry.direction = Direction::Inbound;
        }

        let relay = find_relay(&facts.relays, remote);
        if let Some(relay) = relay {
            entry.relay = Some(relay.as_ref());
            if let Some((id, role)) = circuit_for(&facts.circuits, relay) {
                entry.circuit_id = Some(id);
                entry.role = Some(role);
            }
        }

        entry.category = if self.ports.control_ports.contains(&local_port) {
            Category::Control
        } else if self.ports.socks_ports.contains(&local_port) {
            Category::Client
        } else if relay.is_some() {
            Category::Relay
        } else if self.ports.or_ports.contains(&local_port) {
            Category::Client
        } else {
            Category::Unknown
        };
        entry
    }
}

enum Enumerated {
    Row(RawRow),
    Hop {
        remote: SocketAddr,
        relay: RelayRef,
        circuit_id: u64,
    },
}

impl Enumerated {
    fn rows(rows: Vec<RawRow>) -> Vec<Enumerated> {
        rows.into_iter().map(Enumerated::Row).collect()
    }
}

fn hop_matches(hop: &RelayRef, relay: &RelayRecord) -> bool {
    match (&hop.fingerprint, &relay.fingerprint) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, _) => match (&hop.nickname, &relay.nickname) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        },
        _ => false,
    }
}

/// Consensus relay at `remote`, preferring one whose ORPort matches.
fn find_relay(relays: &[RelayRecord], remote: SocketAddr) -> Option<&RelayRecord> {
    let mut candidates = relays.iter().filter(|r| r.address == Some(remote.ip()));
    let first = candidates.next()?;
    if first.or_port == Some(remote.port()) {
        return Some(first);
    }
    Some(
        candidates
            .find(|r| r.or_port == Some(remote.port()))
            .unwrap_or(first),
    )
}

/// Circuit running through `relay`, with the relay's role in it.
///
/// A relay that is the first hop of any circuit is an entry, attributed to
/// the lowest such circuit id. Otherwise the lowest-id circuit containing it
/// decides.
fn circuit_for(circuits: &[CircuitInfo], relay: &RelayRecord) -> Option<(u64, CircuitRole)> {
    let mut ids: Vec<&CircuitInfo> = circuits.iter().collect();
    ids.sort_by_key(|c| c.id);
    let entry = ids.iter().find(|circ| {
        circ.path
            .first()
            .is_some_and(|hop| hop_matches(hop, relay))
    });
    if let Some(circ) = entry {
        return Some((circ.id, CircuitRole::Entry));
    }
    ids.into_iter().find_map(|circ| {
        let idx = circ.path.iter().position(|hop| hop_matches(hop, relay))?;
        let role = if idx == 0 {
            CircuitRole::Entry
        } else if idx + 1 == circ.path.len() {
            CircuitRole::Exit
        } else {
            CircuitRole::Middle
        };
        Some((circ.id, role))
    })
}

fn consensus_hops(facts: &Snapshot) -> Vec<Enumerated> {
    let mut circuits: Vec<&CircuitInfo> = facts.circuits.iter().collect();
    circuits.sort_by_key(|c| c.id);

    let mut seen = HashSet::new();
    let mut hops = Vec::new();
    for circ in circuits {
        let Some(first) = circ.path.first() else {
            continue;
        };
        let Some(relay) = facts.relays.iter().find(|r| hop_matches(first, r)) else {
            continue;
        };
        let (Some(ip), Some(port)) = (relay.address, relay.or_port) else {
            continue;
        };
        let remote = SocketAddr::new(ip, port);
        if seen.insert(remote) {
            hops.push(Enumerated::Hop {
                remote,
                relay: relay.as_ref(),
                circuit_id: circ.id,
            });
        }
    }
    hops
}

/// Lookups slower than this fraction of the poll interval slow the poll down.
const LOOKUP_TIME_FACTOR: f64 = 100.0;
/// Consecutive slow lookups before the interval grows.
const SLOW_PASSES_BEFORE_BACKOFF: u32 = 3;

/// Poll interval bookkeeping for the resolver task.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverSchedule {
    rate: f64,
    slow_passes: u32,
    paused: bool,
}

impl ResolverSchedule {
    /// Starts at `min_rate` seconds between lookups.
    pub fn new(min_rate: f64) -> Self {
        Self {
            rate: min_rate,
            slow_passes: 0,
            paused: false,
        }
    }

    /// Current interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.rate)
    }

    /// Current interval in seconds.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Records how long a lookup took. Returns `true` if the interval grew.
    pub fn record_lookup(&mut self, elapsed: Duration) -> bool {
        let scaled = elapsed.as_secs_f64() * LOOKUP_TIME_FACTOR;
        if scaled <= self.rate {
            self.slow_passes = 0;
            return false;
        }

        self.slow_passes += 1;
        if self.slow_passes < SLOW_PASSES_BEFORE_BACKOFF {
            return false;
        }

        let new_rate = scaled + 0.5;
        plog(
            LogLevel::Info,
            &format!(
                "connection lookup time increasing to {:.1} seconds per call",
                new_rate
            ),
        );
        self.rate = new_rate;
        self.slow_passes = 0;
        true
    }

    /// Stops polling. Cached results stay published.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes polling.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Returns `true` while paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }
}
