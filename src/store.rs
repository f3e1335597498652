//! Shared state: derived facts and the invalidation-aware cache.
//!
//! The [`StateStore`] is the only shared mutable state in the monitor. Every
//! write goes through one mutex, and readers take a [`Snapshot`] under a single
//! acquisition, so no reader ever sees half of an update.
//!
//! # Cache Entries
//!
//! Values fetched from Tor (bandwidth limits, relay flags, ...) are stored as
//! [`CacheEntry`] records tagged with the event kinds that invalidate them:
//!
//! ```text
//!   put("bandwidth/limits", v, [ConfChanged])
//!        │
//!        ▼
//!   ┌──────────────┐   CONF_CHANGED    ┌──────────────┐
//!   │ fresh        │ ────────────────► │ stale        │ ──► caller re-queries, put() again
//!   └──────────────┘   mark_disconnected└──────────────┘
//! ```
//!
//! An entry with no invalidating kinds is only refreshed through
//! [`StateStore::invalidate`]. Stale entries keep their value so consumers can
//! show last-known data with a staleness marker.
//!
//! A read-through query takes a [`CacheTicket`] before asking Tor and stores
//! its answer with [`StateStore::put_if_unchanged`]. If an invalidating event
//! arrived while the query was in flight, the answer is stored stale.
//!
//! # Change Notification
//!
//! Every mutation bumps a generation counter published over a
//! [`tokio::sync::watch`] channel (see [`StateStore::subscribe_changes`]).

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::events::{BandwidthSample, CircuitEvent, CircuitStatus, Event, EventKind, StatusKind};
use crate::lock;
use crate::logdedup::LogView;
use crate::relay::{dedup_relays, RelayRecord, RelayRef};
use crate::resolver::{ConnectionEntry, ResolutionSource};
use crate::status::RelayStatus;

/// Seconds since the Unix epoch.
pub fn now_epoch() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A cached value as returned by [`StateStore::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    /// The value.
    pub value: T,
    /// When it was stored.
    pub computed_at: f64,
    /// Whether an invalidating event (or disconnect) arrived since.
    pub stale: bool,
}

/// One cache slot.
pub struct CacheEntry {
    value: Box<dyn Any + Send + Sync>,
    computed_at: f64,
    invalidated_by: HashSet<EventKind>,
    stale: bool,
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("computed_at", &self.computed_at)
            .field("invalidated_by", &self.invalidated_by)
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

/// Invalidation counters observed before a read-through query.
///
/// See [`StateStore::ticket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTicket {
    kinds: Vec<(EventKind, u64)>,
    resets: u64,
}

/// A live circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitInfo {
    /// Circuit id.
    pub id: u64,
    /// Last reported state.
    pub status: CircuitStatus,
    /// Hops, entry first.
    pub path: Vec<RelayRef>,
    /// Circuit purpose.
    pub purpose: Option<String>,
}

impl From<&CircuitEvent> for CircuitInfo {
    fn from(event: &CircuitEvent) -> Self {
        Self {
            id: event.id,
            status: event.status,
            path: event.path.clone(),
            purpose: event.purpose.clone(),
        }
    }
}

/// A consistent copy of the published state.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Bumped on every mutation.
    pub generation: u64,
    /// Whether a control session is currently up.
    pub connected: bool,
    /// Set while disconnected: everything below is last-known data.
    pub stale: bool,
    /// Live circuits by ascending id.
    pub circuits: Vec<CircuitInfo>,
    /// Deduplicated consensus relays.
    pub relays: Arc<Vec<RelayRecord>>,
    /// Latest bandwidth sample.
    pub bandwidth: Option<BandwidthSample>,
    /// Address Tor reported as our external one.
    pub external_address: Option<IpAddr>,
    /// Last resolver pass, sorted.
    pub connections: Arc<Vec<ConnectionEntry>>,
    /// Tier that produced `connections`.
    pub resolution_source: Option<ResolutionSource>,
    /// Deduplicated log view.
    pub log_view: Arc<LogView>,
    /// Header facts about the relay.
    pub relay_status: Option<RelayStatus>,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, CacheEntry>,
    circuits: BTreeMap<u64, CircuitInfo>,
    relays: Arc<Vec<RelayRecord>>,
    relay_index: HashMap<String, usize>,
    bandwidth: Option<BandwidthSample>,
    external_address: Option<IpAddr>,
    connections: Arc<Vec<ConnectionEntry>>,
    resolution_source: Option<ResolutionSource>,
    log_view: Arc<LogView>,
    relay_status: Option<RelayStatus>,
    connected: bool,
    stale: bool,
    generation: u64,
    kind_epochs: HashMap<EventKind, u64>,
    resets: u64,
}

impl StoreState {
    fn ticket(&self, invalidated_by: &[EventKind]) -> CacheTicket {
        CacheTicket {
            kinds: invalidated_by
                .iter()
                .map(|kind| (*kind, self.kind_epochs.get(kind).copied().unwrap_or(0)))
                .collect(),
            resets: self.resets,
        }
    }

    fn set_relays(&mut self, relays: Vec<RelayRecord>) {
        let relays = dedup_relays(relays);
        self.relay_index = relays
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.fingerprint.clone().map(|fp| (fp, i)))
            .collect();
        self.relays = Arc::new(relays);
    }
}

/// Handle to the shared state. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct StateStore {
    state: Arc<Mutex<StoreState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("StateStore")
            .field("generation", &state.generation)
            .field("entries", &state.entries.len())
            .field("connected", &state.connected)
            .finish()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Creates an empty, disconnected store.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            changes: Arc::new(tx),
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let (result, generation) = {
            let mut state = lock(&self.state);
            let result = f(&mut state);
            state.generation += 1;
            (result, state.generation)
        };
        self.changes.send_replace(generation);
        result
    }

    /// Reads a cached value.
    ///
    /// Returns `None` if the key is absent or holds a different type.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<Cached<T>> {
        let state = lock(&self.state);
        let entry = state.entries.get(key)?;
        let value = entry.value.downcast_ref::<T>()?.clone();
        Some(Cached {
            value,
            computed_at: entry.computed_at,
            stale: entry.stale,
        })
    }

    /// Stores a fresh value. An empty `invalidated_by` means manual refresh
    /// only.
    pub fn put<T: Any + Send + Sync>(&self, key: &str, value: T, invalidated_by: &[EventKind]) {
        let entry = CacheEntry {
            value: Box::new(value),
            computed_at: now_epoch(),
            invalidated_by: invalidated_by.iter().copied().collect(),
            stale: false,
        };
        self.mutate(|state| {
            state.entries.insert(key.to_string(), entry);
        });
    }

    /// Records the invalidation counters for `invalidated_by`. Take it before
    /// querying Tor and hand it to [`put_if_unchanged`](Self::put_if_unchanged).
    pub fn ticket(&self, invalidated_by: &[EventKind]) -> CacheTicket {
        lock(&self.state).ticket(invalidated_by)
    }

    /// Stores a value computed after `ticket` was taken.
    ///
    /// The entry is fresh only if no event of its invalidating kinds, no
    /// manual invalidation and no disconnect happened since the ticket;
    /// otherwise it is stored stale so the next read queries again.
    pub fn put_if_unchanged<T: Any + Clone + Send + Sync>(
        &self,
        key: &str,
        value: T,
        invalidated_by: &[EventKind],
        ticket: &CacheTicket,
    ) -> Cached<T> {
        let computed_at = now_epoch();
        self.mutate(|state| {
            let stale = state.ticket(invalidated_by) != *ticket;
            state.entries.insert(
                key.to_string(),
                CacheEntry {
                    value: Box::new(value.clone()),
                    computed_at,
                    invalidated_by: invalidated_by.iter().copied().collect(),
                    stale,
                },
            );
            Cached {
                value,
                computed_at,
                stale,
            }
        })
    }

    /// Marks one entry stale. Returns `false` if the key is absent.
    pub fn invalidate(&self, key: &str) -> bool {
        self.mutate(|state| {
            state.resets += 1;
            match state.entries.get_mut(key) {
                Some(entry) => {
                    entry.stale = true;
                    true
                }
                None => false,
            }
        })
    }

    /// Applies an event: invalidates matching entries and folds in facts.
    pub fn on_event(&self, event: &Event) {
        let kind = event.kind();
        self.mutate(|state| {
            *state.kind_epochs.entry(kind).or_insert(0) += 1;
            for entry in state.entries.values_mut() {
                if entry.invalidated_by.contains(&kind) {
                    entry.stale = true;
                }
            }

            match event {
                Event::Circuit(circ) => {
                    if circ.status.is_terminal() {
                        state.circuits.remove(&circ.id);
                    } else {
                        state.circuits.insert(circ.id, CircuitInfo::from(circ));
                    }
                }
                Event::NewConsensus(relays) => state.set_relays(relays.clone()),
                Event::Bandwidth(sample) => state.bandwidth = Some(*sample),
                Event::Status(status)
                    if status.kind == StatusKind::Server && status.action == "EXTERNAL_ADDRESS" =>
                {
                    if let Some(addr) = status.arguments.get("ADDRESS").and_then(|a| a.parse().ok())
                    {
                        state.external_address = Some(addr);
                    }
                }
                _ => {}
            }
        });
    }

    /// Replaces the circuit table, e.g. from `GETINFO circuit-status`.
    pub fn set_circuits(&self, circuits: Vec<CircuitInfo>) {
        self.mutate(|state| {
            state.circuits = circuits
                .into_iter()
                .filter(|c| !c.status.is_terminal())
                .map(|c| (c.id, c))
                .collect();
        });
    }

    /// Replaces the relay records, e.g. from `GETINFO ns/all`.
    pub fn set_relays(&self, relays: Vec<RelayRecord>) {
        self.mutate(|state| state.set_relays(relays));
    }

    /// Looks up a consensus relay by fingerprint.
    pub fn relay(&self, fingerprint: &str) -> Option<RelayRecord> {
        let state = lock(&self.state);
        let idx = *state.relay_index.get(&fingerprint.to_ascii_uppercase())?;
        state.relays.get(idx).cloned()
    }

    /// Publishes a resolver pass.
    pub fn set_connections(&self, entries: Vec<ConnectionEntry>, source: ResolutionSource) {
        self.mutate(|state| {
            state.connections = Arc::new(entries);
            state.resolution_source = Some(source);
        });
    }

    /// Publishes a deduplicated log view.
    pub fn set_log_view(&self, view: LogView) {
        self.mutate(|state| state.log_view = Arc::new(view));
    }

    /// Publishes relay header facts.
    pub fn set_relay_status(&self, status: RelayStatus) {
        self.mutate(|state| state.relay_status = Some(status));
    }

    /// Marks every derived fact stale without clearing anything.
    pub fn mark_disconnected(&self) {
        self.mutate(|state| {
            state.connected = false;
            state.stale = true;
            state.resets += 1;
            for entry in state.entries.values_mut() {
                entry.stale = true;
            }
        });
    }

    /// Records a fresh session. Cache entries stay stale until re-put.
    pub fn mark_connected(&self) {
        self.mutate(|state| {
            state.connected = true;
            state.stale = false;
        });
    }

    /// Copies the published state under one lock acquisition.
    pub fn snapshot(&self) -> Snapshot {
        let state = lock(&self.state);
        Snapshot {
            generation: state.generation,
            connected: state.connected,
            stale: state.stale,
            circuits: state.circuits.values().cloned().collect(),
            relays: state.relays.clone(),
            bandwidth: state.bandwidth,
            external_address: state.external_address,
            connections: state.connections.clone(),
            resolution_source: state.resolution_source,
            log_view: state.log_view.clone(),
            relay_status: state.relay_status.clone(),
        }
    }

    /// Receiver that changes whenever the store does.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use crate::events::{LogEvent, StatusEvent};

    fn circ(id: u64, status: CircuitStatus) -> Event {
        Event::Circuit(CircuitEvent {
            id,
            status,
            path: vec![RelayRef::parse("$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap()],
            purpose: None,
        })
    }

    #[test]
    fn test_selective_invalidation() {
        let store = StateStore::new();
        store.put("bandwidth/limits", 100u64, &[EventKind::ConfChanged]);
        store.put("relay/flags", vec!["Guard".to_string()], &[EventKind::NewConsensus]);
        store.put("manual", 1u8, &[]);

        store.on_event(&Event::ConfChanged(vec![("BandwidthRate".to_string(), None)]));

        assert!(store.get::<u64>("bandwidth/limits").unwrap().stale);
        assert!(!store.get::<Vec<String>>("relay/flags").unwrap().stale);
        assert!(!store.get::<u8>("manual").unwrap().stale);

        store.on_event(&Event::NewConsensus(Vec::new()));
        assert!(store.get::<Vec<String>>("relay/flags").unwrap().stale);
        assert!(!store.get::<u8>("manual").unwrap().stale);

        assert!(store.invalidate("manual"));
        assert!(store.get::<u8>("manual").unwrap().stale);
        assert!(!store.invalidate("missing"));
    }

    #[test]
    fn test_put_refreshes_and_type_mismatch() {
        let store = StateStore::new();
        store.put("k", 1u32, &[EventKind::Bw]);
        store.on_event(&Event::Bandwidth(BandwidthSample::default()));
        assert!(store.get::<u32>("k").unwrap().stale);

        store.put("k", 2u32, &[EventKind::Bw]);
        let cached = store.get::<u32>("k").unwrap();
        assert_eq!(cached.value, 2);
        assert!(!cached.stale);
        assert!(store.get::<String>("k").is_none());
    }

    #[test]
    fn test_put_if_unchanged() {
        let store = StateStore::new();

        let ticket = store.ticket(&[EventKind::ConfChanged]);
        store.on_event(&Event::Bandwidth(BandwidthSample { read: 1, written: 2 }));
        let fresh = store.put_if_unchanged("a", 1u32, &[EventKind::ConfChanged], &ticket);
        assert!(!fresh.stale);

        let ticket = store.ticket(&[EventKind::ConfChanged]);
        store.on_event(&Event::ConfChanged(vec![]));
        let raced = store.put_if_unchanged("a", 2u32, &[EventKind::ConfChanged], &ticket);
        assert!(raced.stale);
        let cached = store.get::<u32>("a").unwrap();
        assert_eq!(cached.value, 2);
        assert!(cached.stale);

        let ticket = store.ticket(&[EventKind::ConfChanged]);
        store.mark_disconnected();
        assert!(store.put_if_unchanged("a", 3u32, &[EventKind::ConfChanged], &ticket).stale);
    }

    #[test]
    fn test_circuit_table_tracks_events() {
        let store = StateStore::new();
        store.on_event(&circ(2, CircuitStatus::Launched));
        store.on_event(&circ(1, CircuitStatus::Built));
        store.on_event(&circ(2, CircuitStatus::Built));

        let snap = store.snapshot();
        assert_eq!(snap.circuits.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(snap.circuits[1].status, CircuitStatus::Built);

        store.on_event(&circ(1, CircuitStatus::Closed));
        assert_eq!(store.snapshot().circuits.len(), 1);
    }

    #[test]
    fn test_external_address_and_relays() {
        let store = StateStore::new();
        let mut arguments = HashMap::new();
        arguments.insert("ADDRESS".to_string(), "203.0.113.9".to_string());
        store.on_event(&Event::Status(StatusEvent {
            kind: StatusKind::Server,
            severity: "NOTICE".to_string(),
            action: "EXTERNAL_ADDRESS".to_string(),
            arguments,
        }));
        assert_eq!(
            store.snapshot().external_address,
            Some("203.0.113.9".parse().unwrap())
        );

        let fp = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let relay = RelayRecord {
            fingerprint: Some(fp.to_string()),
            nickname: Some("relay1".to_string()),
            ..Default::default()
        };
        store.on_event(&Event::NewConsensus(vec![relay.clone(), relay]));
        assert_eq!(store.snapshot().relays.len(), 1);
        assert_eq!(
            store.relay(&fp.to_lowercase()).unwrap().nickname.as_deref(),
            Some("relay1")
        );
    }

    #[test]
    fn test_disconnect_marks_stale_without_clearing() {
        let store = StateStore::new();
        store.mark_connected();
        store.put("bandwidth/limits", 5u64, &[EventKind::ConfChanged]);
        store.on_event(&Event::Bandwidth(BandwidthSample { read: 1, written: 2 }));

        store.mark_disconnected();
        let snap = store.snapshot();
        assert!(snap.stale);
        assert!(!snap.connected);
        assert!(snap.bandwidth.is_some());
        let cached = store.get::<u64>("bandwidth/limits").unwrap();
        assert!(cached.stale);
        assert_eq!(cached.value, 5);

        store.mark_connected();
        assert!(!store.snapshot().stale);
        assert!(store.get::<u64>("bandwidth/limits").unwrap().stale);
    }

    #[test]
    fn test_log_events_do_not_touch_facts() {
        let store = StateStore::new();
        store.put("k", 1u8, &[EventKind::Log(LogLevel::Warn)]);
        store.on_event(&Event::Log(LogEvent {
            runlevel: LogLevel::Notice,
            message: "hello".to_string(),
        }));
        assert!(!store.get::<u8>("k").unwrap().stale);
    }

    #[tokio::test]
    async fn test_change_notification() {
        let store = StateStore::new();
        let mut changes = store.subscribe_changes();
        let before = *changes.borrow_and_update();

        store.put("k", 1u8, &[]);
        changes.changed().await.unwrap();
        assert!(*changes.borrow_and_update() > before);
        assert_eq!(store.snapshot().generation, *changes.borrow());
    }
}
