//! Kind-filtered event fan-out.
//!
//! The [`Dispatcher`] pumps a session's [`EventStream`] into any number of
//! listeners. Each listener owns a bounded queue and a blocking task running
//! its handler, so a slow handler only ever loses its own events.
//!
//! ```text
//!   EventStream ──► run() ──► StateStore::on_event (synchronous)
//!                     │
//!                     ├──try_send──► [queue 1] ──► handler 1 (blocking task)
//!                     ├──try_send──► [queue 2] ──► handler 2 (blocking task)
//!                     └── no match ──► unknown / unmatched counters
//! ```
//!
//! # Guarantees
//!
//! - Each listener sees its events in transport order.
//! - Store invalidation for an event is visible before the event reaches any
//!   listener, and before `run` reads the next event.
//! - A full queue drops the event for that listener only and counts it.
//! - When the stream ends every listener's [`EventHandler::on_end`] runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use arm_rs::dispatcher::{Dispatcher, KindFilter};
//! use arm_rs::events::{Event, EventKind};
//! # async fn example(session: arm_rs::session::Session) {
//! let dispatcher = Dispatcher::new(256);
//! dispatcher.subscribe(KindFilter::kinds([EventKind::Bw]), |event: &Event| {
//!     println!("{:?}", event);
//! });
//! if let Some(stream) = session.events() {
//!     let stats = dispatcher.run(stream).await;
//!     println!("delivered {}", stats.delivered);
//! }
//! # }
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::config::LogLevel;
use crate::events::{Event, EventKind};
use crate::lock;
use crate::logger::plog;
use crate::session::EventStream;
use crate::store::StateStore;

/// Which event kinds a listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindFilter {
    /// Every event, including [`EventKind::Unknown`].
    All,
    /// Only the listed kinds.
    Kinds(HashSet<EventKind>),
}

impl KindFilter {
    /// Builds a [`KindFilter::Kinds`] filter.
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        KindFilter::Kinds(kinds.into_iter().collect())
    }

    /// Returns `true` if events of `kind` pass.
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

/// Receives events on a listener's own blocking task.
pub trait EventHandler: Send + 'static {
    /// Called once per delivered event, in transport order.
    fn on_event(&mut self, event: &Event);

    /// Called once when the event sequence ends or the listener is
    /// unsubscribed.
    fn on_end(&mut self) {}
}

impl<F> EventHandler for F
where
    F: FnMut(&Event) + Send + 'static,
{
    fn on_event(&mut self, event: &Event) {
        self(event)
    }
}

/// Handle returned by [`Dispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events queued to a listener.
    pub delivered: u64,
    /// Events dropped because a listener's queue was full.
    pub dropped: u64,
    /// Unknown-kind events with no [`KindFilter::All`] listener.
    pub unknown: u64,
    /// Known-kind events no listener wanted.
    pub unmatched: u64,
}

struct Listener {
    id: u64,
    filter: KindFilter,
    tx: mpsc::Sender<Event>,
    task: JoinHandle<()>,
}

/// Fans events out to subscribed listeners.
pub struct Dispatcher {
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
    queue_size: usize,
    store: Option<StateStore>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    unknown: AtomicU64,
    unmatched: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &lock(&self.listeners).len())
            .field("queue_size", &self.queue_size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with per-listener queues of `queue_size`.
    pub fn new(queue_size: usize) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_size: queue_size.max(1),
            store: None,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Creates a dispatcher that applies every event to `store` before
    /// fanning it out.
    pub fn with_store(store: StateStore, queue_size: usize) -> Self {
        Self {
            store: Some(store),
            ..Self::new(queue_size)
        }
    }

    /// Registers a handler. Must be called from within a Tokio runtime.
    ///
    /// The handler runs on a thread from Tokio's blocking pool, held until the
    /// listener ends, so each live subscription occupies one blocking slot.
    pub fn subscribe<H: EventHandler>(&self, filter: KindFilter, handler: H) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Event>(self.queue_size);

        let task = tokio::task::spawn_blocking(move || {
            let mut handler = handler;
            while let Some(event) = rx.blocking_recv() {
                handler.on_event(&event);
            }
            handler.on_end();
        });

        lock(&self.listeners).push(Listener {
            id,
            filter,
            tx,
            task,
        });
        Subscription(id)
    }

    /// Removes a listener. Its handler sees the events already queued, then
    /// `on_end`. Returns `false` if the subscription was unknown.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut listeners = lock(&self.listeners);
        match listeners.iter().position(|l| l.id == subscription.0) {
            Some(idx) => {
                listeners.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Applies one event to the store and queues it to matching listeners.
    pub fn dispatch(&self, event: Event) {
        if let Some(ref store) = self.store {
            store.on_event(&event);
        }

        let kind = event.kind();
        let listeners = lock(&self.listeners);
        let mut matched = false;

        for listener in listeners.iter().filter(|l| l.filter.matches(kind)) {
            matched = true;
            match listener.tx.try_send(event.clone()) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    plog(
                        LogLevel::Debug,
                        &format!("Listener {} queue full, dropping {:?} event", listener.id, kind),
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        if !matched {
            if kind == EventKind::Unknown {
                self.unknown.fetch_add(1, Ordering::Relaxed);
            } else {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Pumps `stream` until it ends, then ends every listener and waits for
    /// their handlers to finish.
    pub async fn run(&self, mut stream: EventStream) -> DispatchStats {
        while let Some(event) = stream.next().await {
            self.dispatch(event);
        }
        self.finish().await;
        self.stats()
    }

    /// Ends every listener: queued events drain, then `on_end` runs.
    pub async fn finish(&self) {
        let listeners: Vec<Listener> = lock(&self.listeners).drain(..).collect();
        let mut tasks = Vec::with_capacity(listeners.len());
        for listener in listeners {
            drop(listener.tx);
            tasks.push(listener.task);
        }
        for task in tasks {
            if let Err(e) = task.await {
                plog(LogLevel::Warn, &format!("Event handler panicked: {}", e));
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
        }
    }
}
