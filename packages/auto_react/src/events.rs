//! Event feed: a bounded history of recent events plus live observers.
//!
//! Every state change in the engine is reported as an [`Event`] through the
//! [`EventBroadcaster`]. Observers that attach later first receive the
//! retained history as one [`FeedMessage::History`] batch and then each new
//! event as it is emitted, with nothing missed or repeated in between.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::gateway::ConnectionPhase;

/// Default number of events retained for replay.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Default per-observer queue depth.
pub const DEFAULT_OBSERVER_BUFFER: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
    /// A pairing code was issued for the session.
    Qr,
    Connection {
        status: ConnectionPhase,
    },
    Disconnected {
        status_code: Option<u16>,
        reason: Option<String>,
    },
    #[serde(rename = "rate-limit")]
    RateLimit {
        backoff: bool,
    },
    Reacted {
        message_id: String,
        emoji: String,
    },
    ReactorStatus(StatusChange),
    ReactorSkip {
        reason: SkipReason,
        message_id: String,
    },
    ReactorError {
        error: String,
    },
}

/// Auto-reactor lifecycle transitions, reported as `reactor_status` events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StatusChange {
    Starting,
    Connected,
    Disconnected { reason: DisconnectReason },
    Reconnecting { attempt: u32, delay_ms: u64 },
    RateLimited { backoff_seconds: u64 },
    Resumed,
    Stopped,
    Exhausted { attempts: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LoggedOut,
    ConnectionLost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyReacted,
    BackingOff,
}

/// What an observer receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    History { events: Vec<Event> },
    Event { event: Event },
}

/// Bounded ring buffer of recent events, oldest evicted first.
#[derive(Debug)]
pub struct EventHistory {
    buffer: VecDeque<Event>,
    capacity: usize,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.capacity == 0 {
            return;
        }
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event);
    }

    /// Retained events in emission order.
    pub fn snapshot(&self) -> Vec<Event> {
        self.buffer.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Receiving end of an attachment to the feed.
pub struct Observer {
    id: ObserverId,
    rx: mpsc::Receiver<FeedMessage>,
}

impl Observer {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Next feed message, `None` once the broadcaster detached this observer.
    pub async fn recv(&mut self) -> Option<FeedMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedMessage> {
        self.rx.try_recv().ok()
    }
}

struct FeedState {
    history: EventHistory,
    observers: HashMap<ObserverId, mpsc::Sender<FeedMessage>>,
    next_observer: u64,
}

/// Publishes events to attached observers and retains recent history.
///
/// History and the observer set sit behind one lock, so an attach never
/// interleaves with an emit.
pub struct EventBroadcaster {
    state: Mutex<FeedState>,
    observer_buffer: usize,
    dropped_observers: AtomicU64,
}

impl EventBroadcaster {
    pub fn new(history_capacity: usize, observer_buffer: usize) -> Self {
        Self {
            state: Mutex::new(FeedState {
                history: EventHistory::new(history_capacity),
                observers: HashMap::new(),
                next_observer: 0,
            }),
            observer_buffer: observer_buffer.max(1),
            dropped_observers: AtomicU64::new(0),
        }
    }

    /// Record an event and deliver it to every observer. Never fails: an
    /// observer whose queue is full or closed is detached.
    pub async fn emit(&self, session_id: &str, kind: EventKind) -> Event {
        let event = Event {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            kind,
        };

        let mut state = self.state.lock().await;
        state.history.push(event.clone());

        let mut failed = Vec::new();
        for (id, tx) in &state.observers {
            let message = FeedMessage::Event {
                event: event.clone(),
            };
            if tx.try_send(message).is_err() {
                failed.push(*id);
            }
        }
        for id in failed {
            state.observers.remove(&id);
            self.dropped_observers.fetch_add(1, Ordering::Relaxed);
            debug!("Detached observer {:?} after failed delivery", id);
        }

        event
    }

    /// Attach a new observer. Its first message is the current history.
    pub async fn attach(&self) -> Observer {
        let (tx, rx) = mpsc::channel(self.observer_buffer);
        let mut state = self.state.lock().await;

        let id = ObserverId(state.next_observer);
        state.next_observer += 1;

        // The queue is fresh, so the history batch always fits
        let _ = tx.try_send(FeedMessage::History {
            events: state.history.snapshot(),
        });
        state.observers.insert(id, tx);

        Observer { id, rx }
    }

    pub async fn detach(&self, id: ObserverId) {
        self.state.lock().await.observers.remove(&id);
    }

    pub async fn history(&self) -> Vec<Event> {
        self.state.lock().await.history.snapshot()
    }

    pub async fn observer_count(&self) -> usize {
        self.state.lock().await.observers.len()
    }

    /// Observers detached because delivery to them failed.
    pub fn dropped_observers(&self) -> u64 {
        self.dropped_observers.load(Ordering::Relaxed)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_OBSERVER_BUFFER)
    }
}
