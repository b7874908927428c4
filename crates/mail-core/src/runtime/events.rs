// ABOUTME: Observable event stream - bounded per-task rings plus a live broadcast feed.
// ABOUTME: The scheduler is the only writer; stream consumers replay the ring then follow live.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events retained per task before the oldest are discarded.
pub const EVENT_RING_CAPACITY: usize = 1000;

const BROADCAST_CAPACITY: usize = 1024;

/// Kind of an observable runtime transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    ToolCall,
    ActionCall,
    ActionComplete,
    BreakpointToolCall,
    TaskComplete,
    TaskError,
    AgentError,
    Ping,
}

/// One record in the event stream.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub task_id: Uuid,
    pub description: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl Event {
    pub fn new(kind: EventKind, task_id: Uuid, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            task_id,
            description: description.into(),
            extra: Value::Null,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

#[derive(Default)]
struct TaskRing {
    events: VecDeque<Event>,
    dropped: u64,
}

/// Append-only event log. Lock is never held across an await.
pub struct EventLog {
    rings: Mutex<HashMap<Uuid, TaskRing>>,
    tx: broadcast::Sender<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            rings: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Record an event: append to the task ring and fan out to any live
    /// subscribers. Overflowing rings discard their oldest event and bump a
    /// counter observable via [`EventLog::dropped`].
    pub fn record(&self, event: Event) {
        {
            let mut rings = self.rings.lock().expect("event ring lock poisoned");
            let ring = rings.entry(event.task_id).or_default();
            if ring.events.len() >= EVENT_RING_CAPACITY {
                ring.events.pop_front();
                ring.dropped += 1;
            }
            ring.events.push_back(event.clone());
        }
        // No receivers is fine; rings retain history for later replay.
        let _ = self.tx.send(event);
    }

    pub fn for_task(&self, task_id: Uuid) -> Vec<Event> {
        self.rings
            .lock()
            .expect("event ring lock poisoned")
            .get(&task_id)
            .map(|ring| ring.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dropped(&self, task_id: Uuid) -> u64 {
        self.rings
            .lock()
            .expect("event ring lock poisoned")
            .get(&task_id)
            .map(|ring| ring.dropped)
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
