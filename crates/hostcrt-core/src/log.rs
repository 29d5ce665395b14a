//! Structured event log.
//!
//! Every component records lifecycle decisions as [`EventRecord`]s into a
//! bounded in-memory ring owned by the runtime. With tracing enabled each
//! record is also written to stderr as one JSON line.

use std::collections::VecDeque;
use std::fmt;
use std::io::Write;

use parking_lot::Mutex;
use serde::Serialize;

/// Severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Component that emitted a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Malloc,
    Tls,
    Mutex,
    Thread,
    Runtime,
}

impl Component {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::Tls => "tls",
            Self::Mutex => "mutex",
            Self::Thread => "thread",
            Self::Runtime => "runtime",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    /// Monotonic decision/event id, unique per log.
    pub decision_id: u64,
    /// Correlation id (`hostcrt::<component>::<symbol>::<id>`).
    pub trace_id: String,
    pub level: LogLevel,
    pub component: Component,
    /// Operation name (`allocate`, `lock`, `spawn`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `lazy_create`, `contended_wait`, ...).
    pub event: &'static str,
    /// Handle involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<u64>,
    /// Logical thread identity involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<u64>,
    /// Size value involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl EventRecord {
    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Pending record, completed by [`EventLog::record`].
#[derive(Debug, Clone)]
pub struct Event {
    level: LogLevel,
    component: Component,
    symbol: &'static str,
    event: &'static str,
    handle: Option<u64>,
    thread: Option<u64>,
    size: Option<usize>,
    outcome: &'static str,
    details: String,
}

impl Event {
    #[must_use]
    pub fn new(component: Component, symbol: &'static str, event: &'static str) -> Self {
        Self {
            level: LogLevel::Debug,
            component,
            symbol,
            event,
            handle: None,
            thread: None,
            size: None,
            outcome: "ok",
            details: String::new(),
        }
    }

    #[must_use]
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    #[must_use]
    pub fn handle(mut self, handle: u64) -> Self {
        self.handle = Some(handle);
        self
    }

    #[must_use]
    pub fn thread(mut self, thread: u64) -> Self {
        self.thread = Some(thread);
        self
    }

    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn outcome(mut self, outcome: &'static str) -> Self {
        self.outcome = outcome;
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

struct LogRing {
    records: VecDeque<EventRecord>,
    next_decision_id: u64,
    dropped: u64,
}

/// Bounded, thread-safe event sink.
pub struct EventLog {
    min_level: LogLevel,
    echo: bool,
    capacity: usize,
    ring: Mutex<LogRing>,
}

impl EventLog {
    /// Keeps at most `capacity` records. `trace` lowers the threshold to
    /// [`LogLevel::Trace`] and echoes records to stderr.
    #[must_use]
    pub fn new(capacity: usize, trace: bool) -> Self {
        Self {
            min_level: if trace { LogLevel::Trace } else { LogLevel::Debug },
            echo: trace,
            capacity,
            ring: Mutex::new(LogRing {
                records: VecDeque::with_capacity(capacity.min(1024)),
                next_decision_id: 1,
                dropped: 0,
            }),
        }
    }

    /// Whether a record at `level` would be kept.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Complete and store `event`. Returns its decision id, or `None` when
    /// the level is filtered out.
    pub fn record(&self, event: Event) -> Option<u64> {
        if !self.enabled(event.level) {
            return None;
        }
        let mut ring = self.ring.lock();
        let decision_id = ring.next_decision_id;
        ring.next_decision_id += 1;
        let record = EventRecord {
            decision_id,
            trace_id: format!(
                "hostcrt::{}::{}::{:016x}",
                event.component, event.symbol, decision_id
            ),
            level: event.level,
            component: event.component,
            symbol: event.symbol,
            event: event.event,
            handle: event.handle,
            thread: event.thread,
            size: event.size,
            outcome: event.outcome,
            details: event.details,
        };
        if self.echo {
            if let Ok(line) = record.to_json_line() {
                let _ = writeln!(std::io::stderr().lock(), "{line}");
            }
        }
        if self.capacity == 0 {
            ring.dropped += 1;
            return Some(decision_id);
        }
        if ring.records.len() == self.capacity {
            ring.records.pop_front();
            ring.dropped += 1;
        }
        ring.records.push_back(record);
        Some(decision_id)
    }

    /// Copy of the retained records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.ring.lock().records.iter().cloned().collect()
    }

    /// Remove and return the retained records, oldest first.
    pub fn drain(&self) -> Vec<EventRecord> {
        self.ring.lock().records.drain(..).collect()
    }

    /// Records evicted because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.ring.lock().dropped
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("EventLog")
            .field("min_level", &self.min_level)
            .field("echo", &self.echo)
            .field("capacity", &self.capacity)
            .field("retained", &ring.records.len())
            .field("dropped", &ring.dropped)
            .finish()
    }
}
