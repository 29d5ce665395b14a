//! Runtime configuration.
//!
//! Resolved from environment variables:
//! - `HOSTCRT_TRACE`: `1`, `true`, `on` or `yes` echo every event record to
//!   stderr as a JSON line and keep trace-level records in memory.
//! - `HOSTCRT_ON_VIOLATION`: `abort` (default) or `panic`. Selects what happens
//!   after a fatal mutex contract violation has been reported.
//! - `HOSTCRT_HEAP_LIMIT`: maximum live heap bytes. Unset or unparsable means
//!   no limit beyond the host.
//! - `HOSTCRT_EVENT_LOG_CAPACITY`: event records kept in memory (default 4096).
//!
//! Unknown values fall back to defaults; parsing never fails.

/// Environment variable enabling trace output.
pub const ENV_TRACE: &str = "HOSTCRT_TRACE";
/// Environment variable selecting the fatal-violation policy.
pub const ENV_ON_VIOLATION: &str = "HOSTCRT_ON_VIOLATION";
/// Environment variable capping live heap bytes.
pub const ENV_HEAP_LIMIT: &str = "HOSTCRT_HEAP_LIMIT";
/// Environment variable sizing the in-memory event log.
pub const ENV_EVENT_LOG_CAPACITY: &str = "HOSTCRT_EVENT_LOG_CAPACITY";

/// Default number of event records kept in memory.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 4096;
/// Default number of released buffers kept for reuse.
pub const DEFAULT_RECYCLE_LIMIT: usize = 64;

/// What the boundary does after reporting a fatal contract violation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationPolicy {
    /// Terminate the process.
    #[default]
    Abort,
    /// Unwind with a panic carrying the diagnostic. Used by tests.
    Panic,
}

impl ViolationPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "panic" | "unwind" => Self::Panic,
            _ => Self::Abort,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Panic => "panic",
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}

fn parse_size(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok()
}

/// Settings shared by every component of a [`crate::Runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub trace: bool,
    pub violation_policy: ViolationPolicy,
    pub heap_limit: Option<usize>,
    pub event_log_capacity: usize,
    pub recycle_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace: false,
            violation_policy: ViolationPolicy::Abort,
            heap_limit: None,
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            recycle_limit: DEFAULT_RECYCLE_LIMIT,
        }
    }
}

impl RuntimeConfig {
    /// Resolve from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary key lookup.
    ///
    /// Tests use this instead of mutating the process environment.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_TRACE) {
            config.trace = parse_flag(&raw);
        }
        if let Some(raw) = lookup(ENV_ON_VIOLATION) {
            config.violation_policy = ViolationPolicy::from_str_loose(&raw);
        }
        config.heap_limit = lookup(ENV_HEAP_LIMIT).as_deref().and_then(parse_size);
        if let Some(capacity) = lookup(ENV_EVENT_LOG_CAPACITY)
            .as_deref()
            .and_then(parse_size)
        {
            config.event_log_capacity = capacity;
        }
        config
    }

    #[must_use]
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    #[must_use]
    pub fn with_violation_policy(mut self, policy: ViolationPolicy) -> Self {
        self.violation_policy = policy;
        self
    }

    #[must_use]
    pub fn with_heap_limit(mut self, limit: Option<usize>) -> Self {
        self.heap_limit = limit;
        self
    }

    #[must_use]
    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_recycle_limit(mut self, limit: usize) -> Self {
        self.recycle_limit = limit;
        self
    }
}
