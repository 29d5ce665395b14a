//! Runtime: one allocator, context manager, mutex registry and thread
//! registry, sharing one configuration and event log.
//!
//! Runtimes are ordinary values. The C boundary installs one globally;
//! tests build as many isolated ones as they like.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{RuntimeConfig, ViolationPolicy};
use crate::error::{CrtError, Result};
use crate::log::{Component, Event, EventLog, LogLevel};
use crate::malloc::Allocator;
use crate::pthread::{MutexRegistry, ThreadHandle, ThreadRegistry};
use crate::tls::{Tls, TlsManager};

/// What was still alive at teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub leaked_blocks: usize,
    pub leaked_bytes: usize,
    pub live_mutexes: usize,
    pub unjoined_threads: Vec<u64>,
    pub live_contexts: usize,
}

impl TeardownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaked_blocks == 0
            && self.live_mutexes == 0
            && self.unjoined_threads.is_empty()
            && self.live_contexts == 0
    }

    /// Compact JSON form, as logged at teardown.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    log: Arc<EventLog>,
    allocator: Allocator,
    tls: TlsManager,
    mutexes: MutexRegistry,
    threads: ThreadRegistry,
}

impl Runtime {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let log = Arc::new(EventLog::new(config.event_log_capacity, config.trace));
        let runtime = Arc::new(Self {
            allocator: Allocator::new(config.heap_limit, config.recycle_limit, Arc::clone(&log)),
            tls: TlsManager::new(Arc::clone(&log)),
            mutexes: MutexRegistry::new(Arc::clone(&log)),
            threads: ThreadRegistry::new(Arc::clone(&log)),
            log,
            config,
        });
        runtime.log.record(
            Event::new(Component::Runtime, "init", "init")
                .level(LogLevel::Info)
                .details(format!(
                    "on_violation={} heap_limit={:?} trace={}",
                    runtime.config.violation_policy.as_str(),
                    runtime.config.heap_limit,
                    runtime.config.trace
                )),
        );
        runtime
    }

    /// Runtime configured from `HOSTCRT_*` environment variables.
    #[must_use]
    pub fn from_env() -> Arc<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    #[must_use]
    pub fn tls_manager(&self) -> &TlsManager {
        &self.tls
    }

    #[must_use]
    pub fn mutexes(&self) -> &MutexRegistry {
        &self.mutexes
    }

    #[must_use]
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// New logical-thread context bound to this runtime.
    pub fn create_tls(self: &Arc<Self>) -> Result<Tls> {
        self.tls.create(self)
    }

    /// Release a context created by this runtime.
    pub fn destroy_tls(&self, tls: Tls) -> Result<()> {
        if !std::ptr::eq(Arc::as_ptr(tls.runtime()), self) {
            return Err(CrtError::InvalidHandle {
                op: "tls_destroy",
                handle: tls.thread_id().raw(),
            });
        }
        self.tls.destroy(tls)
    }

    /// Run `entry` on a new logical thread. See [`ThreadRegistry`].
    pub fn spawn<F>(self: &Arc<Self>, entry: F) -> Result<ThreadHandle>
    where
        F: FnOnce(&Tls) -> usize + Send + 'static,
    {
        self.threads.spawn(self, entry)
    }

    pub fn join(&self, handle: ThreadHandle) -> Result<usize> {
        self.threads.join(handle)
    }

    pub fn detach(&self, handle: ThreadHandle) -> Result<()> {
        self.threads.detach(handle)
    }

    /// One-line diagnostic for a fatal error raised by `tls`'s thread.
    #[must_use]
    pub fn diagnostic(tls: &Tls, err: &CrtError) -> String {
        format!(
            "hostcrt: fatal {} violation in {} (mutex {:#x}, thread {}): {}",
            err.contract(),
            err.op(),
            err.handle().unwrap_or(0),
            tls.thread_id(),
            err
        )
    }

    /// Report a fatal contract violation and stop, per the configured policy.
    pub fn violation(&self, tls: &Tls, err: &CrtError) -> ! {
        tls.record_error(err);
        let message = Self::diagnostic(tls, err);
        self.log.record(
            Event::new(Component::Runtime, err.op(), "violation")
                .level(LogLevel::Fatal)
                .handle(err.handle().unwrap_or(0))
                .thread(tls.thread_id().raw())
                .outcome(err.contract())
                .details(err.to_string()),
        );
        eprintln!("{message}");
        match self.config.violation_policy {
            ViolationPolicy::Abort => std::process::abort(),
            ViolationPolicy::Panic => panic!("{message}"),
        }
    }

    /// Summarize what is still alive and drop every mutex entry.
    ///
    /// Blocks and contexts are reported, not reclaimed: callers may still
    /// hold their handles.
    pub fn teardown(&self) -> TeardownReport {
        let stats = self.allocator.stats();
        let report = TeardownReport {
            leaked_blocks: stats.live_blocks,
            leaked_bytes: stats.live_bytes,
            live_mutexes: self.mutexes.clear(),
            unjoined_threads: self
                .threads
                .unjoined()
                .into_iter()
                .map(|id| id.raw())
                .collect(),
            live_contexts: self.tls.live(),
        };
        let details = report.to_json();
        self.log.record(
            Event::new(Component::Runtime, "teardown", "teardown")
                .level(if report.is_clean() {
                    LogLevel::Info
                } else {
                    LogLevel::Warn
                })
                .outcome(if report.is_clean() { "clean" } else { "leaks" })
                .details(details),
        );
        report
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("allocator", &self.allocator)
            .field("tls", &self.tls)
            .field("mutexes", &self.mutexes)
            .field("threads", &self.threads)
            .finish()
    }
}
