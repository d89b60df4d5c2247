//! Change-notification subsystem.
//!
//! Callers register a callback against a key pattern; every mutation is
//! fanned out to the watchers whose pattern matches the key, in creation
//! order. The manager treats callbacks as untrusted: a failing callback is
//! counted, reported on the error channel, and never surfaces to the
//! mutating caller; after enough consecutive failures the watcher is
//! silently skipped for good. A sliding-window rate limit drops excess
//! invocations per watcher.
//!
//! Patterns compile once at registration into a tagged matcher: plain
//! strings match by equality, strings containing `*` become anchored
//! glob regexes, and caller-supplied regexes test the key directly.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::value::Value;

/// Kind of mutation carried by a [`WatchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Set,
    Delete,
    Push,
    Pull,
    Add,
    Subtract,
    Clear,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Clear => "clear",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification payload delivered to watchers and global subscribers.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event: EventKind,
    pub key: String,
    /// New value; `None` for deletions and clears.
    pub value: Option<Value>,
    /// Previous value when the dispatcher knows it.
    pub old_value: Option<Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Out-of-band report for a callback failure.
#[derive(Debug, Clone)]
pub struct WatcherError {
    pub watcher_id: WatcherId,
    pub key: String,
    pub message: String,
    /// Consecutive failures so far, including this one.
    pub consecutive_errors: u32,
    /// Whether this failure disabled the watcher.
    pub disabled: bool,
}

/// Handle returned by [`WatcherManager::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

/// Watcher callback. An `Err` return counts toward the disable threshold.
pub type WatchCallback = Arc<dyn Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync>;

/// Key pattern accepted by [`WatcherManager::watch`].
#[derive(Debug, Clone)]
pub enum WatchPattern {
    /// Exact key, or a glob when it contains `*`.
    Literal(String),
    /// Arbitrary regex tested against the key.
    Regex(Regex),
}

impl From<&str> for WatchPattern {
    fn from(s: &str) -> Self {
        Self::Literal(s.to_string())
    }
}

impl From<String> for WatchPattern {
    fn from(s: String) -> Self {
        Self::Literal(s)
    }
}

impl From<Regex> for WatchPattern {
    fn from(re: Regex) -> Self {
        Self::Regex(re)
    }
}

enum Matcher {
    Exact(String),
    Glob(Regex),
    Pattern(Regex),
}

impl Matcher {
    fn compile(pattern: &WatchPattern) -> anyhow::Result<Self> {
        match pattern {
            WatchPattern::Literal(text) if text.contains('*') => {
                let mut source = String::with_capacity(text.len() + 8);
                source.push('^');
                for ch in text.chars() {
                    if ch == '*' {
                        source.push_str(".*");
                    } else {
                        source.push_str(&regex::escape(&ch.to_string()));
                    }
                }
                source.push('$');
                Ok(Self::Glob(Regex::new(&source)?))
            }
            WatchPattern::Literal(text) => Ok(Self::Exact(text.clone())),
            WatchPattern::Regex(re) => Ok(Self::Pattern(re.clone())),
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(text) => text == key,
            Self::Glob(re) | Self::Pattern(re) => re.is_match(key),
        }
    }
}

struct WatcherState {
    consecutive_errors: u32,
    disabled: bool,
    recent_calls: Vec<Instant>,
}

struct WatcherEntry {
    matcher: Matcher,
    callback: WatchCallback,
    state: Mutex<WatcherState>,
}

/// Safeguard thresholds.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub max_watchers: usize,
    pub max_errors_before_disable: u32,
    pub max_calls_per_window: usize,
    pub rate_limit_window: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_watchers: 1000,
            max_errors_before_disable: 10,
            max_calls_per_window: 1000,
            rate_limit_window: Duration::from_millis(1000),
        }
    }
}

/// Registry and dispatcher for watchers.
pub struct WatcherManager {
    config: WatcherConfig,
    watchers: DashMap<u64, WatcherEntry>,
    next_id: AtomicU64,
    error_tx: broadcast::Sender<WatcherError>,
    event_tx: broadcast::Sender<WatchEvent>,
}

impl WatcherManager {
    #[must_use]
    pub fn new(config: WatcherConfig) -> Self {
        let (error_tx, _) = broadcast::channel(64);
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            watchers: DashMap::new(),
            next_id: AtomicU64::new(1),
            error_tx,
            event_tx,
        }
    }

    /// Register a callback for keys matching `pattern`.
    pub fn watch(
        &self,
        pattern: impl Into<WatchPattern>,
        callback: WatchCallback,
    ) -> anyhow::Result<WatcherId> {
        if self.watchers.len() >= self.config.max_watchers {
            anyhow::bail!(
                "watcher limit reached ({} registered)",
                self.config.max_watchers
            );
        }
        let matcher = Matcher::compile(&pattern.into())?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.insert(
            id,
            WatcherEntry {
                matcher,
                callback,
                state: Mutex::new(WatcherState {
                    consecutive_errors: 0,
                    disabled: false,
                    recent_calls: Vec::new(),
                }),
            },
        );
        debug!(id, "watcher registered");
        Ok(WatcherId(id))
    }

    /// Deregister. Returns whether the watcher existed.
    pub fn unwatch(&self, id: WatcherId) -> bool {
        self.watchers.remove(&id.0).is_some()
    }

    /// Drop all watchers.
    pub fn clear(&self) {
        self.watchers.clear();
    }

    /// Number of registered watchers (including disabled ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Subscribe to the global post-fan-out event channel.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<WatchEvent> {
        self.event_tx.subscribe()
    }

    /// Subscribe to out-of-band callback failure reports.
    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<WatcherError> {
        self.error_tx.subscribe()
    }

    /// Fan a mutation out to matching watchers, then emit the global event.
    pub fn notify(
        &self,
        event: EventKind,
        key: &str,
        value: Option<Value>,
        old_value: Option<Value>,
    ) {
        let payload = WatchEvent {
            event,
            key: key.to_string(),
            value,
            old_value,
            timestamp: unix_millis(),
        };

        // Creation order == ascending id order.
        let mut ids: Vec<u64> = self
            .watchers
            .iter()
            .filter(|entry| entry.value().matcher.matches(key))
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();

        for id in ids {
            // The map guard is not held across the callback so reentrant
            // watch/unwatch calls from inside a callback cannot deadlock.
            let callback = {
                let Some(entry) = self.watchers.get(&id) else {
                    continue;
                };
                if !self.admit(id, &entry) {
                    continue;
                }
                Arc::clone(&entry.callback)
            };
            let result = callback(&payload);
            if let Some(entry) = self.watchers.get(&id) {
                self.settle(id, key, &entry, result);
            }
        }

        let _ = self.event_tx.send(payload);
    }

    /// Disabled / rate-limit gate. Records the invocation timestamp when
    /// the call is admitted.
    fn admit(&self, id: u64, entry: &WatcherEntry) -> bool {
        let mut state = entry.state.lock();
        if state.disabled {
            return false;
        }
        let now = Instant::now();
        let window = self.config.rate_limit_window;
        state.recent_calls.retain(|at| now.duration_since(*at) < window);
        if state.recent_calls.len() >= self.config.max_calls_per_window {
            debug!(id, "watcher rate limit exceeded; dropping invocation");
            return false;
        }
        state.recent_calls.push(now);
        true
    }

    fn settle(&self, id: u64, key: &str, entry: &WatcherEntry, result: anyhow::Result<()>) {
        let mut state = entry.state.lock();
        match result {
            Ok(()) => state.consecutive_errors = 0,
            Err(err) => {
                state.consecutive_errors += 1;
                let disabled = state.consecutive_errors >= self.config.max_errors_before_disable;
                if disabled && !state.disabled {
                    state.disabled = true;
                    warn!(id, errors = state.consecutive_errors, "watcher disabled");
                }
                let _ = self.error_tx.send(WatcherError {
                    watcher_id: WatcherId(id),
                    key: key.to_string(),
                    message: err.to_string(),
                    consecutive_errors: state.consecutive_errors,
                    disabled: state.disabled,
                });
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
