//! Rate-limited warning logger.
//!
//! Persistent failures (agent unreachable, misconfigured key) recur every
//! poll. The first occurrence in each window is logged at `warn`, the rest at
//! `debug`.

use std::fmt::Display;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub struct RateLimitedLogger {
    window: Duration,
    last_warn: Mutex<Option<Instant>>,
}

/// Level chosen for one occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warn,
    Debug,
}

impl Default for RateLimitedLogger {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl RateLimitedLogger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_warn: Mutex::new(None),
        }
    }

    /// Returns the level for an occurrence at `now`, opening a new window when
    /// the previous one elapsed.
    pub fn level_at(&self, now: Instant) -> LogLevel {
        let mut last = self
            .last_warn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *last {
            Some(at) if now.saturating_duration_since(at) < self.window => LogLevel::Debug,
            _ => {
                *last = Some(now);
                LogLevel::Warn
            }
        }
    }

    pub fn log(&self, context: &str, error: &dyn Display) {
        match self.level_at(Instant::now()) {
            LogLevel::Warn => warn!(%error, "remote-config: {context}"),
            LogLevel::Debug => debug!(%error, "remote-config: {context}"),
        }
    }
}
