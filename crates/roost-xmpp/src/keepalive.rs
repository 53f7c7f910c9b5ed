//! Idle-read deadline for bound sessions.
//!
//! A session that stays silent for `interval × max_count` is torn down.
//! Pings and whitespace keepalives push the deadline out again.

use std::time::Duration;

use tokio::time::Instant;

/// Keepalive settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Whether the deadline is armed after bind
    pub enabled: bool,
    /// Expected keepalive interval
    pub interval: Duration,
    /// Intervals that may be missed before teardown
    pub max_count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            max_count: 3,
        }
    }
}

impl KeepaliveConfig {
    /// Time a session may stay silent.
    pub fn window(&self) -> Duration {
        self.interval.saturating_mul(self.max_count)
    }
}

/// A refreshable read deadline.
#[derive(Debug, Clone)]
pub struct IdleDeadline {
    window: Duration,
    deadline: Instant,
}

impl IdleDeadline {
    /// Arm a deadline one window from now, or `None` when disabled.
    pub fn arm(config: &KeepaliveConfig) -> Option<Self> {
        if !config.enabled || config.window().is_zero() {
            return None;
        }
        let window = config.window();
        Some(Self {
            window,
            deadline: Instant::now() + window,
        })
    }

    /// Push the deadline to one window from now.
    pub fn refresh(&mut self) {
        self.deadline = Instant::now() + self.window;
    }

    /// Current deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Length of the window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Whether character data is a whitespace keepalive. Pings that arrive in
/// the same read are framed together, so runs count as well.
pub fn is_whitespace_ping(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| matches!(c, ' ' | '\t' | '\r' | '\n'))
}
