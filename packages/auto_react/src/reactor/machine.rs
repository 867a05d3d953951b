use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::SkipReason;
use crate::gateway::{BatchKind, Disconnect, InboundMessage};

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(30_000);
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);

/// Tunables for every reactor spawned by a registry.
#[derive(Clone, Debug)]
pub struct ReactorSettings {
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub rate_limit_backoff: Duration,
    /// Depth of each reactor's command queue.
    pub command_buffer: usize,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            rate_limit_backoff: DEFAULT_RATE_LIMIT_BACKOFF,
            command_buffer: 32,
        }
    }
}

/// Delay before reconnect `attempt` (1-based): `min(base * 2^(attempt-1), cap)`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(64);
    let millis = base.as_millis().saturating_mul(1u128 << shift);
    let capped = millis.min(cap.as_millis());
    Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactorPhase {
    Idle,
    Starting,
    Connected,
    Reconnecting,
    RateLimited,
    LoggedOut,
    Exhausted,
    Stopped,
}

impl ReactorPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReactorPhase::LoggedOut | ReactorPhase::Exhausted | ReactorPhase::Stopped
        )
    }
}

/// What to do after the connection closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    LoggedOut,
    Exhausted { attempts: u32 },
    Reconnect { attempt: u32, delay: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageDecision {
    Ignore,
    Skip(SkipReason),
    React,
}

/// Connection-level phase. Rate limiting is tracked separately since it
/// outlives reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Link {
    Idle,
    Starting,
    Connected,
    Reconnecting,
    LoggedOut,
    Exhausted,
    Stopped,
}

/// Reconnect, rate-limit and dedup state of one auto-reactor.
///
/// Holds no timers: callers schedule the delays that transitions return.
#[derive(Debug)]
pub struct ReactorMachine {
    link: Link,
    attempts: u32,
    rate_limited: bool,
    reacted: HashSet<String>,
    settings: ReactorSettings,
}

impl ReactorMachine {
    pub fn new(settings: ReactorSettings) -> Self {
        Self {
            link: Link::Idle,
            attempts: 0,
            rate_limited: false,
            reacted: HashSet::new(),
            settings,
        }
    }

    pub fn phase(&self) -> ReactorPhase {
        match self.link {
            Link::Idle => ReactorPhase::Idle,
            Link::Starting => ReactorPhase::Starting,
            Link::Connected if self.rate_limited => ReactorPhase::RateLimited,
            Link::Connected => ReactorPhase::Connected,
            Link::Reconnecting => ReactorPhase::Reconnecting,
            Link::LoggedOut => ReactorPhase::LoggedOut,
            Link::Exhausted => ReactorPhase::Exhausted,
            Link::Stopped => ReactorPhase::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.link, Link::Idle) && !self.phase().is_terminal()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub fn reacted_count(&self) -> usize {
        self.reacted.len()
    }

    pub fn has_reacted(&self, message_id: &str) -> bool {
        self.reacted.contains(message_id)
    }

    pub fn settings(&self) -> &ReactorSettings {
        &self.settings
    }

    /// Idle -> Starting. Returns false if the machine already left Idle.
    pub fn begin_start(&mut self) -> bool {
        if self.link != Link::Idle {
            return false;
        }
        self.link = Link::Starting;
        true
    }

    pub fn on_open(&mut self) {
        if !self.is_running() {
            return;
        }
        self.attempts = 0;
        self.link = Link::Connected;
    }

    pub fn on_close(&mut self, disconnect: &Disconnect) -> CloseOutcome {
        if disconnect.is_logged_out() {
            self.link = Link::LoggedOut;
            return CloseOutcome::LoggedOut;
        }
        if self.attempts >= self.settings.max_reconnect_attempts {
            self.link = Link::Exhausted;
            return CloseOutcome::Exhausted {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        self.link = Link::Reconnecting;
        CloseOutcome::Reconnect {
            attempt: self.attempts,
            delay: backoff_delay(
                self.attempts,
                self.settings.backoff_base,
                self.settings.backoff_cap,
            ),
        }
    }

    /// Enter rate-limit backoff. Returns the backoff to wait, or `None` if
    /// already backing off.
    pub fn on_rate_limited(&mut self) -> Option<Duration> {
        if self.rate_limited || !self.is_running() {
            return None;
        }
        self.rate_limited = true;
        Some(self.settings.rate_limit_backoff)
    }

    /// Leave rate-limit backoff. Returns whether it was active.
    pub fn on_rate_limit_elapsed(&mut self) -> bool {
        std::mem::replace(&mut self.rate_limited, false) && self.is_running()
    }

    pub fn decide(
        &self,
        kind: BatchKind,
        message: &InboundMessage,
        channel_id: &str,
    ) -> MessageDecision {
        if !self.is_running()
            || !kind.is_live()
            || message.key.from_me
            || !message.has_content
            || !message.key.remote_jid.contains(channel_id)
        {
            return MessageDecision::Ignore;
        }
        if self.reacted.contains(&message.key.id) {
            return MessageDecision::Skip(SkipReason::AlreadyReacted);
        }
        if self.rate_limited {
            return MessageDecision::Skip(SkipReason::BackingOff);
        }
        MessageDecision::React
    }

    pub fn record_reaction(&mut self, message_id: &str) {
        self.reacted.insert(message_id.to_string());
    }

    /// Any non-terminal phase -> Stopped. Returns false if already terminal.
    pub fn stop(&mut self) -> bool {
        if self.phase().is_terminal() {
            return false;
        }
        self.link = Link::Stopped;
        self.rate_limited = false;
        true
    }
}
