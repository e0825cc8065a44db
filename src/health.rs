//! Connection-health state machine.
//!
//! The machine only records facts: what the transport last reported and when
//! the last valid packet arrived. The health state itself is evaluated at a
//! given instant, so staleness is purely time-driven and nothing outside the
//! adapter can force a transition.
//!
//! | Link as reported by transport | Packet age | Health |
//! |---|---|---|
//! | up | ≤ staleness window | `Healthy` |
//! | up | > staleness window | `Stalled` |
//! | dropped, retrying | — | `Reconnecting` |
//! | closed / retries exhausted / never opened | — | `Disconnected` |
//!
//! A valid packet while `Reconnecting` proves the link is back and flips it
//! to up.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealthState {
    Healthy,
    Reconnecting,
    Stalled,
    Disconnected,
}

impl ConnectionHealthState {
    /// `true` while the transport still claims a link (fresh or stale).
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Healthy | Self::Stalled)
    }

    /// Short status line for presentation.
    pub fn label(self) -> &'static str {
        match self {
            Self::Healthy => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stalled => "signal paused",
            Self::Disconnected => "not connected",
        }
    }
}

/// What the transport last said about its link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Idle,
    Up,
    Retrying { attempt: u32 },
    Closed,
}

/// Packet silence tolerated before a live link counts as stalled.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthMonitor {
    link: LinkStatus,
    /// Reference point for staleness: last packet, or link-up time before
    /// the first packet.
    last_activity: Option<Instant>,
    last_packet: Option<Instant>,
    staleness_window: Duration,
}

impl HealthMonitor {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            link: LinkStatus::Idle,
            last_activity: None,
            last_packet: None,
            staleness_window,
        }
    }

    pub fn link(&self) -> LinkStatus {
        self.link
    }

    pub fn last_packet(&self) -> Option<Instant> {
        self.last_packet
    }

    pub fn on_connected(&mut self, now: Instant) {
        self.link = LinkStatus::Up;
        self.last_activity = Some(now);
    }

    pub fn on_packet(&mut self, now: Instant) {
        if matches!(self.link, LinkStatus::Retrying { .. }) {
            self.link = LinkStatus::Up;
        }
        self.last_packet = Some(now);
        self.last_activity = Some(now);
    }

    pub fn on_link_lost(&mut self) {
        if self.link != LinkStatus::Closed {
            self.link = LinkStatus::Retrying { attempt: 0 };
        }
    }

    pub fn on_reconnect_attempt(&mut self, attempt: u32) {
        if self.link != LinkStatus::Closed {
            self.link = LinkStatus::Retrying { attempt };
        }
    }

    pub fn on_reconnected(&mut self, now: Instant) {
        if self.link != LinkStatus::Closed {
            self.on_connected(now);
        }
    }

    /// Retries exhausted or the caller disconnected.
    pub fn on_closed(&mut self) {
        self.link = LinkStatus::Closed;
    }

    pub fn state_at(&self, now: Instant) -> ConnectionHealthState {
        match self.link {
            LinkStatus::Idle | LinkStatus::Closed => ConnectionHealthState::Disconnected,
            LinkStatus::Retrying { .. } => ConnectionHealthState::Reconnecting,
            LinkStatus::Up => match self.last_activity {
                Some(t) if now.saturating_duration_since(t) > self.staleness_window => {
                    ConnectionHealthState::Stalled
                }
                _ => ConnectionHealthState::Healthy,
            },
        }
    }

    /// Time since the last valid packet, if any arrived.
    pub fn since_last_packet(&self, now: Instant) -> Option<Duration> {
        self.last_packet.map(|t| now.saturating_duration_since(t))
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS_WINDOW)
    }
}
