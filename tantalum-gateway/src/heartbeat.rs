//! Heartbeat bookkeeping.
//!
//! The core never sleeps; the caller drives heartbeats using the interval
//! delivered by HELLO. This module only tracks the state those heartbeats
//! need: whether the last one was acknowledged, when it was sent, and a small
//! window of recent round-trip times.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of round-trip samples kept in the latency window.
const RECENT_LEN: usize = 5;

/// Tracks heartbeat acknowledgement and latency for one TCP connection.
#[derive(Debug)]
pub struct HeartbeatState {
    interval: Option<Duration>,
    acknowledged: bool,
    last_sent: Option<Instant>,
    recent: VecDeque<Duration>,
}

impl HeartbeatState {
    pub(crate) fn new() -> Self {
        Self {
            interval: None,
            // The first heartbeat of a connection may always be sent.
            acknowledged: true,
            last_sent: None,
            recent: VecDeque::with_capacity(RECENT_LEN),
        }
    }

    /// Forget everything tied to the previous TCP connection.
    pub(crate) fn reset(&mut self) {
        self.interval = None;
        self.acknowledged = true;
        self.last_sent = None;
        self.recent.clear();
    }

    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }

    /// The interval delivered by HELLO, if one has arrived yet.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub(crate) fn mark_sent(&mut self) {
        self.acknowledged = false;
        self.last_sent = Some(Instant::now());
    }

    pub(crate) fn mark_acked(&mut self) {
        self.acknowledged = true;

        if let Some(sent) = self.last_sent.take() {
            if self.recent.len() == RECENT_LEN {
                self.recent.pop_front();
            }
            self.recent.push_back(sent.elapsed());
        }
    }

    /// Whether the last heartbeat sent has been acknowledged.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// Mean of the recent heartbeat round-trip times.
    ///
    /// Returns `None` until the first acknowledgement has been received.
    pub fn latency(&self) -> Option<Duration> {
        if self.recent.is_empty() {
            return None;
        }

        let total: Duration = self.recent.iter().sum();
        Some(total / self.recent.len() as u32)
    }
}
