use std::collections::{binary_heap::PeekMut, BinaryHeap};
use std::time::Instant;

use rustc_hash::FxHashMap;

/// Kinds of timeouts needed to run the protocol logic
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// When to send an ack-eliciting probe packet or declare unacked packets lost
    LossDetection,
    /// When a pending acknowledgment must be flushed
    Ack,
    /// When to give up on validating a new path to the peer
    PathValidation,
    /// When to close the connection after no activity
    Idle,
    /// When to send a `PING` frame to keep the connection alive
    KeepAlive,
    /// How long to keep the socket bound after close to absorb late datagrams
    Drain,
    /// When to report an application-requested ping as lost
    Ping,
    /// Zero-length yield between write passes when more data remains
    ExcessWrite,
}

impl Timer {
    pub(crate) const VALUES: [Self; 8] = [
        Self::LossDetection,
        Self::Ack,
        Self::PathValidation,
        Self::Idle,
        Self::KeepAlive,
        Self::Drain,
        Self::Ping,
        Self::ExcessWrite,
    ];
}

/// Keeps track of the nearest deadline for each [`Timer`]
///
/// Re-arming pushes a fresh entry; stale heap entries are purged lazily when
/// they surface at the top.
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerTable {
    most_recent_timeout: FxHashMap<Timer, Instant>,
    timeout_queue: BinaryHeap<TimerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerEntry {
    pub(crate) time: Instant,
    pub(crate) timer: Timer,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // `timeout_queue` is a max heap so we need to reverse the order to
        // efficiently pop the next timeout
        self.time
            .cmp(&other.time)
            .then_with(|| self.timer.cmp(&other.timer))
            .reverse()
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TimerTable {
    /// Sets the timer unconditionally
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.most_recent_timeout.insert(timer, time);
        self.timeout_queue.push(TimerEntry { time, timer });
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.most_recent_timeout.get(&timer).copied()
    }

    pub(crate) fn is_armed(&self, timer: Timer) -> bool {
        self.most_recent_timeout.contains_key(&timer)
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.most_recent_timeout.remove(&timer);
    }

    /// Get the next queued timeout
    ///
    /// Obsolete timers will be purged.
    pub(crate) fn peek(&mut self) -> Option<TimerEntry> {
        while let Some(timer_entry) = self.timeout_queue.peek_mut() {
            if self.most_recent_timeout.get(&timer_entry.timer) != Some(&timer_entry.time) {
                // obsolete timeout
                PeekMut::pop(timer_entry);
                continue;
            }
            return Some(*timer_entry);
        }

        None
    }

    /// Remove the next timer up until `now`, including it
    pub(crate) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        let TimerEntry { time, timer } = self.peek()?;
        if time <= now {
            self.most_recent_timeout.remove(&timer);
            self.timeout_queue.pop();
            return Some(timer);
        }

        None
    }

    /// Cancel every timer except those in `keep`
    pub(crate) fn stop_all_except(&mut self, keep: &[Timer]) {
        self.most_recent_timeout.retain(|timer, _| keep.contains(timer));
    }

    pub(crate) fn reset(&mut self) {
        self.most_recent_timeout.clear();
        self.timeout_queue.clear();
    }
}
