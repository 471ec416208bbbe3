use std::time::{Duration, Instant};

use tracing::trace;

/// The cooperative tasks a connection schedules on its event loop
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) enum LooperId {
    Read,
    Peek,
    Write,
}

/// Why a scheduled read looper pass produced no progress
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NoReadReason {
    ReadOk,
    StaleData,
}

/// Why a scheduled write looper pass produced no packets
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NoWriteReason {
    WriteOk,
    EmptyScheduler,
    SocketBlocked,
}

/// Observes suspicious looper behavior: passes that were scheduled but did
/// nothing, either on the read side (no ack-state change) or the write side
/// (no packets emitted)
pub trait LoopDetectorCallback {
    fn on_suspicious_read_loops(&self, loop_count: u64, reason: NoReadReason);
    fn on_suspicious_write_loops(&self, loop_count: u64, reason: NoWriteReason);
}

/// A cooperative task bound to the event loop, scheduled at most once per turn
///
/// `run` is idempotent while the looper is already scheduled; `stop` cancels
/// any pending pass. The write looper additionally gates its passes on a
/// pacing deadline supplied by the connection's pacing function.
#[derive(Debug)]
pub(crate) struct FunctionLooper {
    id: LooperId,
    running: bool,
    /// Set while a pacing interval keeps the next pass from running
    pacing_deadline: Option<Instant>,
    /// Whether a pacing timer has been installed at all; pacing deadlines are
    /// only honored when it has
    pacing_timer_armed: bool,
    pacing_tick: Duration,
    /// Run the next pass slightly before the pacing deadline lapses
    fire_early: bool,
}

impl FunctionLooper {
    pub(crate) fn new(id: LooperId) -> Self {
        Self {
            id,
            running: false,
            pacing_deadline: None,
            pacing_timer_armed: false,
            pacing_tick: Duration::ZERO,
            fire_early: false,
        }
    }

    /// Schedule the work function to run on following event-loop turns.
    /// Idempotent while already scheduled.
    pub(crate) fn run(&mut self) {
        if !self.running {
            trace!(looper = ?self.id, "run");
        }
        self.running = true;
    }

    /// Cancel any pending schedule
    pub(crate) fn stop(&mut self) {
        if self.running {
            trace!(looper = ?self.id, "stop");
        }
        self.running = false;
        self.pacing_deadline = None;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running
    }

    /// Install the pacing timer the looper consults between passes
    pub(crate) fn set_pacing_timer(&mut self, tick: Duration) {
        self.pacing_timer_armed = true;
        self.pacing_tick = tick;
    }

    pub(crate) fn has_pacing_timer(&self) -> bool {
        self.pacing_timer_armed
    }

    pub(crate) fn set_fire_early(&mut self, fire_early: bool) {
        self.fire_early = fire_early;
    }

    /// Whether a pacing interval is currently holding back the next pass
    pub(crate) fn is_pacing_scheduled(&self) -> bool {
        self.pacing_deadline.is_some()
    }

    pub(crate) fn pacing_deadline(&self) -> Option<Instant> {
        if self.running { self.pacing_deadline } else { None }
    }

    /// Record the delay the pacing function asked for after a pass
    pub(crate) fn schedule_pacing(&mut self, now: Instant, delay: Duration) {
        if !self.pacing_timer_armed || delay.is_zero() {
            self.pacing_deadline = None;
            return;
        }
        let delay = delay.max(self.pacing_tick);
        self.pacing_deadline = Some(now + delay);
    }

    /// Whether the work function should run this turn
    pub(crate) fn due(&self, now: Instant) -> bool {
        if !self.running {
            return false;
        }
        match self.pacing_deadline {
            None => true,
            Some(deadline) if self.fire_early => deadline.saturating_duration_since(now)
                <= self.pacing_tick,
            Some(deadline) => deadline <= now,
        }
    }

    /// Clear the pacing hold once a pass has run
    pub(crate) fn on_pass(&mut self) {
        self.pacing_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_idempotent() {
        let mut looper = FunctionLooper::new(LooperId::Read);
        assert!(!looper.is_running());
        looper.run();
        looper.run();
        assert!(looper.is_running());
        looper.stop();
        assert!(!looper.is_running());
    }

    #[test]
    fn pacing_gates_pass() {
        let now = Instant::now();
        let mut looper = FunctionLooper::new(LooperId::Write);
        looper.run();
        assert!(looper.due(now));

        // Without a pacing timer, delays are ignored
        looper.schedule_pacing(now, Duration::from_millis(5));
        assert!(looper.due(now));

        looper.set_pacing_timer(Duration::from_millis(1));
        looper.schedule_pacing(now, Duration::from_millis(5));
        assert!(!looper.due(now));
        assert!(looper.due(now + Duration::from_millis(5)));

        looper.on_pass();
        assert!(looper.due(now));
    }

    #[test]
    fn fire_early_runs_within_tick() {
        let now = Instant::now();
        let mut looper = FunctionLooper::new(LooperId::Write);
        looper.run();
        looper.set_pacing_timer(Duration::from_millis(2));
        looper.set_fire_early(true);
        looper.schedule_pacing(now, Duration::from_millis(6));
        assert!(!looper.due(now));
        assert!(looper.due(now + Duration::from_millis(4)));
    }

    #[test]
    fn stop_clears_pacing() {
        let now = Instant::now();
        let mut looper = FunctionLooper::new(LooperId::Write);
        looper.run();
        looper.set_pacing_timer(Duration::from_millis(1));
        looper.schedule_pacing(now, Duration::from_millis(10));
        looper.stop();
        assert_eq!(looper.pacing_deadline(), None);
        looper.run();
        assert!(looper.due(now));
    }
}
