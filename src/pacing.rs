//! Pacing of packet transmissions.

use std::time::{Duration, Instant};

use tracing::warn;

/// Decides how long the write looper must wait before the next burst
pub trait Pacer {
    /// How long to wait before sending the next burst. Zero means a burst may
    /// be written immediately.
    fn time_until_next_write(&self, now: Instant) -> Duration;

    /// Record bytes handed to the socket
    fn on_transmit(&mut self, bytes: u64, now: Instant);

    /// Refresh the pacing rate from the congestion controller's view of the
    /// path
    fn refresh_pacing_rate(&mut self, cwnd: u64, rtt: Duration, now: Instant);

    /// Forget accumulated pacing debt, e.g. when leaving an app-limited period
    fn reset(&mut self);

    /// Cap the pacing rate regardless of what the congestion controller asks
    /// for
    fn set_max_pacing_rate(&mut self, bytes_per_sec: u64);

    /// Scale applied to the RTT when converting a window to a rate, as a
    /// numerator/denominator pair; `startup` applies before the first RTT
    /// sample matures
    fn set_rtt_factor(&mut self, default: (u8, u8), startup: (u8, u8));

    /// Toggle the experimental refill behavior
    fn set_experimental(&mut self, experimental: bool);
}

/// A rate-based pacer that never accumulates tokens across idle periods
///
/// The bucket is sized to one congestion window and refills at a rate
/// slightly faster than one window per RTT; once empty, transmission is
/// blocked until enough refill time has elapsed.
pub struct TokenlessPacer {
    mss: u64,
    capacity: u64,
    tokens: u64,
    prev: Instant,
    rate_bytes_per_sec: u64,
    max_rate_bytes_per_sec: Option<u64>,
    rtt_factor: (u8, u8),
    startup_rtt_factor: (u8, u8),
    has_rtt_sample: bool,
    experimental: bool,
}

impl TokenlessPacer {
    pub fn new(min_cwnd_in_mss: u64, mss: u64, now: Instant) -> Self {
        let capacity = min_cwnd_in_mss.max(1) * mss;
        Self {
            mss,
            capacity,
            tokens: capacity,
            prev: now,
            rate_bytes_per_sec: 0,
            max_rate_bytes_per_sec: None,
            rtt_factor: (4, 5),
            startup_rtt_factor: (1, 2),
            has_rtt_sample: false,
            experimental: false,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.checked_duration_since(self.prev).unwrap_or_else(|| {
            warn!("received a timestamp earlier than a previously recorded time, ignoring");
            Duration::ZERO
        });
        if self.rate_bytes_per_sec == 0 || elapsed.is_zero() {
            return;
        }
        let new_tokens = (self.rate_bytes_per_sec as f64 * elapsed.as_secs_f64()) as u64;
        self.tokens = self.tokens.saturating_add(new_tokens).min(self.capacity);
        self.prev = now;
    }

    fn effective_rate(&self) -> u64 {
        match self.max_rate_bytes_per_sec {
            Some(max) => self.rate_bytes_per_sec.min(max),
            None => self.rate_bytes_per_sec,
        }
    }
}

impl Pacer for TokenlessPacer {
    fn time_until_next_write(&self, now: Instant) -> Duration {
        if self.tokens >= self.mss {
            return Duration::ZERO;
        }
        let rate = self.effective_rate();
        if rate == 0 {
            return Duration::ZERO;
        }
        let elapsed = now.saturating_duration_since(self.prev);
        let deficit = self.mss - self.tokens;
        let wait = Duration::from_secs_f64(deficit as f64 / rate as f64);
        wait.saturating_sub(elapsed)
    }

    fn on_transmit(&mut self, bytes: u64, now: Instant) {
        self.refill(now);
        self.tokens = self.tokens.saturating_sub(bytes);
    }

    fn refresh_pacing_rate(&mut self, cwnd: u64, rtt: Duration, now: Instant) {
        // We disable pacing for extremely large windows
        if cwnd > u64::from(u32::MAX) {
            self.rate_bytes_per_sec = 0;
            self.tokens = self.capacity.max(cwnd);
            return;
        }
        if rtt.is_zero() {
            self.rate_bytes_per_sec = 0;
            return;
        }
        let (num, den) = if self.has_rtt_sample {
            self.rtt_factor
        } else {
            self.startup_rtt_factor
        };
        self.has_rtt_sample = true;
        // Scaling the RTT down speeds the refill up, yielding the "slightly
        // faster than one window per RTT" refill rate
        let scaled_rtt = rtt.mul_f64(num as f64 / den as f64);
        if scaled_rtt.is_zero() {
            self.rate_bytes_per_sec = 0;
            return;
        }
        self.rate_bytes_per_sec = (cwnd as f64 / scaled_rtt.as_secs_f64()) as u64;
        self.capacity = cwnd.max(self.mss);
        if self.experimental {
            // Experimental refill starts each rate change from a full bucket
            self.tokens = self.capacity;
        }
        self.refill(now);
    }

    fn reset(&mut self) {
        self.tokens = self.capacity;
    }

    fn set_max_pacing_rate(&mut self, bytes_per_sec: u64) {
        self.max_rate_bytes_per_sec = Some(bytes_per_sec);
    }

    fn set_rtt_factor(&mut self, default: (u8, u8), startup: (u8, u8)) {
        self.rtt_factor = default;
        self.startup_rtt_factor = startup;
    }

    fn set_experimental(&mut self, experimental: bool) {
        self.experimental = experimental;
    }
}
