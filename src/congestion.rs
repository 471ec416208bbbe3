//! Logic for controlling the rate at which data is sent

use std::time::{Duration, Instant};

use crate::config::CongestionControlType;

/// Common interface for different congestion controllers
///
/// The algorithms themselves live with the embedding; the connection core
/// only consults window occupancy, drives the app-limited state, and swaps
/// controllers through a [`ControllerFactory`].
pub trait Controller {
    /// One or more packets were just sent
    #[allow(unused_variables)]
    fn on_sent(&mut self, now: Instant, bytes: u64) {}

    /// Packet deliveries were confirmed
    #[allow(unused_variables)]
    fn on_ack(&mut self, now: Instant, bytes: u64, rtt: Duration) {}

    /// Packets were deemed lost or marked congested
    #[allow(unused_variables)]
    fn on_congestion_event(&mut self, now: Instant, lost_bytes: u64) {}

    /// Number of ack-eliciting bytes that may be in flight
    fn window(&self) -> u64;

    /// Bytes the window currently permits sending
    fn writable_bytes(&self) -> u64;

    /// The sender ran out of data before filling the window
    fn set_app_limited(&mut self);

    /// Whether the controller still considers the sender app-limited
    fn is_app_limited(&self) -> bool;

    /// Scale the target bandwidth, used by background mode
    #[allow(unused_variables)]
    fn set_bandwidth_utilization_factor(&mut self, factor: f32) {}

    /// Which algorithm this controller implements
    fn kind(&self) -> CongestionControlType;
}

/// Constructs controllers on demand, e.g. when the application switches
/// algorithms at runtime
pub trait ControllerFactory {
    /// Construct a fresh `Controller`
    fn build(
        &self,
        kind: CongestionControlType,
        mss: u64,
        now: Instant,
    ) -> Box<dyn Controller>;
}
