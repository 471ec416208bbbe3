use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::QuicError;
use crate::streams::{StreamDirectionality, StreamInitiator};
use crate::StreamId;

/// Close processing has begun
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct CloseStartedEvent {
    pub close_reason: Option<QuicError>,
}

/// Metadata for one received UDP packet within a receive pass
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ReceivedPacketInfo {
    pub receive_time: Instant,
    pub num_bytes: u64,
    pub tos: u8,
}

/// A batch of packets was received from the socket
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PacketsReceivedEvent {
    pub receive_loop_time: Instant,
    pub num_packets_received: u64,
    pub num_bytes_received: u64,
    pub packets: Vec<ReceivedPacketInfo>,
}

/// A write pass emitted packets
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct PacketsWrittenEvent {
    pub num_packets_written: u64,
    pub num_ack_eliciting_packets_written: u64,
    pub num_bytes_written: u64,
}

/// The sender transitioned into or out of the app-limited state
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct AppLimitedEvent {
    pub writable_bytes: u64,
}

/// Acknowledgements processed during an ingress pass
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct AcksProcessedEvent {
    pub num_ack_events: u64,
    pub srtt: Duration,
}

/// A stream finished its lifecycle and is being reaped
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct StreamCloseEvent {
    pub stream_id: StreamId,
    pub initiator: StreamInitiator,
    pub directionality: StreamDirectionality,
}

/// A knob frame arrived from the peer
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct KnobFrameEvent {
    pub knob_space: u64,
    pub knob_id: u64,
    pub len: usize,
}

/// Observes connection-level events
///
/// All methods default to no-ops so implementations pay only for the events
/// they care about. Observers are invoked synchronously from the transport's
/// loop and must not mutate the observer list reentrantly.
pub trait Observer {
    #[allow(unused_variables)]
    fn close_started(&self, event: &CloseStartedEvent) {}

    /// The UDP socket is about to be closed
    fn closing(&self) {}

    #[allow(unused_variables)]
    fn packets_received(&self, event: &PacketsReceivedEvent) {}

    #[allow(unused_variables)]
    fn packets_written(&self, event: &PacketsWrittenEvent) {}

    #[allow(unused_variables)]
    fn start_writing_from_app_limited(&self, event: &AppLimitedEvent) {}

    #[allow(unused_variables)]
    fn app_rate_limited(&self, event: &AppLimitedEvent) {}

    #[allow(unused_variables)]
    fn acks_processed(&self, event: &AcksProcessedEvent) {}

    #[allow(unused_variables)]
    fn stream_closed(&self, event: &StreamCloseEvent) {}

    #[allow(unused_variables)]
    fn knob_frame_received(&self, event: &KnobFrameEvent) {}
}

/// Holder for registered observers
///
/// Dispatch clones the list first so that an observer adding or removing
/// observers does not invalidate the iteration.
#[derive(Default)]
pub(crate) struct ObserverList {
    observers: Vec<Rc<dyn Observer>>,
}

impl ObserverList {
    pub(crate) fn add(&mut self, observer: Rc<dyn Observer>) {
        self.observers.push(observer);
    }

    pub(crate) fn remove(&mut self, observer: &Rc<dyn Observer>) -> bool {
        let before = self.observers.len();
        self.observers.retain(|o| !Rc::ptr_eq(o, observer));
        self.observers.len() != before
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub(crate) fn for_each(&self, mut f: impl FnMut(&dyn Observer)) {
        if self.observers.is_empty() {
            return;
        }
        let snapshot = self.observers.clone();
        for observer in &snapshot {
            f(&**observer);
        }
    }
}
