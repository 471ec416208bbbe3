//! Connection-level transport core of a QUIC endpoint.
//!
//! [`QuicTransport`] owns a single QUIC connection's mutable state and drives
//! it between the network (UDP datagrams) and the application (streams,
//! datagrams, callbacks). It is strictly single threaded and performs no I/O
//! of its own: the embedding driver feeds it network data via
//! [`QuicTransport::on_network_data`], expires timers via
//! [`QuicTransport::handle_timeout`], and grants it event-loop turns via
//! [`QuicTransport::process_events`]. Cryptographic handshaking, packet
//! encoding, frame scheduling and loss-detection math live behind the
//! [`WireCodec`] trait; congestion control behind [`congestion::Controller`].

use std::fmt;
use std::ops;
use std::time::Duration;

mod config;
pub use crate::config::{CongestionControlType, TransportSettings};

mod error;
pub use crate::error::{
    ApplicationErrorCode, ErrorCode, LocalErrorCode, QuicError, TransportErrorCode, TransportFault,
};

mod timer;

mod looper;
pub use crate::looper::{LoopDetectorCallback, NoReadReason, NoWriteReason};

pub mod pacing;
pub use crate::pacing::{Pacer, TokenlessPacer};

pub mod congestion;

mod socket;
pub use crate::socket::{
    CmsgMap, EcnCodepoint, NetworkData, ReceivedUdpPacket, SocketTos, UdpSocket,
};

mod qlog;
pub use crate::qlog::{QLogger, TransportSummary};

mod observer;
pub use crate::observer::{
    AcksProcessedEvent, AppLimitedEvent, CloseStartedEvent, KnobFrameEvent, Observer,
    PacketsReceivedEvent, PacketsWrittenEvent, ReceivedPacketInfo, StreamCloseEvent,
};

mod callbacks;
pub use crate::callbacks::{
    ByteEvent, ByteEventCallback, ByteEventCancellation, ByteEventKind, ConnectionCallback,
    ConnectionSetupCallback, DatagramCallback, PacketProcessor, PeekCallback, PingCallback,
    ReadCallback, ThrottlingSignalProvider, WriteCallback,
};

mod streams;
pub use crate::streams::{
    StreamDirectionality, StreamFlowControlState, StreamGroupRetransmissionPolicy, StreamInitiator,
    StreamManager, StreamPriority, StreamRecvState, StreamSendState, StreamState,
};

mod connection;
pub use crate::connection::{
    AckEvent, AckState, AckStates, AppLimitedTracker, CloseState, ConnectionId, ConnectionState,
    ConnectionStats, CryptoState, CryptoStreamState, DatagramState, EcnL4sTracker, EcnState,
    FlowControlInfo, FlowControlState, KnobFrame, LossState, OutstandingPacket, Outstandings,
    PacketNumberSpace, PendingEvents, QuicTransport, StreamTransportInfo, TransportInfo, WireCodec,
};

#[cfg(test)]
mod tests;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

/// Identifier for a stream within a particular connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }

    /// Whether the given node may only receive on this stream
    pub(crate) fn is_receiving_for(self, side: Side) -> bool {
        self.dir() == Dir::Uni && self.initiator() != side
    }

    /// Whether the given node may only send on this stream
    pub(crate) fn is_sending_only_for(self, side: Side) -> bool {
        self.dir() == Dir::Uni && self.initiator() == side
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(f, "{} {}directional stream {}", initiator, dir, self.index())
    }
}

/// Identifier for a group of streams sharing priority treatment
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamGroupId(pub u64);

//
// Useful internal constants
//

/// The minimum duration a timer may be scheduled for
pub(crate) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Multiplier applied to the PTO to obtain the drain period
pub(crate) const DRAIN_FACTOR: u32 = 3;
/// Fraction of srtt used for the delayed-ack timer when ACK_FREQUENCY is not negotiated
pub(crate) const ACK_TIMER_FACTOR: f64 = 0.25;
/// Fraction of the idle interval after which a keepalive ping is scheduled
pub(crate) const KEEPALIVE_FACTOR: f64 = 0.85;
/// Minimum congestion window, in MSS, enforced for BBR-family controllers
pub(crate) const MIN_CWND_IN_MSS_FOR_BBR: u64 = 4;
/// Ack-eliciting app-data packets that must be echoed before ECN validation runs
pub(crate) const ECN_MIN_MARKED_PACKETS: u64 = 10;
/// Knob space reserved for transport-internal knobs
pub const TRANSPORT_KNOB_SPACE: u64 = 0;
