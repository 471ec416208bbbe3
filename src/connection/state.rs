use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::config::TransportSettings;
use crate::connection::datagrams::DatagramState;
use crate::connection::spaces::{AckEvent, AckStates, Outstandings};
use crate::error::{ApplicationErrorCode, QuicError};
use crate::socket::SocketTos;
use crate::streams::StreamManager;
use crate::{Side, StreamId};

/// Externally visible lifecycle of the transport
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseState {
    Open,
    /// Streams are draining; no new work is accepted
    GracefulClosing,
    Closed,
}

/// QUIC connection identifier, up to twenty bytes
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; 20],
}

impl ConnectionId {
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= 20);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; 20],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Debug>::fmt(self, f)
    }
}

/// RTT estimate and lifetime transmission totals
#[derive(Debug, Clone)]
pub struct LossState {
    pub srtt: Duration,
    pub rttvar: Duration,
    /// Minimum RTT observed over the connection
    pub mrtt: Duration,
    pub latest_rtt: Duration,
    pub total_bytes_sent: u64,
    pub total_bytes_recvd: u64,
    pub total_packets_sent: u64,
    pub total_ack_eliciting_packets_sent: u64,
    pub total_bytes_retransmitted: u64,
    pub total_stream_bytes_cloned: u64,
    pub total_bytes_cloned: u64,
    pub total_packets_spuriously_marked_lost: u64,
    pub inflight_bytes: u64,
    pub pto_count: u32,
    pub rtx_count: u32,
    pub reordering_threshold: u32,
}

impl Default for LossState {
    fn default() -> Self {
        Self {
            srtt: Duration::ZERO,
            rttvar: Duration::ZERO,
            mrtt: Duration::MAX,
            latest_rtt: Duration::ZERO,
            total_bytes_sent: 0,
            total_bytes_recvd: 0,
            total_packets_sent: 0,
            total_ack_eliciting_packets_sent: 0,
            total_bytes_retransmitted: 0,
            total_stream_bytes_cloned: 0,
            total_bytes_cloned: 0,
            total_packets_spuriously_marked_lost: 0,
            inflight_bytes: 0,
            pto_count: 0,
            rtx_count: 0,
            reordering_threshold: 3,
        }
    }
}

/// Connection-level flow control bookkeeping
#[derive(Debug, Clone, Default)]
pub struct FlowControlState {
    /// Window we grant the peer on updates
    pub window_size: u64,
    /// Largest cumulative offset the peer allows us to send
    pub peer_advertised_max_offset: u64,
    /// Sum of bytes put on the wire across all streams
    pub sum_cur_write_offset: u64,
    /// Sum of largest receive offsets observed across all streams
    pub sum_max_observed_offset: u64,
    /// Sum of bytes buffered for sending across all streams
    pub sum_cur_stream_buffer_len: u64,
    /// Largest cumulative offset we have granted the peer
    pub advertised_max_offset: u64,
}

impl FlowControlState {
    /// Bytes connection-level flow control still permits the application to
    /// enqueue
    pub fn send_flow_control_bytes(&self) -> u64 {
        self.peer_advertised_max_offset
            .saturating_sub(self.sum_cur_write_offset + self.sum_cur_stream_buffer_len)
    }
}

/// A knob frame: out-of-band integer-keyed blob for endpoint-specific tuning
#[derive(Debug, Clone)]
pub struct KnobFrame {
    pub knob_space: u64,
    pub knob_id: u64,
    pub blob: Bytes,
}

/// Work queued for the next write pass or dispatch turn
#[derive(Debug, Clone, Default)]
pub struct PendingEvents {
    /// Send a PING on the next write
    pub send_ping: bool,
    /// A PING arrived and the ping callback must hear about it
    pub notify_ping_received: bool,
    /// Our outstanding PING was acknowledged
    pub cancel_ping_timeout: bool,
    /// An ACK must be flushed within the ack delay
    pub schedule_ack_timeout: bool,
    /// A path challenge is in flight and the validation timer must run
    pub schedule_path_validation_timeout: bool,
    /// Packet number space exhausted; the connection must go down
    pub close_transport: bool,
    /// Probe packets to send per packet number space
    pub num_probe_packets: [u64; 3],
    /// RESET_STREAM frames queued by the send-side state machine
    pub resets: FxHashMap<StreamId, ApplicationErrorCode>,
    /// STOP_SENDING frames queued for transmission
    pub stop_sendings: FxHashMap<StreamId, ApplicationErrorCode>,
    /// Outgoing knob frames
    pub knobs: Vec<KnobFrame>,
    /// Knob frames received and not yet dispatched
    pub received_knobs: Vec<KnobFrame>,
    /// MAX_STREAMS credit must be refreshed on the next write
    pub stream_limit_updates: bool,
}

impl PendingEvents {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One crypto stream's offsets, tracked for close-time summary statistics and
/// the app-limited check
#[derive(Debug, Clone, Default)]
pub struct CryptoStreamState {
    pub current_write_offset: u64,
    pub max_offset_observed: u64,
    pub loss_buffer_len: u64,
}

/// Crypto streams for the three encryption levels
#[derive(Debug, Clone, Default)]
pub struct CryptoState {
    pub initial_stream: CryptoStreamState,
    pub handshake_stream: CryptoStreamState,
    pub one_rtt_stream: CryptoStreamState,
}

impl CryptoState {
    pub fn loss_buffers_empty(&self) -> bool {
        self.initial_stream.loss_buffer_len == 0
            && self.handshake_stream.loss_buffer_len == 0
            && self.one_rtt_stream.loss_buffer_len == 0
    }
}

/// ECN validation progress per RFC 9000 §13.4.2
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EcnState {
    NotAttempted,
    AttemptingEcn,
    AttemptingL4s,
    ValidatedEcn,
    ValidatedL4s,
    FailedValidation,
}

/// Tracks whether the sender was app-limited across write passes
#[derive(Debug, Clone, Copy, Default)]
pub struct AppLimitedTracker {
    app_limited: bool,
}

impl AppLimitedTracker {
    pub fn is_app_limited(&self) -> bool {
        self.app_limited
    }

    pub fn set_app_limited(&mut self) {
        self.app_limited = true;
    }

    pub fn set_not_app_limited(&mut self) {
        self.app_limited = false;
    }
}

/// The canonical mutable record of the QUIC connection
///
/// Owned by [`QuicTransport`](crate::QuicTransport) and handed to the
/// [`WireCodec`](crate::WireCodec) for per-packet state updates.
pub struct ConnectionState {
    pub side: Side,
    pub local_address: Option<SocketAddr>,
    pub peer_address: SocketAddr,
    pub original_peer_address: SocketAddr,
    /// The connection id we chose
    pub local_connection_id: Option<ConnectionId>,
    /// Destination id the client put on its first flight
    pub client_chosen_dest_connection_id: Option<ConnectionId>,
    /// The id the server assigned
    pub server_connection_id: Option<ConnectionId>,
    pub version: Option<u32>,
    pub original_version: Option<u32>,
    pub app_protocol: Option<String>,
    pub peer_idle_timeout: Duration,
    /// Largest DATAGRAM frame the peer accepts, when datagrams are supported
    pub peer_max_datagram_frame_size: Option<u64>,
    pub peer_advertised_knob_frame_support: bool,
    /// Whether the peer negotiated the ACK_FREQUENCY extension
    pub ack_frequency_negotiated: bool,
    pub transport_settings: TransportSettings,
    pub loss_state: LossState,
    pub flow_control: FlowControlState,
    pub ack_states: AckStates,
    pub outstandings: Outstandings,
    pub pending_events: PendingEvents,
    pub datagram_state: DatagramState,
    pub crypto_state: CryptoState,
    pub streams: StreamManager,
    pub ecn_state: EcnState,
    pub socket_tos: SocketTos,
    pub peer_connection_error: Option<QuicError>,
    pub local_connection_error: Option<QuicError>,
    /// Set once the close path wants a CONNECTION_CLOSE on the wire; the
    /// codec keeps emitting it for any write while the connection drains
    pub pending_close_error: Option<QuicError>,
    /// A write pass noticed the socket cannot take more data
    pub write_blocked_on_socket: bool,
    pub received_new_packet_before_write: bool,
    pub write_count: u64,
    pub used_zero_rtt: bool,
    pub one_rtt_write_cipher_available: bool,
    pub app_limited_tracker: AppLimitedTracker,
    /// Set while a path challenge awaits its response
    pub outstanding_path_validation: bool,
    pub last_processed_ack_events: Vec<AckEvent>,
    pub dsr_packet_count: u64,
}

impl ConnectionState {
    pub fn new(side: Side, peer_address: SocketAddr, settings: TransportSettings) -> Self {
        let streams = StreamManager::new(side, &settings);
        let window = settings.connection_flow_control_window;
        let dscp = settings.dscp_value;
        Self {
            side,
            local_address: None,
            peer_address,
            original_peer_address: peer_address,
            local_connection_id: None,
            client_chosen_dest_connection_id: None,
            server_connection_id: None,
            version: None,
            original_version: None,
            app_protocol: None,
            peer_idle_timeout: Duration::ZERO,
            peer_max_datagram_frame_size: None,
            peer_advertised_knob_frame_support: false,
            ack_frequency_negotiated: false,
            datagram_state: DatagramState::new(&settings),
            transport_settings: settings,
            loss_state: LossState::default(),
            flow_control: FlowControlState {
                window_size: window,
                peer_advertised_max_offset: window,
                advertised_max_offset: window,
                ..FlowControlState::default()
            },
            ack_states: AckStates::default(),
            outstandings: Outstandings::default(),
            pending_events: PendingEvents::default(),
            crypto_state: CryptoState::default(),
            streams,
            ecn_state: EcnState::NotAttempted,
            socket_tos: SocketTos { dscp, ecn: 0 },
            peer_connection_error: None,
            local_connection_error: None,
            pending_close_error: None,
            write_blocked_on_socket: false,
            received_new_packet_before_write: false,
            write_count: 0,
            used_zero_rtt: false,
            one_rtt_write_cipher_available: false,
            app_limited_tracker: AppLimitedTracker::default(),
            outstanding_path_validation: false,
            last_processed_ack_events: Vec::new(),
            dsr_packet_count: 0,
        }
    }

    /// Probe timeout per RFC 9002: srtt + max(4*rttvar, granularity) + peer
    /// max ack delay
    pub fn pto(&self) -> Duration {
        let srtt = if self.loss_state.srtt.is_zero() {
            self.transport_settings.initial_rtt
        } else {
            self.loss_state.srtt
        };
        srtt + (4 * self.loss_state.rttvar).max(crate::TIMER_GRANULARITY)
            + self.transport_settings.max_ack_delay
    }
}
