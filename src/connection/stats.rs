//! Connection and stream introspection surfaces

use std::time::Duration;

use crate::config::CongestionControlType;
use crate::connection::state::EcnState;

/// Snapshot of connection-level transport state
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct TransportInfo {
    pub srtt: Duration,
    pub rttvar: Duration,
    pub latest_rtt: Duration,
    pub min_rtt: Duration,
    pub congestion_window: u64,
    pub writable_bytes: u64,
    pub congestion_control_type: Option<CongestionControlType>,
    pub pto_count: u32,
    pub total_bytes_sent: u64,
    pub total_bytes_recvd: u64,
    pub total_bytes_retransmitted: u64,
    pub total_packets_sent: u64,
    pub total_ack_eliciting_packets_sent: u64,
    pub bytes_in_flight: u64,
    pub app_limited: bool,
    pub used_zero_rtt: bool,
    pub ecn_state: Option<EcnState>,
    pub quic_version: Option<u32>,
}

/// Snapshot of one stream's transport state
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct StreamTransportInfo {
    /// Total time the stream has spent head-of-line blocked
    pub total_head_of_line_blocked_time: Duration,
    /// How many times the stream went head-of-line blocked
    pub hol_blocked_count: u32,
    /// Whether the stream is blocked right now
    pub is_hol_blocked: bool,
    /// Packets carrying new data for this stream
    pub num_packets_tx_with_new_data: u64,
    /// Stream frames declared lost at least once
    pub stream_loss_count: u64,
    pub fin_received: bool,
    pub fin_sent: bool,
}

/// Aggregate statistics reported through `get_connections_stats`
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ConnectionStats {
    pub num_streams: u64,
    pub congestion_window: u64,
    pub srtt: Duration,
    pub rttvar: Duration,
    pub total_bytes_sent: u64,
    pub total_bytes_recvd: u64,
    pub ptos: u32,
    pub rtxs: u32,
    pub write_count: u64,
}

/// Connection- or stream-level flow control snapshot
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct FlowControlInfo {
    /// Bytes the sender may still produce before hitting the peer's limit
    pub sendable_bytes: u64,
    /// Largest offset the peer advertised
    pub peer_advertised_max_offset: u64,
    /// Largest offset we advertised to the peer
    pub advertised_max_offset: u64,
}
