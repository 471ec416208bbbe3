use std::time::Duration;

/// End-of-connection roll-up recorded into qlog when the connection closes
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct TransportSummary {
    pub total_bytes_sent: u64,
    pub total_bytes_recvd: u64,
    pub sum_cur_write_offset: u64,
    pub sum_max_observed_offset: u64,
    pub sum_cur_stream_buffer_len: u64,
    pub total_bytes_retransmitted: u64,
    pub total_stream_bytes_cloned: u64,
    pub total_bytes_cloned: u64,
    pub total_crypto_data_written: u64,
    pub total_crypto_data_recvd: u64,
    pub current_writable_bytes: u64,
    pub current_conn_flow_control: u64,
    pub total_packets_spuriously_marked_lost: u64,
    pub used_zero_rtt: bool,
    pub quic_version: u32,
    pub dsr_packet_count: u64,
}

/// Sink for qlog records
///
/// Implementations serialize elsewhere; the transport only pushes the records
/// it owns enough state to produce.
pub trait QLogger {
    #[allow(unused_variables)]
    fn add_transport_summary(&self, summary: &TransportSummary) {}

    #[allow(unused_variables)]
    fn add_connection_close(
        &self,
        error: String,
        reason: String,
        drain_connection: bool,
        send_close_immediately: bool,
    ) {
    }

    #[allow(unused_variables)]
    fn add_transport_state_update(&self, update: String) {}

    /// Loss/pacing metric snapshot after a recovery event
    #[allow(unused_variables)]
    fn add_recovery_metric_update(&self, srtt: Duration, rttvar: Duration, pto_count: u32) {}
}
