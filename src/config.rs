use std::time::Duration;

/// Congestion control algorithm selection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CongestionControlType {
    None,
    NewReno,
    Cubic,
    Bbr,
    BbrTesting,
    Bbr2,
}

impl CongestionControlType {
    pub fn is_bbr_family(self) -> bool {
        matches!(self, Self::Bbr | Self::BbrTesting | Self::Bbr2)
    }
}

/// Parameters governing a connection's transport-level behavior
///
/// Default values are chosen to be suitable for an internet application.
#[derive(Clone)]
pub struct TransportSettings {
    pub(crate) idle_timeout: Duration,
    pub(crate) enable_keepalive: bool,
    pub(crate) max_ack_delay: Duration,
    pub(crate) should_drain: bool,
    pub(crate) udp_send_packet_len: u64,
    pub(crate) total_buffer_space_available: u64,
    pub(crate) backpressure_headroom_factor: u64,
    pub(crate) min_cwnd_in_mss: u64,
    pub(crate) default_congestion_controller: CongestionControlType,
    pub(crate) pacing_enabled: bool,
    pub(crate) experimental_pacer: bool,
    pub(crate) default_rtt_factor: (u8, u8),
    pub(crate) startup_rtt_factor: (u8, u8),
    pub(crate) write_looper_fire_early: bool,
    pub(crate) schedule_timer_for_excess_writes: bool,
    pub(crate) inline_write_after_read: bool,
    pub(crate) network_data_per_socket_read: bool,
    pub(crate) process_callbacks_per_packet: bool,
    pub(crate) ordered_read_callbacks: bool,
    pub(crate) remove_stream_after_eom_callback_unset: bool,
    pub(crate) use_connection_end_with_error_callback: bool,
    pub(crate) use_sock_writable_events: bool,
    pub(crate) drop_ingress_on_stop_sending: bool,
    pub(crate) initial_rtt: Duration,
    pub(crate) connection_flow_control_window: u64,
    pub(crate) stream_flow_control_window: u64,
    pub(crate) max_datagram_read_buffer_size: usize,
    pub(crate) max_datagram_write_buffer_size: usize,
    pub(crate) max_datagram_read_frame_size: u64,
    pub(crate) max_datagram_write_frame_size: u64,
    pub(crate) enable_ecn: bool,
    pub(crate) use_l4s_ecn: bool,
    pub(crate) read_ecn_on_ingress: bool,
    pub(crate) dscp_value: u8,
    pub(crate) advertised_max_stream_groups: u64,
    pub(crate) advertised_knob_frame_support: bool,
    pub(crate) enable_ack_rx_timestamps: bool,
    pub(crate) max_local_bidirectional_streams: u64,
    pub(crate) max_local_unidirectional_streams: u64,
}

impl TransportSettings {
    /// Maximum duration of inactivity to accept before timing out the
    /// connection. Zero disables the idle timer.
    pub fn idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.idle_timeout = value;
        self
    }

    /// Send a PING before the idle interval lapses to keep the connection alive
    pub fn enable_keepalive(&mut self, value: bool) -> &mut Self {
        self.enable_keepalive = value;
        self
    }

    /// Maximum amount of time an acknowledgment may be delayed
    pub fn max_ack_delay(&mut self, value: Duration) -> &mut Self {
        self.max_ack_delay = value;
        self
    }

    /// Keep the UDP socket bound for a drain period after close
    pub fn should_drain(&mut self, value: bool) -> &mut Self {
        self.should_drain = value;
        self
    }

    /// Congestion controller in use unless replaced at runtime
    pub fn congestion_controller(&mut self, value: CongestionControlType) -> &mut Self {
        self.default_congestion_controller = value;
        self
    }

    /// Gate bursts on the pacer rather than writing opportunistically
    pub fn pacing_enabled(&mut self, value: bool) -> &mut Self {
        self.pacing_enabled = value;
        self
    }

    /// Maximum bytes of application data buffered across all streams
    pub fn total_buffer_space_available(&mut self, value: u64) -> &mut Self {
        self.total_buffer_space_available = value;
        self
    }

    /// When non-zero, additionally cap writable bytes by
    /// `factor * cwnd - buffered`
    pub fn backpressure_headroom_factor(&mut self, value: u64) -> &mut Self {
        self.backpressure_headroom_factor = value;
        self
    }

    /// Yield to the event loop between write passes when more data remains
    pub fn schedule_timer_for_excess_writes(&mut self, value: bool) -> &mut Self {
        self.schedule_timer_for_excess_writes = value;
        self
    }

    /// Run the write looper inline after processing ingress instead of on the
    /// next loop turn
    pub fn inline_write_after_read(&mut self, value: bool) -> &mut Self {
        self.inline_write_after_read = value;
        self
    }

    /// Run the full callback dispatch after every decoded packet instead of
    /// once per datagram batch
    pub fn process_callbacks_per_packet(&mut self, value: bool) -> &mut Self {
        self.process_callbacks_per_packet = value;
        self
    }

    /// Deliver read callbacks in ascending stream-id order
    pub fn ordered_read_callbacks(&mut self, value: bool) -> &mut Self {
        self.ordered_read_callbacks = value;
        self
    }

    /// Reap streams only once the read callback is unset, even after EOM
    /// delivery
    pub fn remove_stream_after_eom_callback_unset(&mut self, value: bool) -> &mut Self {
        self.remove_stream_after_eom_callback_unset = value;
        self
    }

    /// Always surface the close error through `on_connection_end_with_error`
    /// instead of branching on the no-error classification
    pub fn use_connection_end_with_error_callback(&mut self, value: bool) -> &mut Self {
        self.use_connection_end_with_error_callback = value;
        self
    }

    /// Stop the write looper while the socket is unwritable and resume on its
    /// writable event
    pub fn use_sock_writable_events(&mut self, value: bool) -> &mut Self {
        self.use_sock_writable_events = value;
        self
    }

    /// Discard buffered ingress when the application stops reading a stream
    pub fn drop_ingress_on_stop_sending(&mut self, value: bool) -> &mut Self {
        self.drop_ingress_on_stop_sending = value;
        self
    }

    /// Attempt classic ECN marking (ECT0) on egress
    pub fn enable_ecn(&mut self, value: bool) -> &mut Self {
        self.enable_ecn = value;
        self
    }

    /// Attempt L4S marking (ECT1) on egress; takes precedence over classic ECN
    pub fn use_l4s_ecn(&mut self, value: bool) -> &mut Self {
        self.use_l4s_ecn = value;
        self
    }

    /// DSCP value carried in the upper six bits of the socket TOS byte
    pub fn dscp_value(&mut self, value: u8) -> &mut Self {
        self.dscp_value = value;
        self
    }

    /// Bytes of received datagrams buffered before the oldest are dropped
    pub fn max_datagram_read_buffer_size(&mut self, value: usize) -> &mut Self {
        self.max_datagram_read_buffer_size = value;
        self
    }

    /// Bytes of outgoing datagrams buffered before the oldest are dropped
    pub fn max_datagram_write_buffer_size(&mut self, value: usize) -> &mut Self {
        self.max_datagram_write_buffer_size = value;
        self
    }

    /// Number of stream groups advertised to the peer
    pub fn advertised_max_stream_groups(&mut self, value: u64) -> &mut Self {
        self.advertised_max_stream_groups = value;
        self
    }

    /// Advertise knob frame support to the peer; unadvertised received knobs
    /// are dropped
    pub fn advertised_knob_frame_support(&mut self, value: bool) -> &mut Self {
        self.advertised_knob_frame_support = value;
        self
    }

    /// Request receive timestamps in the peer's ACK frames
    pub fn enable_ack_rx_timestamps(&mut self, value: bool) -> &mut Self {
        self.enable_ack_rx_timestamps = value;
        self
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            enable_keepalive: false,
            max_ack_delay: Duration::from_millis(25),
            should_drain: true,
            udp_send_packet_len: 1252,
            total_buffer_space_available: 1024 * 1024,
            backpressure_headroom_factor: 0,
            min_cwnd_in_mss: 2,
            default_congestion_controller: CongestionControlType::Cubic,
            pacing_enabled: false,
            experimental_pacer: false,
            default_rtt_factor: (4, 5),
            startup_rtt_factor: (1, 2),
            write_looper_fire_early: false,
            schedule_timer_for_excess_writes: false,
            inline_write_after_read: false,
            network_data_per_socket_read: false,
            process_callbacks_per_packet: false,
            ordered_read_callbacks: false,
            remove_stream_after_eom_callback_unset: false,
            use_connection_end_with_error_callback: false,
            use_sock_writable_events: false,
            drop_ingress_on_stop_sending: false,
            initial_rtt: Duration::from_millis(333),
            connection_flow_control_window: 1024 * 1024,
            stream_flow_control_window: 256 * 1024,
            max_datagram_read_buffer_size: 1024 * 16,
            max_datagram_write_buffer_size: 1024 * 16,
            max_datagram_read_frame_size: 65_535,
            max_datagram_write_frame_size: 65_535,
            enable_ecn: false,
            use_l4s_ecn: false,
            read_ecn_on_ingress: false,
            dscp_value: 0,
            advertised_max_stream_groups: 0,
            advertised_knob_frame_support: true,
            enable_ack_rx_timestamps: false,
            max_local_bidirectional_streams: 128,
            max_local_unidirectional_streams: 128,
        }
    }
}

impl std::fmt::Debug for TransportSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSettings")
            .field("idle_timeout", &self.idle_timeout)
            .field("enable_keepalive", &self.enable_keepalive)
            .field("max_ack_delay", &self.max_ack_delay)
            .field("should_drain", &self.should_drain)
            .field(
                "default_congestion_controller",
                &self.default_congestion_controller,
            )
            .field("pacing_enabled", &self.pacing_enabled)
            .field("enable_ecn", &self.enable_ecn)
            .field("use_l4s_ecn", &self.use_l4s_ecn)
            .finish_non_exhaustive()
    }
}
