use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::callbacks::{
    ByteEvent, ByteEventCallback, ByteEventDetail, ByteEventKind, ByteEventMap, ConnectionCallback,
    ConnectionSetupCallback, DatagramCallback, PacketProcessor, PeekCallback, PeekCallbackEntry,
    PingCallback, ReadCallback, ReadCallbackEntry, ThrottlingSignalProvider, WriteCallback,
};
use crate::config::{CongestionControlType, TransportSettings};
use crate::congestion::{Controller, ControllerFactory};
use crate::error::{
    ApplicationErrorCode, ErrorCode, LocalErrorCode, QuicError, TransportErrorCode, TransportFault,
};
use crate::looper::{FunctionLooper, LooperId};
use crate::observer::ObserverList;
use crate::pacing::{Pacer, TokenlessPacer};
use crate::qlog::QLogger;
use crate::socket::{ReceivedUdpPacket, UdpSocket};
use crate::streams::{
    StreamDirectionality, StreamGroupRetransmissionPolicy, StreamInitiator, StreamPriority,
    StreamState,
};
use crate::timer::{Timer, TimerTable};
use crate::{
    Dir, LoopDetectorCallback, Observer, Side, StreamGroupId, StreamId, ACK_TIMER_FACTOR,
    KEEPALIVE_FACTOR, MIN_CWND_IN_MSS_FOR_BBR, TIMER_GRANULARITY,
};

mod close;
mod datagrams;
pub use datagrams::DatagramState;

mod ecn;
pub use ecn::EcnL4sTracker;

mod intake;
mod spaces;
pub use spaces::{
    AckEvent, AckState, AckStates, OutstandingPacket, Outstandings, PacketNumberSpace,
};

mod state;
pub use state::{
    AppLimitedTracker, CloseState, ConnectionId, ConnectionState, CryptoState, CryptoStreamState,
    EcnState, FlowControlState, KnobFrame, LossState, PendingEvents,
};

mod stats;
pub use stats::{ConnectionStats, FlowControlInfo, StreamTransportInfo, TransportInfo};

mod write;

/// The packet codec, frame scheduler and loss-detection collaborator
///
/// The transport core drives protocol progress through this interface and
/// never touches wire encoding itself. Implementations mutate
/// [`ConnectionState`] (ack states, outstandings, stream buffers, pending
/// events) and report failures as [`TransportFault`]s, which the core
/// classifies and routes into the close path.
pub trait WireCodec {
    /// Decode and apply one received UDP packet
    fn on_read_data(
        &mut self,
        conn: &mut ConnectionState,
        peer: SocketAddr,
        packet: ReceivedUdpPacket,
    ) -> Result<(), TransportFault>;

    /// Schedule frames, encode packets and hand them to the socket
    fn write_data(
        &mut self,
        conn: &mut ConnectionState,
        socket: &mut dyn UdpSocket,
        now: Instant,
    ) -> Result<(), TransportFault>;

    /// The loss-detection alarm fired: mark losses, queue probes
    fn on_loss_timeout(
        &mut self,
        conn: &mut ConnectionState,
        now: Instant,
    ) -> Result<(), TransportFault>;

    /// The delayed-ack timer fired: commit to acknowledging now
    #[allow(unused_variables)]
    fn on_ack_timeout(&mut self, conn: &mut ConnectionState) {}

    /// When the loss-detection alarm should next fire, if at all
    fn loss_timeout(&self, conn: &ConnectionState, now: Instant) -> Option<Instant> {
        if conn.outstandings.num_ack_eliciting() == 0 {
            return None;
        }
        let base = conn
            .outstandings
            .earliest_ack_eliciting_sent()
            .unwrap_or(now);
        Some(base + conn.pto() * 2u32.saturating_pow(conn.loss_state.pto_count.min(16)))
    }
}

/// Work scheduled onto the next event-loop turn
pub(crate) type DeferredOp = Box<dyn FnOnce(&mut QuicTransport, Instant)>;

/// Cap on per-group retransmission policy overrides
const MAX_GROUP_RETRANSMISSION_POLICIES: usize = 16;

/// Forced-idle bookkeeping: fires the idle timer asynchronously when the
/// event loop was too busy to run it on time
#[derive(Debug, Default)]
pub(crate) struct IdleTimeoutCheck {
    pub(crate) last_scheduled: Option<Instant>,
    pub(crate) duration: Duration,
    pub(crate) forced_scheduled: bool,
}

/// The connection-level transport core of a QUIC endpoint
///
/// Owns the connection's mutable state and drives it between the network and
/// the application. Strictly single threaded; the embedding driver calls
/// [`on_network_data`](Self::on_network_data),
/// [`handle_timeout`](Self::handle_timeout) and
/// [`process_events`](Self::process_events) from one event loop, consulting
/// [`poll_timeout`](Self::poll_timeout) for the next deadline.
pub struct QuicTransport {
    pub(crate) conn: ConnectionState,
    pub(crate) close_state: CloseState,
    pub(crate) codec: Box<dyn WireCodec>,
    pub(crate) socket: Option<Box<dyn UdpSocket>>,
    pub(crate) congestion_factory: Box<dyn ControllerFactory>,
    pub(crate) congestion: Option<Box<dyn Controller>>,
    pub(crate) pacer: Option<Box<dyn Pacer>>,
    pub(crate) qlogger: Option<Rc<dyn QLogger>>,
    pub(crate) observers: ObserverList,
    pub(crate) timers: TimerTable,
    pub(crate) read_looper: FunctionLooper,
    pub(crate) peek_looper: FunctionLooper,
    pub(crate) write_looper: FunctionLooper,
    pub(crate) deferred: VecDeque<DeferredOp>,
    pub(crate) read_callbacks: FxHashMap<StreamId, ReadCallbackEntry>,
    pub(crate) peek_callbacks: FxHashMap<StreamId, PeekCallbackEntry>,
    pub(crate) delivery_callbacks: ByteEventMap,
    pub(crate) tx_callbacks: ByteEventMap,
    pub(crate) pending_write_callbacks: FxHashMap<StreamId, Rc<dyn WriteCallback>>,
    pub(crate) conn_write_callback: Option<Rc<dyn WriteCallback>>,
    pub(crate) datagram_callback: Option<Rc<dyn DatagramCallback>>,
    pub(crate) ping_callback: Option<Rc<dyn PingCallback>>,
    pub(crate) connection_setup_callback: Option<Rc<dyn ConnectionSetupCallback>>,
    pub(crate) connection_callback: Option<Rc<dyn ConnectionCallback>>,
    pub(crate) packet_processors: Vec<Rc<dyn PacketProcessor>>,
    pub(crate) ecn_l4s_tracker: Option<Rc<EcnL4sTracker>>,
    pub(crate) throttling_signal_provider: Option<Rc<dyn ThrottlingSignalProvider>>,
    pub(crate) loop_detector: Option<Rc<dyn LoopDetectorCallback>>,
    pub(crate) read_loop_count: u64,
    pub(crate) write_empty_loop_count: u64,
    pub(crate) needs_write_loop_detect: bool,
    /// Unsanitized description of the fault that closed the connection; never
    /// put on the wire
    pub(crate) exception_close_what: Option<String>,
    pub(crate) transport_ready_notified: bool,
    pub(crate) idle_check: IdleTimeoutCheck,
    pub(crate) background_params: Option<(u8, f32)>,
    pub(crate) retransmission_policies: FxHashMap<StreamGroupId, StreamGroupRetransmissionPolicy>,
    pub(crate) attached: bool,
}

impl QuicTransport {
    pub fn new(
        side: Side,
        peer_address: SocketAddr,
        settings: TransportSettings,
        codec: Box<dyn WireCodec>,
        congestion_factory: Box<dyn ControllerFactory>,
        socket: Box<dyn UdpSocket>,
        now: Instant,
    ) -> Self {
        let conn = ConnectionState::new(side, peer_address, settings);
        let mut transport = Self {
            conn,
            close_state: CloseState::Open,
            codec,
            socket: Some(socket),
            congestion_factory,
            congestion: None,
            pacer: None,
            qlogger: None,
            observers: ObserverList::default(),
            timers: TimerTable::default(),
            read_looper: FunctionLooper::new(LooperId::Read),
            peek_looper: FunctionLooper::new(LooperId::Peek),
            write_looper: FunctionLooper::new(LooperId::Write),
            deferred: VecDeque::new(),
            read_callbacks: FxHashMap::default(),
            peek_callbacks: FxHashMap::default(),
            delivery_callbacks: ByteEventMap::default(),
            tx_callbacks: ByteEventMap::default(),
            pending_write_callbacks: FxHashMap::default(),
            conn_write_callback: None,
            datagram_callback: None,
            ping_callback: None,
            connection_setup_callback: None,
            connection_callback: None,
            packet_processors: Vec::new(),
            ecn_l4s_tracker: None,
            throttling_signal_provider: None,
            loop_detector: None,
            read_loop_count: 0,
            write_empty_loop_count: 0,
            needs_write_loop_detect: false,
            exception_close_what: None,
            transport_ready_notified: false,
            idle_check: IdleTimeoutCheck::default(),
            background_params: None,
            retransmission_policies: FxHashMap::default(),
            attached: true,
        };
        let mut cc_type = transport.conn.transport_settings.default_congestion_controller;
        transport.validate_congestion_and_pacing(&mut cc_type, now);
        transport.conn.transport_settings.default_congestion_controller = cc_type;
        transport.congestion = Some(transport.congestion_factory.build(
            cc_type,
            transport.conn.transport_settings.udp_send_packet_len,
            now,
        ));
        transport.apply_ecn_settings();
        transport.set_idle_timer(now);
        transport
    }

    //
    // Driver surface
    //

    /// One event-loop turn: drain work deferred from earlier turns, then run
    /// each scheduled looper at most once
    pub fn process_events(&mut self, now: Instant) {
        // Ops queued by the ops we run here wait for the next turn
        let queued = self.deferred.len();
        for _ in 0..queued {
            let Some(op) = self.deferred.pop_front() else {
                break;
            };
            op(self, now);
        }

        if self.read_looper.due(now) {
            self.read_looper.on_pass();
            self.invoke_read_data_and_callbacks(now);
            self.update_read_looper();
        }
        if self.peek_looper.due(now) {
            self.peek_looper.on_pass();
            self.invoke_peek_data_and_callbacks(now);
            self.update_peek_looper();
        }
        if self.write_looper.due(now) {
            self.write_looper.on_pass();
            self.paced_write_data_to_socket(now);
        }
    }

    /// The earliest instant at which [`handle_timeout`](Self::handle_timeout)
    /// or [`process_events`](Self::process_events) needs to run
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        let timer = self.timers.peek().map(|entry| entry.time);
        let pacing = self.write_looper.pacing_deadline();
        match (timer, pacing) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Whether any looper or deferred op wants another loop turn right away
    pub fn has_pending_loop_work(&self, now: Instant) -> bool {
        !self.deferred.is_empty()
            || self.read_looper.due(now)
            || self.peek_looper.due(now)
            || self.write_looper.due(now)
    }

    /// Expire every timer whose deadline has passed
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.expire_before(now) {
            trace!(timer = ?timer, "timeout");
            match timer {
                Timer::LossDetection => self.loss_timeout_expired(now),
                Timer::Ack => self.ack_timeout_expired(now),
                Timer::PathValidation => self.path_validation_timeout_expired(now),
                Timer::Idle => self.idle_timeout_expired(now, true),
                Timer::KeepAlive => self.keepalive_timeout_expired(now),
                Timer::Drain => self.drain_timeout_expired(),
                Timer::Ping => self.ping_timeout_expired(now),
                Timer::ExcessWrite => self.excess_write_timeout_expired(now),
            }
        }
    }

    /// Schedule `op` to run on the next event-loop turn
    pub(crate) fn run_on_evb_async(&mut self, op: DeferredOp) {
        self.deferred.push_back(op);
    }

    //
    // Timer policies
    //

    /// (Re)arm the idle timer, and the keepalive timer when enabled
    pub(crate) fn set_idle_timer(&mut self, now: Instant) {
        if self.close_state == CloseState::Closed {
            return;
        }
        self.timers.stop(Timer::Idle);
        self.timers.stop(Timer::KeepAlive);
        let local = self.conn.transport_settings.idle_timeout;
        // A zero local idle timeout disables the timer
        if local.is_zero() {
            return;
        }
        let peer = self.conn.peer_idle_timeout;
        let idle_timeout = if peer.is_zero() { local } else { local.min(peer) };

        self.idle_check.duration = idle_timeout;
        self.idle_check.last_scheduled = Some(now);
        self.idle_check.forced_scheduled = false;

        self.timers.set(Timer::Idle, now + idle_timeout);
        if self.conn.transport_settings.enable_keepalive {
            let keepalive = idle_timeout.mul_f64(KEEPALIVE_FACTOR);
            self.timers.set(Timer::KeepAlive, now + keepalive);
        }
    }

    /// Forced idle: if the event loop starved the idle timer past its
    /// deadline, fire it asynchronously, at most once per timer period
    pub(crate) fn check_idle_timer(&mut self, now: Instant) {
        if self.close_state == CloseState::Closed
            || !self.timers.is_armed(Timer::Idle)
            || self.idle_check.forced_scheduled
        {
            return;
        }
        let Some(last_scheduled) = self.idle_check.last_scheduled else {
            return;
        };
        if now.saturating_duration_since(last_scheduled) >= self.idle_check.duration {
            self.idle_check.forced_scheduled = true;
            self.run_on_evb_async(Box::new(|transport, now| {
                if !transport.good() || transport.close_state == CloseState::Closed {
                    // The connection was closed in the meantime
                    return;
                }
                transport.timers.stop(Timer::Idle);
                transport.idle_timeout_expired(now, true);
            }));
        }
    }

    /// Let the collaborator's loss detection pick the next alarm
    pub(crate) fn set_loss_detection_alarm(&mut self, now: Instant) {
        match self.codec.loss_timeout(&self.conn, now) {
            Some(deadline) => {
                let deadline = deadline.max(now + TIMER_GRANULARITY);
                self.timers.set(Timer::LossDetection, deadline);
            }
            None => self.timers.stop(Timer::LossDetection),
        }
    }

    pub(crate) fn schedule_ack_timeout(&mut self, now: Instant) {
        if self.conn.pending_events.schedule_ack_timeout {
            if !self.timers.is_armed(Timer::Ack) {
                let max_ack_delay = self.conn.transport_settings.max_ack_delay;
                let timeout = if self.conn.ack_frequency_negotiated {
                    max_ack_delay
                } else {
                    let factored = self.conn.loss_state.srtt.mul_f64(ACK_TIMER_FACTOR);
                    max_ack_delay.min(factored).max(TIMER_GRANULARITY)
                };
                self.timers.set(Timer::Ack, now + timeout);
            }
        } else {
            self.timers.stop(Timer::Ack);
        }
    }

    pub(crate) fn schedule_path_validation_timeout(&mut self, now: Instant) {
        let wanted = self.conn.outstanding_path_validation
            || self.conn.pending_events.schedule_path_validation_timeout;
        if !wanted {
            self.timers.stop(Timer::PathValidation);
            return;
        }
        self.conn.pending_events.schedule_path_validation_timeout = false;
        self.conn.outstanding_path_validation = true;
        if self.timers.is_armed(Timer::PathValidation) {
            return;
        }
        let pto = self.conn.pto();
        let timeout = (3 * pto).max(6 * self.conn.transport_settings.initial_rtt);
        self.timers.set(Timer::PathValidation, now + timeout);
    }

    //
    // Timer expiry handlers
    //

    fn loss_timeout_expired(&mut self, now: Instant) {
        let result = {
            let conn = &mut self.conn;
            self.codec.on_loss_timeout(conn, now)
        };
        if let Err(fault) = result {
            self.exception_close_what = Some(fault.what().to_string());
            let error = fault.to_close_error("lossTimeoutExpired() error");
            self.close_impl(Some(error), true, true, now);
            return;
        }
        if let Some(qlogger) = &self.qlogger {
            qlogger.add_recovery_metric_update(
                self.conn.loss_state.srtt,
                self.conn.loss_state.rttvar,
                self.conn.loss_state.pto_count,
            );
        }
        self.paced_write_data_to_socket(now);
    }

    fn ack_timeout_expired(&mut self, now: Instant) {
        self.conn.pending_events.schedule_ack_timeout = false;
        self.codec.on_ack_timeout(&mut self.conn);
        self.paced_write_data_to_socket(now);
    }

    fn path_validation_timeout_expired(&mut self, now: Instant) {
        debug!("path validation timed out");
        self.conn.outstanding_path_validation = false;
        self.close_impl(
            Some(QuicError::transport(
                TransportErrorCode::INVALID_MIGRATION,
                "Path validation timed out",
            )),
            true,
            true,
            now,
        );
    }

    pub(crate) fn idle_timeout_expired(&mut self, now: Instant, drain: bool) {
        trace!("idle timeout expired");
        let message = format!(
            "Idle timeout, num non control streams: {}",
            self.conn.streams.stream_count() as u64 - self.conn.streams.num_control_streams()
        );
        self.close_impl(
            Some(QuicError::local_with(LocalErrorCode::IdleTimeout, message)),
            drain,
            !drain,
            now,
        );
    }

    fn keepalive_timeout_expired(&mut self, now: Instant) {
        trace!("sending keep-alive");
        self.conn.pending_events.send_ping = true;
        self.update_write_looper(true, false, now);
    }

    fn ping_timeout_expired(&mut self, _now: Instant) {
        let Some(cb) = self.ping_callback.clone() else {
            return;
        };
        cb.ping_timeout(self);
    }

    fn excess_write_timeout_expired(&mut self, now: Instant) {
        self.paced_write_data_to_socket(now);
    }

    //
    // Looper scheduling
    //

    pub(crate) fn update_read_looper(&mut self) {
        if self.close_state != CloseState::Open {
            self.read_looper.stop();
            return;
        }
        let has_work = self
            .conn
            .streams
            .readable_streams()
            .iter()
            .any(|id| match self.read_callbacks.get(id) {
                Some(entry) => entry.cb.is_some() && entry.resumed,
                None => false,
            });
        if has_work {
            self.read_looper.run();
        } else {
            self.read_looper.stop();
        }
    }

    pub(crate) fn update_peek_looper(&mut self) {
        if self.close_state != CloseState::Open {
            self.peek_looper.stop();
            return;
        }
        let has_work = self
            .conn
            .streams
            .peekable_streams()
            .iter()
            .any(|id| match self.peek_callbacks.get(id) {
                Some(entry) => entry.cb.is_some() && entry.resumed,
                None => false,
            });
        if has_work {
            self.peek_looper.run();
        } else {
            self.peek_looper.stop();
        }
    }

    /// Decide whether the write looper should run, consulting the pacer for
    /// the next-burst delay
    pub(crate) fn update_write_looper(&mut self, this_iteration: bool, run_inline: bool, now: Instant) {
        if self.close_state == CloseState::Closed {
            self.write_looper.stop();
            return;
        }
        if self.has_data_to_write() {
            self.needs_write_loop_detect = self.loop_detector.is_some();
            self.write_looper.run();
            let delay = self.pacing_delay(now);
            self.write_looper.schedule_pacing(now, delay);
            if run_inline && this_iteration && self.write_looper.due(now) {
                self.write_looper.on_pass();
                self.paced_write_data_to_socket(now);
            }
        } else {
            self.needs_write_loop_detect = false;
            self.write_looper.stop();
        }
    }

    /// Whether any frames are waiting for a write pass
    pub(crate) fn has_data_to_write(&self) -> bool {
        let events = &self.conn.pending_events;
        events.send_ping
            || events.close_transport
            || events.num_probe_packets.iter().any(|&n| n > 0)
            || !events.resets.is_empty()
            || !events.stop_sendings.is_empty()
            || !events.knobs.is_empty()
            || events.stream_limit_updates
            || self.conn.streams.has_writable()
            || self.conn.streams.has_loss()
            || self.conn.datagram_state.has_write_data()
            || self
                .conn
                .ack_states
                .app_data
                .needs_ack
    }

    pub(crate) fn is_connection_paced(&self) -> bool {
        self.conn.transport_settings.pacing_enabled
            && self.pacer.is_some()
            && self.write_looper.has_pacing_timer()
    }

    fn pacing_delay(&self, now: Instant) -> Duration {
        if !self.is_connection_paced() {
            return Duration::ZERO;
        }
        match &self.pacer {
            Some(pacer) => pacer.time_until_next_write(now),
            None => Duration::ZERO,
        }
    }

    //
    // Stream lifecycle
    //

    fn create_stream_internal(
        &mut self,
        dir: Dir,
        group: Option<StreamGroupId>,
    ) -> Result<StreamId, LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        match dir {
            Dir::Bi => self.conn.streams.create_next_bidirectional_stream(group),
            Dir::Uni => self.conn.streams.create_next_unidirectional_stream(group),
        }
    }

    pub fn create_bidirectional_stream(&mut self) -> Result<StreamId, LocalErrorCode> {
        self.create_stream_internal(Dir::Bi, None)
    }

    pub fn create_unidirectional_stream(&mut self) -> Result<StreamId, LocalErrorCode> {
        self.create_stream_internal(Dir::Uni, None)
    }

    pub fn create_bidirectional_stream_in_group(
        &mut self,
        group: StreamGroupId,
    ) -> Result<StreamId, LocalErrorCode> {
        self.create_stream_internal(Dir::Bi, Some(group))
    }

    pub fn create_unidirectional_stream_in_group(
        &mut self,
        group: StreamGroupId,
    ) -> Result<StreamId, LocalErrorCode> {
        self.create_stream_internal(Dir::Uni, Some(group))
    }

    pub fn create_bidirectional_stream_group(&mut self) -> Result<StreamGroupId, LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        self.conn.streams.create_stream_group(Dir::Bi)
    }

    pub fn create_unidirectional_stream_group(&mut self) -> Result<StreamGroupId, LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        self.conn.streams.create_stream_group(Dir::Uni)
    }

    pub fn get_num_openable_bidirectional_streams(&self) -> u64 {
        self.conn.streams.openable_local_bidirectional_streams()
    }

    pub fn get_num_openable_unidirectional_streams(&self) -> u64 {
        self.conn.streams.openable_local_unidirectional_streams()
    }

    //
    // Stream I/O
    //

    /// Drain up to `max_len` ready bytes from a stream; the flag reports EOF
    pub fn read(
        &mut self,
        id: StreamId,
        max_len: u64,
        now: Instant,
    ) -> Result<(Bytes, bool), LocalErrorCode> {
        if id.is_sending_only_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        if let Some(error) = self
            .conn
            .streams
            .get_stream(id)
            .and_then(|s| s.read_error.clone())
        {
            return Err(self.close_on_stream_error(error, "read() error", now));
        }
        let stream = self.conn.streams.get_stream_mut(id).expect("checked above");
        let (chunks, eof) = stream.read(max_len);
        if !stream.readable() {
            self.conn.streams.remove_readable(id);
            self.conn.streams.remove_peekable(id);
        }
        if eof {
            if let Some(entry) = self.read_callbacks.get_mut(&id) {
                entry.delivered_eom = true;
            }
            self.conn.streams.maybe_mark_closed(id);
            self.check_for_closed_stream(now);
        }
        let data = concat_chunks(chunks);
        Ok((data, eof))
    }

    /// Present the contiguous readable range without consuming it
    pub fn peek(
        &mut self,
        id: StreamId,
        now: Instant,
        visitor: &mut dyn FnMut(u64, &[Bytes]),
    ) -> Result<(), LocalErrorCode> {
        if id.is_sending_only_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        if let Some(error) = self
            .conn
            .streams
            .get_stream(id)
            .and_then(|s| s.read_error.clone())
        {
            return Err(self.close_on_stream_error(error, "peek() error", now));
        }
        let (offset, chunks) = self
            .conn
            .streams
            .get_stream(id)
            .expect("checked above")
            .peek_range();
        visitor(offset, &chunks);
        Ok(())
    }

    /// Advance the read cursor without surfacing the bytes; `offset` must
    /// match the stream's current read offset
    pub fn consume(
        &mut self,
        id: StreamId,
        offset: u64,
        amount: u64,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        if id.is_sending_only_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        if let Some(error) = self
            .conn
            .streams
            .get_stream(id)
            .and_then(|s| s.read_error.clone())
        {
            return Err(self.close_on_stream_error(error, "consume() error", now));
        }
        let stream = self.conn.streams.get_stream_mut(id).expect("checked above");
        if stream.current_read_offset != offset {
            return Err(LocalErrorCode::InvalidOperation);
        }
        stream.consume(amount);
        let closed_recv = !stream.readable() && stream.recv_state() == crate::StreamRecvState::Closed;
        if !self
            .conn
            .streams
            .get_stream(id)
            .map(|s| s.readable())
            .unwrap_or(false)
        {
            self.conn.streams.remove_readable(id);
            self.conn.streams.remove_peekable(id);
        }
        if closed_recv {
            self.conn.streams.maybe_mark_closed(id);
            self.check_for_closed_stream(now);
        }
        Ok(())
    }

    /// Classify an error stored on a stream the way collaborator faults are
    /// classified: close the connection and map to a `LocalErrorCode`
    fn close_on_stream_error(
        &mut self,
        error: QuicError,
        context: &'static str,
        now: Instant,
    ) -> LocalErrorCode {
        self.exception_close_what = Some(error.message.clone());
        let (close_error, code) = match error.code {
            ErrorCode::Transport(code) => (
                QuicError::transport(code, context),
                LocalErrorCode::TransportError,
            ),
            ErrorCode::Application(code) => (
                QuicError::application(code, context),
                LocalErrorCode::AppError,
            ),
            ErrorCode::Local(code) => (QuicError::local_with(code, context), code),
        };
        self.close_impl(Some(close_error), true, true, now);
        code
    }

    /// Enqueue bytes (and optionally EOF) on a stream's send side
    ///
    /// When a delivery callback is supplied it is registered for the last
    /// byte of this write.
    pub fn write_chain(
        &mut self,
        id: StreamId,
        data: Bytes,
        eof: bool,
        cb: Option<Rc<dyn ByteEventCallback>>,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        if id.is_receiving_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let stream = self.conn.streams.get_stream(id).expect("checked above");
        if !stream.writable() {
            return Err(LocalErrorCode::StreamClosed);
        }
        let data_length = data.len() as u64 + u64::from(eof);
        if let Some(cb) = cb {
            if data_length > 0 {
                let offset = stream.largest_write_offset_seen() + data_length - 1;
                self.register_byte_event_callback(ByteEventKind::Ack, id, offset, cb, now)?;
            }
        }
        let added = self.conn.streams.write_data_to_stream(id, data, eof)?;
        self.conn.flow_control.sum_cur_stream_buffer_len += added;
        // Leaving an app-limited or idle period: restart pacing at the
        // current rate rather than burst the accumulated debt
        if let (Some(congestion), Some(pacer)) = (&self.congestion, &mut self.pacer) {
            if congestion.is_app_limited() {
                pacer.reset();
            }
        }
        self.update_write_looper(true, false, now);
        Ok(())
    }

    /// Finish the send side of a stream by queueing an EOF
    pub fn shutdown_write(&mut self, id: StreamId, now: Instant) -> Option<LocalErrorCode> {
        match self.write_chain(id, Bytes::new(), true, None, now) {
            Ok(()) => None,
            Err(code) => Some(code),
        }
    }

    /// Abandon the send side of a stream
    pub fn reset_stream(
        &mut self,
        id: StreamId,
        error: ApplicationErrorCode,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        if id.is_receiving_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let freed = self.conn.streams.reset_stream_send(id, error)?;
        self.conn.flow_control.sum_cur_stream_buffer_len = self
            .conn
            .flow_control
            .sum_cur_stream_buffer_len
            .saturating_sub(freed);
        self.conn.pending_events.resets.insert(id, error);
        self.conn.loss_state.rtx_count += 1;
        self.cancel_byte_event_callbacks_for_stream_impl(None, id, None, now);
        self.pending_write_callbacks.remove(&id);
        self.check_for_closed_stream(now);
        self.update_read_looper();
        self.update_peek_looper();
        self.update_write_looper(true, false, now);
        Ok(())
    }

    /// Ask the peer to stop sending on a stream
    pub fn stop_sending(
        &mut self,
        id: StreamId,
        error: ApplicationErrorCode,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        if id.is_sending_only_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        let Some(stream) = self.conn.streams.get_stream_mut(id) else {
            return Err(LocalErrorCode::StreamNotExists);
        };
        if stream.recv_state() == crate::StreamRecvState::Closed {
            // Nothing left for the peer to stop
            return Ok(());
        }
        if self.conn.transport_settings.drop_ingress_on_stop_sending {
            stream.clear_read_buffer();
            self.conn.streams.remove_readable(id);
            self.conn.streams.remove_peekable(id);
        }
        self.conn.pending_events.stop_sendings.insert(id, error);
        self.update_write_looper(true, false, now);
        Ok(())
    }

    //
    // Read / peek callbacks
    //

    /// Install, replace or clear the read callback of a stream
    ///
    /// Clearing the callback with an error code additionally sends
    /// STOP_SENDING for the stream.
    pub fn set_read_callback(
        &mut self,
        id: StreamId,
        cb: Option<Rc<dyn ReadCallback>>,
        err: Option<ApplicationErrorCode>,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        if id.is_sending_only_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if cb.is_some() && self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        self.set_read_callback_internal(id, cb, err, now)
    }

    fn set_read_callback_internal(
        &mut self,
        id: StreamId,
        cb: Option<Rc<dyn ReadCallback>>,
        err: Option<ApplicationErrorCode>,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let unset = cb.is_none();
        match self.read_callbacks.entry(id) {
            Entry::Vacant(entry) => {
                if unset {
                    // An initial set to null is meaningless
                    return Err(LocalErrorCode::InvalidOperation);
                }
                entry.insert(ReadCallbackEntry {
                    cb,
                    resumed: true,
                    delivered_eom: false,
                });
            }
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                if entry.cb.is_none() && unset {
                    // Already read-closed this stream
                    return Err(LocalErrorCode::InvalidOperation);
                }
                entry.cb = cb;
            }
        }
        if unset {
            if let Some(err) = err {
                let _ = self.stop_sending(id, err, now);
            }
            self.conn.streams.maybe_mark_closed(id);
            self.check_for_closed_stream(now);
        }
        self.update_read_looper();
        Ok(())
    }

    pub fn pause_read(&mut self, id: StreamId) -> Result<(), LocalErrorCode> {
        self.pause_or_resume_read(id, false)
    }

    pub fn resume_read(&mut self, id: StreamId) -> Result<(), LocalErrorCode> {
        self.pause_or_resume_read(id, true)
    }

    fn pause_or_resume_read(&mut self, id: StreamId, resume: bool) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let Some(entry) = self.read_callbacks.get_mut(&id) else {
            return Err(LocalErrorCode::InvalidOperation);
        };
        if entry.cb.is_none() || entry.resumed == resume {
            return Err(LocalErrorCode::InvalidOperation);
        }
        entry.resumed = resume;
        self.update_read_looper();
        Ok(())
    }

    pub fn set_peek_callback(
        &mut self,
        id: StreamId,
        cb: Option<Rc<dyn PeekCallback>>,
    ) -> Result<(), LocalErrorCode> {
        if id.is_sending_only_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if cb.is_some() && self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let unset = cb.is_none();
        match self.peek_callbacks.entry(id) {
            Entry::Vacant(entry) => {
                if unset {
                    return Err(LocalErrorCode::InvalidOperation);
                }
                entry.insert(PeekCallbackEntry { cb, resumed: true });
            }
            Entry::Occupied(mut entry) => {
                let entry = entry.get_mut();
                if entry.cb.is_none() && unset {
                    return Err(LocalErrorCode::InvalidOperation);
                }
                entry.cb = cb;
            }
        }
        self.update_peek_looper();
        Ok(())
    }

    pub fn pause_peek(&mut self, id: StreamId) -> Result<(), LocalErrorCode> {
        self.pause_or_resume_peek(id, false)
    }

    pub fn resume_peek(&mut self, id: StreamId) -> Result<(), LocalErrorCode> {
        self.pause_or_resume_peek(id, true)
    }

    fn pause_or_resume_peek(&mut self, id: StreamId, resume: bool) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }
        let Some(entry) = self.peek_callbacks.get_mut(&id) else {
            return Err(LocalErrorCode::InvalidOperation);
        };
        if entry.cb.is_none() || entry.resumed == resume {
            return Err(LocalErrorCode::InvalidOperation);
        }
        entry.resumed = resume;
        self.update_peek_looper();
        Ok(())
    }

    //
    // Write readiness callbacks
    //

    /// Ask to be told once the connection has send budget again
    pub fn notify_pending_write_on_connection(
        &mut self,
        cb: Rc<dyn WriteCallback>,
    ) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if self.conn_write_callback.is_some() {
            return Err(LocalErrorCode::InvalidWriteCallback);
        }
        self.conn_write_callback = Some(cb);
        self.run_on_evb_async(Box::new(|transport, now| {
            if transport.close_state != CloseState::Open {
                return;
            }
            transport.handle_conn_writable(now);
        }));
        Ok(())
    }

    /// Ask to be told once a stream has send budget again
    pub fn notify_pending_write_on_stream(
        &mut self,
        id: StreamId,
        cb: Rc<dyn WriteCallback>,
    ) -> Result<(), LocalErrorCode> {
        if id.is_receiving_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        let Some(stream) = self.conn.streams.get_stream(id) else {
            return Err(LocalErrorCode::StreamNotExists);
        };
        if !stream.writable() {
            return Err(LocalErrorCode::StreamClosed);
        }
        if self.pending_write_callbacks.contains_key(&id) {
            return Err(LocalErrorCode::InvalidWriteCallback);
        }
        self.pending_write_callbacks.insert(id, cb);
        self.run_on_evb_async(Box::new(move |transport, now| {
            if transport.close_state != CloseState::Open {
                return;
            }
            transport.maybe_fire_stream_write_ready(id, now);
        }));
        Ok(())
    }

    pub fn unregister_stream_write_callback(&mut self, id: StreamId) -> Result<(), LocalErrorCode> {
        if self.pending_write_callbacks.remove(&id).is_none() {
            return Err(LocalErrorCode::InvalidWriteCallback);
        }
        Ok(())
    }

    pub(crate) fn maybe_fire_stream_write_ready(&mut self, id: StreamId, now: Instant) {
        let max_writable = match self.max_writable_on_stream_id(id) {
            Some(n) if n > 0 => n,
            _ => return,
        };
        let Some(cb) = self.pending_write_callbacks.remove(&id) else {
            return;
        };
        cb.stream_write_ready(self, id, max_writable);
        let _ = now;
    }

    //
    // Byte events
    //

    pub fn register_delivery_callback(
        &mut self,
        id: StreamId,
        offset: u64,
        cb: Rc<dyn ByteEventCallback>,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        self.register_byte_event_callback(ByteEventKind::Ack, id, offset, cb, now)
    }

    pub fn register_tx_callback(
        &mut self,
        id: StreamId,
        offset: u64,
        cb: Rc<dyn ByteEventCallback>,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        self.register_byte_event_callback(ByteEventKind::Tx, id, offset, cb, now)
    }

    /// Register a callback for a given offset on a stream, keeping the
    /// per-stream queue ordered by offset
    pub fn register_byte_event_callback(
        &mut self,
        kind: ByteEventKind,
        id: StreamId,
        offset: u64,
        cb: Rc<dyn ByteEventCallback>,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        if id.is_receiving_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.conn.streams.stream_exists(id) {
            return Err(LocalErrorCode::StreamNotExists);
        }

        let byte_event_map = match kind {
            ByteEventKind::Ack => &mut self.delivery_callbacks,
            ByteEventKind::Tx => &mut self.tx_callbacks,
        };
        let queue = byte_event_map.entry(id).or_default();
        // Keep byte events for the same stream sorted by offset
        let pos = queue.partition_point(|detail| detail.offset <= offset);
        let duplicate = queue[..pos]
            .iter()
            .any(|detail| detail.offset == offset && Rc::ptr_eq(&detail.cb, &cb));
        if duplicate {
            // The same recipient is already registered for this offset
            return Err(LocalErrorCode::InvalidOperation);
        }
        queue.insert(
            pos,
            ByteEventDetail {
                offset,
                cb: cb.clone(),
            },
        );

        let srtt = self.conn.loss_state.srtt;
        cb.on_byte_event_registered(
            self,
            ByteEvent {
                id,
                offset,
                kind,
                srtt,
            },
        );

        // If the offset was already reached, fire on the next loop turn; the
        // queue may be mutated in between, so the deferred op re-verifies the
        // entry is still present
        let stream = match self.conn.streams.get_stream(id) {
            Some(stream) => stream,
            None => return Ok(()),
        };
        let max_offset_ready = match kind {
            ByteEventKind::Ack => stream.largest_deliverable_offset,
            ByteEventKind::Tx => stream.largest_write_offset_txed,
        };
        if max_offset_ready.is_some_and(|max| offset <= max) {
            self.run_on_evb_async(Box::new(move |transport, _now| {
                if transport.close_state != CloseState::Open {
                    // Close errors out all byte event callbacks
                    return;
                }
                let map = match kind {
                    ByteEventKind::Ack => &mut transport.delivery_callbacks,
                    ByteEventKind::Tx => &mut transport.tx_callbacks,
                };
                let Some(queue) = map.get_mut(&id) else {
                    return;
                };
                let Some(pos) = queue
                    .iter()
                    .position(|d| d.offset == offset && Rc::ptr_eq(&d.cb, &cb))
                else {
                    // Already delivered through the regular path
                    return;
                };
                let detail = queue.remove(pos);
                if queue.is_empty() {
                    map.remove(&id);
                }
                let srtt = transport.conn.loss_state.srtt;
                detail.cb.on_byte_event(
                    transport,
                    ByteEvent {
                        id,
                        offset,
                        kind,
                        srtt,
                    },
                );
            }));
        }
        let _ = now;
        Ok(())
    }

    pub fn cancel_delivery_callbacks_for_stream(
        &mut self,
        id: StreamId,
        offset: Option<u64>,
        now: Instant,
    ) {
        self.cancel_byte_event_callbacks_for_stream_impl(Some(ByteEventKind::Ack), id, offset, now);
    }

    /// Cancel byte events registered below `offset` (all when `offset` is
    /// `None`) for one stream; `kind` of `None` covers both queues
    pub fn cancel_byte_event_callbacks_for_stream(
        &mut self,
        kind: ByteEventKind,
        id: StreamId,
        offset: Option<u64>,
        now: Instant,
    ) {
        self.cancel_byte_event_callbacks_for_stream_impl(Some(kind), id, offset, now);
    }

    pub(crate) fn cancel_byte_event_callbacks_for_stream_impl(
        &mut self,
        kind: Option<ByteEventKind>,
        id: StreamId,
        offset: Option<u64>,
        now: Instant,
    ) {
        let kinds: &[ByteEventKind] = match kind {
            Some(ByteEventKind::Ack) => &[ByteEventKind::Ack],
            Some(ByteEventKind::Tx) => &[ByteEventKind::Tx],
            None => &[ByteEventKind::Ack, ByteEventKind::Tx],
        };
        for &kind in kinds {
            loop {
                let map = match kind {
                    ByteEventKind::Ack => &mut self.delivery_callbacks,
                    ByteEventKind::Tx => &mut self.tx_callbacks,
                };
                let Some(queue) = map.get_mut(&id) else {
                    break;
                };
                let pop = match queue.first() {
                    Some(detail) => offset.map_or(true, |bound| detail.offset < bound),
                    None => false,
                };
                if !pop {
                    if queue.is_empty() {
                        map.remove(&id);
                    }
                    break;
                }
                let detail = queue.remove(0);
                if queue.is_empty() {
                    // Idempotent: a callback below may have re-entered and
                    // removed the entry already
                    map.remove(&id);
                }
                detail.cb.on_byte_event_canceled(
                    self,
                    crate::callbacks::ByteEventCancellation {
                        id,
                        offset: detail.offset,
                        kind,
                    },
                );
            }
            // If the queue emptied, the stream no longer has pending events
            // of this kind
            let empty = match kind {
                ByteEventKind::Ack => !self.delivery_callbacks.contains_key(&id),
                ByteEventKind::Tx => !self.tx_callbacks.contains_key(&id),
            };
            if empty {
                match kind {
                    ByteEventKind::Ack => self.conn.streams.remove_deliverable(id),
                    ByteEventKind::Tx => self.conn.streams.remove_tx(id),
                }
            }
        }
        let _ = now;
    }

    pub(crate) fn cancel_all_byte_event_callbacks(&mut self, now: Instant) {
        self.cancel_byte_event_callbacks(ByteEventKind::Ack, now);
        self.cancel_byte_event_callbacks(ByteEventKind::Tx, now);
    }

    pub(crate) fn cancel_byte_event_callbacks(&mut self, kind: ByteEventKind, now: Instant) {
        let ids: Vec<StreamId> = match kind {
            ByteEventKind::Ack => self.delivery_callbacks.keys().copied().collect(),
            ByteEventKind::Tx => self.tx_callbacks.keys().copied().collect(),
        };
        for id in ids {
            self.cancel_byte_event_callbacks_for_stream_impl(Some(kind), id, None, now);
        }
    }

    pub fn get_num_byte_event_callbacks_for_stream(&self, id: StreamId) -> usize {
        let ack = self.delivery_callbacks.get(&id).map_or(0, Vec::len);
        let tx = self.tx_callbacks.get(&id).map_or(0, Vec::len);
        ack + tx
    }

    //
    // Flow control
    //

    /// Bytes the connection as a whole can accept from the application
    pub fn max_writable_on_conn(&self) -> u64 {
        let conn_writable = self.conn.flow_control.send_flow_control_bytes();
        let buffer_space = self.buffer_space_available();
        let mut ret = conn_writable.min(buffer_space);
        let factor = self.conn.transport_settings.backpressure_headroom_factor;
        if factor > 0 {
            if let Some(congestion) = &self.congestion {
                let headroom = factor * congestion.window();
                let buffered = self.conn.flow_control.sum_cur_stream_buffer_len;
                ret = ret.min(headroom.saturating_sub(buffered));
            }
        }
        ret
    }

    /// Bytes one stream can accept from the application
    pub fn max_writable_on_stream(&self, stream: &StreamState) -> u64 {
        stream
            .send_flow_control_bytes()
            .min(self.max_writable_on_conn())
    }

    fn max_writable_on_stream_id(&self, id: StreamId) -> Option<u64> {
        self.conn
            .streams
            .get_stream(id)
            .map(|s| self.max_writable_on_stream(s))
    }

    pub fn get_max_writable_on_stream(&self, id: StreamId) -> Result<u64, LocalErrorCode> {
        if id.is_receiving_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.max_writable_on_stream_id(id)
            .ok_or(LocalErrorCode::StreamNotExists)
    }

    /// Buffer space still available across all streams; clamps to zero when
    /// buffered bytes exceed the budget
    pub fn buffer_space_available(&self) -> u64 {
        self.conn
            .transport_settings
            .total_buffer_space_available
            .saturating_sub(self.conn.flow_control.sum_cur_stream_buffer_len)
    }

    pub fn get_connection_buffer_available(&self) -> u64 {
        self.buffer_space_available()
    }

    pub fn set_connection_flow_control_window(&mut self, window: u64) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        self.conn.flow_control.window_size = window;
        Ok(())
    }

    pub fn set_stream_flow_control_window(
        &mut self,
        id: StreamId,
        window: u64,
    ) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        let Some(stream) = self.conn.streams.get_stream_mut(id) else {
            return Err(LocalErrorCode::StreamNotExists);
        };
        stream.flow_control.window_size = window;
        Ok(())
    }

    pub fn get_connection_flow_control(&self) -> Result<FlowControlInfo, LocalErrorCode> {
        if self.close_state == CloseState::Closed {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        Ok(FlowControlInfo {
            sendable_bytes: self.conn.flow_control.send_flow_control_bytes(),
            peer_advertised_max_offset: self.conn.flow_control.peer_advertised_max_offset,
            advertised_max_offset: self.conn.flow_control.advertised_max_offset,
        })
    }

    pub fn get_stream_flow_control(&self, id: StreamId) -> Result<FlowControlInfo, LocalErrorCode> {
        if self.close_state == CloseState::Closed {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        let Some(stream) = self.conn.streams.get_stream(id) else {
            return Err(LocalErrorCode::StreamNotExists);
        };
        Ok(FlowControlInfo {
            sendable_bytes: stream.send_flow_control_bytes(),
            peer_advertised_max_offset: stream.flow_control.peer_advertised_max_offset,
            advertised_max_offset: stream.flow_control.advertised_max_offset,
        })
    }

    //
    // Priority and control streams
    //

    pub fn set_stream_priority(
        &mut self,
        id: StreamId,
        priority: StreamPriority,
    ) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if priority.level > 7 {
            return Err(LocalErrorCode::InvalidOperation);
        }
        let Some(stream) = self.conn.streams.get_stream_mut(id) else {
            return Err(LocalErrorCode::StreamNotExists);
        };
        stream.priority = priority;
        self.on_stream_priorities_change();
        Ok(())
    }

    pub fn get_stream_priority(&self, id: StreamId) -> Result<StreamPriority, LocalErrorCode> {
        if self.close_state == CloseState::Closed {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        self.conn
            .streams
            .get_stream(id)
            .map(|s| s.priority)
            .ok_or(LocalErrorCode::StreamNotExists)
    }

    /// Mark a stream exempt from priority-based background-mode treatment
    pub fn set_control_stream(&mut self, id: StreamId) -> Option<LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Some(LocalErrorCode::ConnectionClosed);
        }
        match self.conn.streams.get_stream_mut(id) {
            Some(stream) => {
                stream.is_control = true;
                None
            }
            None => Some(LocalErrorCode::StreamNotExists),
        }
    }

    fn on_stream_priorities_change(&mut self) {
        if let (Some((_, factor)), Some(congestion)) =
            (self.background_params, self.congestion.as_mut())
        {
            congestion.set_bandwidth_utilization_factor(factor);
        }
    }

    /// Install or clear a retransmission policy override for a stream group
    pub fn set_stream_group_retransmission_policy(
        &mut self,
        group: StreamGroupId,
        policy: Option<StreamGroupRetransmissionPolicy>,
    ) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        let Some(policy) = policy else {
            self.retransmission_policies.remove(&group);
            return Ok(());
        };
        if !self.retransmission_policies.contains_key(&group)
            && self.retransmission_policies.len() >= MAX_GROUP_RETRANSMISSION_POLICIES
        {
            return Err(LocalErrorCode::RtxPoliciesLimitExceeded);
        }
        self.retransmission_policies.insert(group, policy);
        Ok(())
    }

    pub fn get_stream_group_retransmission_policy(
        &self,
        group: StreamGroupId,
    ) -> Option<StreamGroupRetransmissionPolicy> {
        self.retransmission_policies.get(&group).copied()
    }

    //
    // Ping
    //

    pub fn set_ping_callback(&mut self, cb: Rc<dyn PingCallback>) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        self.ping_callback = Some(cb);
        Ok(())
    }

    /// Send a PING; a zero timeout disables loss reporting for it
    pub fn send_ping(&mut self, timeout: Duration, now: Instant) {
        if self.close_state != CloseState::Open {
            return;
        }
        self.conn.pending_events.send_ping = true;
        if !timeout.is_zero() {
            self.timers.set(Timer::Ping, now + timeout);
        }
        self.update_write_looper(true, false, now);
    }

    //
    // Settings and tuning
    //

    /// Replace the transport settings; congestion, pacing, TOS and ECN state
    /// are revalidated against the new values
    pub fn set_transport_settings(&mut self, settings: TransportSettings, now: Instant) {
        if self.conn.outstandings.num_outstanding() > 0 {
            warn!("cannot process transport settings after the handshake started");
            return;
        }
        self.conn.transport_settings = settings;
        let mut cc_type = self.conn.transport_settings.default_congestion_controller;
        self.validate_congestion_and_pacing(&mut cc_type, now);
        self.conn.transport_settings.default_congestion_controller = cc_type;
        self.congestion = Some(self.congestion_factory.build(
            cc_type,
            self.conn.transport_settings.udp_send_packet_len,
            now,
        ));
        self.apply_ecn_settings();
        self.update_socket_tos();
    }

    pub fn get_transport_settings(&self) -> &TransportSettings {
        &self.conn.transport_settings
    }

    /// Switch congestion control algorithms at runtime
    pub fn set_congestion_control(&mut self, kind: CongestionControlType, now: Instant) {
        let mut kind = kind;
        self.validate_congestion_and_pacing(&mut kind, now);
        self.congestion = Some(self.congestion_factory.build(
            kind,
            self.conn.transport_settings.udp_send_packet_len,
            now,
        ));
        self.conn.transport_settings.default_congestion_controller = kind;
    }

    /// Enforce the pairing rules between controller choice and pacer
    ///
    /// Unpaced BBR is rejected and downgraded to Cubic. BBR-family
    /// controllers get a `TokenlessPacer` with the BBR minimum window; BBR2
    /// and BBRTesting force the experimental pacer, unity RTT factors and
    /// early loop firing.
    fn validate_congestion_and_pacing(&mut self, kind: &mut CongestionControlType, now: Instant) {
        let settings = &mut self.conn.transport_settings;
        if kind.is_bbr_family() && !settings.pacing_enabled {
            warn!("Unpaced BBR, using Cubic instead");
            *kind = CongestionControlType::Cubic;
        }
        if !settings.pacing_enabled {
            return;
        }
        let min_cwnd = if kind.is_bbr_family() {
            MIN_CWND_IN_MSS_FOR_BBR
        } else {
            settings.min_cwnd_in_mss
        };
        if matches!(
            kind,
            CongestionControlType::Bbr2 | CongestionControlType::BbrTesting
        ) {
            settings.experimental_pacer = true;
            settings.default_rtt_factor = (1, 1);
            settings.startup_rtt_factor = (1, 1);
            settings.write_looper_fire_early = true;
        }
        let mut pacer: Box<dyn Pacer> =
            Box::new(TokenlessPacer::new(min_cwnd, settings.udp_send_packet_len, now));
        pacer.set_rtt_factor(settings.default_rtt_factor, settings.startup_rtt_factor);
        pacer.set_experimental(settings.experimental_pacer);
        self.pacer = Some(pacer);
        self.write_looper
            .set_fire_early(settings.write_looper_fire_early);
    }

    /// Install the pacing timer that gates the write looper
    pub fn set_pacing_timer(&mut self, tick: Duration) {
        self.write_looper.set_pacing_timer(tick);
    }

    pub fn set_max_pacing_rate(&mut self, bytes_per_sec: u64) -> Result<(), LocalErrorCode> {
        match self.pacer.as_mut() {
            Some(pacer) => {
                pacer.set_max_pacing_rate(bytes_per_sec);
                Ok(())
            }
            None => {
                warn!("max pacing rate set with no pacer available");
                Err(LocalErrorCode::PacerNotAvailable)
            }
        }
    }

    /// Queue a knob frame for the peer
    pub fn set_knob(
        &mut self,
        knob_space: u64,
        knob_id: u64,
        blob: Bytes,
        now: Instant,
    ) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        if !self.is_knob_supported() {
            return Err(LocalErrorCode::KnobFrameUnsupported);
        }
        self.conn.pending_events.knobs.push(KnobFrame {
            knob_space,
            knob_id,
            blob,
        });
        self.update_write_looper(true, false, now);
        Ok(())
    }

    pub fn is_knob_supported(&self) -> bool {
        self.conn.peer_advertised_knob_frame_support
    }

    pub fn set_ack_rx_timestamps_enabled(&mut self, enabled: bool) {
        self.conn.transport_settings.enable_ack_rx_timestamps = enabled;
    }

    /// Cap bandwidth use while backgrounded: streams at or below
    /// `max_background_priority` only count `utilization_factor` of the window
    pub fn set_background_mode_parameters(
        &mut self,
        max_background_priority: u8,
        utilization_factor: f32,
    ) {
        self.background_params = Some((max_background_priority, utilization_factor));
        self.on_stream_priorities_change();
    }

    pub fn clear_background_mode_parameters(&mut self) {
        self.background_params = None;
        if let Some(congestion) = self.congestion.as_mut() {
            congestion.set_bandwidth_utilization_factor(1.0);
        }
    }

    pub fn add_packet_processor(&mut self, processor: Rc<dyn PacketProcessor>) {
        self.packet_processors.push(processor);
    }

    pub fn set_throttling_signal_provider(&mut self, provider: Rc<dyn ThrottlingSignalProvider>) {
        self.throttling_signal_provider = Some(provider);
    }

    pub fn set_datagram_callback(
        &mut self,
        cb: Rc<dyn DatagramCallback>,
    ) -> Result<(), LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        self.datagram_callback = Some(cb);
        Ok(())
    }

    pub fn set_connection_setup_callback(&mut self, cb: Option<Rc<dyn ConnectionSetupCallback>>) {
        self.connection_setup_callback = cb;
    }

    pub fn set_connection_callback(&mut self, cb: Option<Rc<dyn ConnectionCallback>>) {
        self.connection_callback = cb;
    }

    pub fn set_qlogger(&mut self, qlogger: Rc<dyn QLogger>) {
        self.qlogger = Some(qlogger);
    }

    pub fn set_loop_detector_callback(&mut self, cb: Option<Rc<dyn LoopDetectorCallback>>) {
        self.loop_detector = cb;
    }

    pub fn add_observer(&mut self, observer: Rc<dyn Observer>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&mut self, observer: &Rc<dyn Observer>) -> bool {
        self.observers.remove(observer)
    }

    /// The handshake completed; deliver `on_transport_ready` exactly once
    pub fn notify_transport_ready(&mut self) {
        if self.transport_ready_notified {
            return;
        }
        self.transport_ready_notified = true;
        self.conn.one_rtt_write_cipher_available = true;
        if let Some(cb) = self.connection_setup_callback.clone() {
            cb.on_transport_ready(self);
        }
    }

    //
    // ECN and TOS plumbing
    //

    fn apply_ecn_settings(&mut self) {
        let settings = &self.conn.transport_settings;
        let (state, ecn_bits) = if settings.use_l4s_ecn {
            (state::EcnState::AttemptingL4s, crate::EcnCodepoint::Ect1 as u8)
        } else if settings.enable_ecn {
            (state::EcnState::AttemptingEcn, crate::EcnCodepoint::Ect0 as u8)
        } else {
            (state::EcnState::NotAttempted, 0)
        };
        self.conn.ecn_state = state;
        self.conn.socket_tos.ecn = ecn_bits;
        self.conn.socket_tos.dscp = settings.dscp_value;
        self.update_socket_tos();
    }

    fn update_socket_tos(&mut self) {
        let tos = self.conn.socket_tos.value();
        if let Some(socket) = self.socket.as_mut() {
            socket.set_tos(tos);
        }
    }

    //
    // Introspection
    //

    /// Whether the transport is usable for application traffic
    pub fn good(&self) -> bool {
        self.close_state == CloseState::Open
            && self.conn.local_connection_error.is_none()
            && self.conn.peer_connection_error.is_none()
    }

    /// Whether 0-RTT replay concerns are over
    pub fn replay_safe(&self) -> bool {
        self.conn.one_rtt_write_cipher_available
    }

    pub fn error(&self) -> Option<&QuicError> {
        self.conn
            .local_connection_error
            .as_ref()
            .or(self.conn.peer_connection_error.as_ref())
    }

    pub fn get_close_state(&self) -> CloseState {
        self.close_state
    }

    pub fn get_transport_info(&self) -> TransportInfo {
        TransportInfo {
            srtt: self.conn.loss_state.srtt,
            rttvar: self.conn.loss_state.rttvar,
            latest_rtt: self.conn.loss_state.latest_rtt,
            min_rtt: self.conn.loss_state.mrtt,
            congestion_window: self.congestion.as_ref().map_or(0, |c| c.window()),
            writable_bytes: self.congestion.as_ref().map_or(0, |c| c.writable_bytes()),
            congestion_control_type: self.congestion.as_ref().map(|c| c.kind()),
            pto_count: self.conn.loss_state.pto_count,
            total_bytes_sent: self.conn.loss_state.total_bytes_sent,
            total_bytes_recvd: self.conn.loss_state.total_bytes_recvd,
            total_bytes_retransmitted: self.conn.loss_state.total_bytes_retransmitted,
            total_packets_sent: self.conn.loss_state.total_packets_sent,
            total_ack_eliciting_packets_sent: self.conn.loss_state.total_ack_eliciting_packets_sent,
            bytes_in_flight: self.conn.loss_state.inflight_bytes,
            app_limited: self.conn.app_limited_tracker.is_app_limited(),
            used_zero_rtt: self.conn.used_zero_rtt,
            ecn_state: Some(self.conn.ecn_state),
            quic_version: self.conn.version,
        }
    }

    pub fn get_stream_transport_info(
        &self,
        id: StreamId,
    ) -> Result<StreamTransportInfo, LocalErrorCode> {
        if self.close_state == CloseState::Closed {
            return Err(LocalErrorCode::ConnectionClosed);
        }
        let Some(stream) = self.conn.streams.get_stream(id) else {
            return Err(LocalErrorCode::StreamNotExists);
        };
        Ok(StreamTransportInfo {
            total_head_of_line_blocked_time: stream.holb.total_time,
            hol_blocked_count: stream.holb.count,
            is_hol_blocked: stream.holb.blocked,
            num_packets_tx_with_new_data: stream.num_packets_tx_with_new_data,
            stream_loss_count: stream.loss_count,
            fin_received: stream.final_read_offset.is_some(),
            fin_sent: stream.final_write_offset.is_some(),
        })
    }

    pub fn get_connections_stats(&self) -> ConnectionStats {
        ConnectionStats {
            num_streams: self.conn.streams.stream_count() as u64,
            congestion_window: self.congestion.as_ref().map_or(0, |c| c.window()),
            srtt: self.conn.loss_state.srtt,
            rttvar: self.conn.loss_state.rttvar,
            total_bytes_sent: self.conn.loss_state.total_bytes_sent,
            total_bytes_recvd: self.conn.loss_state.total_bytes_recvd,
            ptos: self.conn.loss_state.pto_count,
            rtxs: self.conn.loss_state.rtx_count,
            write_count: self.conn.write_count,
        }
    }

    /// The stream's current read offset
    // TODO: report current_read_offset instead of the placeholder zero
    pub fn get_stream_read_offset(&self, _id: StreamId) -> Result<u64, LocalErrorCode> {
        Ok(0)
    }

    pub fn get_stream_write_offset(&self, id: StreamId) -> Result<u64, LocalErrorCode> {
        if id.is_receiving_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.conn
            .streams
            .get_stream(id)
            .map(|s| s.current_write_offset)
            .ok_or(LocalErrorCode::StreamNotExists)
    }

    pub fn get_stream_write_buffered_bytes(&self, id: StreamId) -> Result<u64, LocalErrorCode> {
        if id.is_receiving_for(self.conn.side) {
            return Err(LocalErrorCode::InvalidOperation);
        }
        self.conn
            .streams
            .get_stream(id)
            .map(|s| s.write_buffered_bytes())
            .ok_or(LocalErrorCode::StreamNotExists)
    }

    pub fn get_app_protocol(&self) -> Option<String> {
        self.conn.app_protocol.clone()
    }

    pub fn get_client_connection_id(&self) -> Option<ConnectionId> {
        match self.conn.side {
            Side::Client => self.conn.local_connection_id,
            Side::Server => self.conn.client_chosen_dest_connection_id,
        }
    }

    pub fn get_server_connection_id(&self) -> Option<ConnectionId> {
        match self.conn.side {
            Side::Client => self.conn.server_connection_id,
            Side::Server => self.conn.local_connection_id,
        }
    }

    pub fn get_client_chosen_dest_connection_id(&self) -> Option<ConnectionId> {
        self.conn.client_chosen_dest_connection_id
    }

    pub fn get_peer_address(&self) -> SocketAddr {
        self.conn.peer_address
    }

    pub fn get_original_peer_address(&self) -> SocketAddr {
        self.conn.original_peer_address
    }

    pub fn get_local_address(&self) -> Option<SocketAddr> {
        self.conn.local_address
    }

    pub(crate) fn stream_initiator(&self, id: StreamId) -> StreamInitiator {
        if id.initiator() == self.conn.side {
            StreamInitiator::Local
        } else {
            StreamInitiator::Remote
        }
    }

    pub(crate) fn stream_directionality(&self, id: StreamId) -> StreamDirectionality {
        match id.dir() {
            Dir::Bi => StreamDirectionality::Bidirectional,
            Dir::Uni => StreamDirectionality::Unidirectional,
        }
    }

    //
    // Event-base attachment (client only)
    //

    /// Whether the transport is currently bound to a driving loop
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Whether the transport can be moved off its event loop
    pub fn is_detachable(&self) -> bool {
        self.conn.side.is_client() && self.close_state != CloseState::Closed
    }

    /// Detach from the driving loop: cancel timers, drop pending write
    /// callbacks, stop loopers and surrender the socket
    pub fn detach_event_base(&mut self) -> Option<Box<dyn UdpSocket>> {
        debug_assert!(self.is_detachable());
        self.timers.reset();
        self.pending_write_callbacks.clear();
        self.conn_write_callback = None;
        self.read_looper.stop();
        self.peek_looper.stop();
        self.write_looper.stop();
        self.attached = false;
        self.socket.take()
    }

    /// Attach to a (new) driving loop and re-arm the maintenance timers
    pub fn attach_event_base(&mut self, socket: Box<dyn UdpSocket>, now: Instant) {
        self.socket = Some(socket);
        self.attached = true;
        self.update_socket_tos();
        self.set_idle_timer(now);
        self.schedule_ack_timeout(now);
        self.schedule_path_validation_timeout(now);
        self.update_read_looper();
        self.update_peek_looper();
        self.update_write_looper(true, false, now);
    }

    //
    // Test-facing internals
    //

    #[cfg(test)]
    pub(crate) fn conn_mut(&mut self) -> &mut ConnectionState {
        &mut self.conn
    }

    #[cfg(test)]
    pub(crate) fn timer_deadline(&self, timer: Timer) -> Option<Instant> {
        self.timers.get(timer)
    }
}

fn concat_chunks(chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.into_iter().next().unwrap(),
        _ => {
            let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in chunks {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        }
    }
}
