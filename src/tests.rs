use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use bytes::Bytes;

use super::*;
use crate::connection::{AckEvent, PacketNumberSpace};
use crate::timer::Timer;

fn subscribe() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace")),
        )
        .with_test_writer()
        .try_init();
}

//
// Scripted collaborators
//

/// One scripted effect the fake codec applies when a packet arrives
enum CodecOp {
    /// Install a peer-opened stream
    NewPeerStream(StreamId, Option<StreamGroupId>),
    /// In-order stream data arrived
    StreamData {
        id: StreamId,
        data: Bytes,
        eof: bool,
    },
    /// The peer acked a stream up to `offset`; `finish` ends both halves
    AckStream {
        id: StreamId,
        offset: u64,
        finish: bool,
    },
    /// The peer reset a stream
    PeerReset(StreamId, ApplicationErrorCode),
    /// The peer asked us to stop sending
    PeerStopSending(StreamId, ApplicationErrorCode),
    /// PING received
    Ping,
    /// Our PING was acknowledged
    PingAck,
    /// A knob frame arrived
    Knob(KnobFrame),
    /// A datagram arrived
    Datagram(Bytes),
    /// CONNECTION_CLOSE from the peer
    PeerClose,
    /// A packet that doesn't advance the ack state
    Stale,
    /// Decoding blew up
    Fault(TransportFault),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WireEvent {
    Ping,
    StopSending(StreamId, ApplicationErrorCode),
    Reset(StreamId, ApplicationErrorCode),
    Knob(u64, u64),
    MaxStreams,
    StreamData { id: StreamId, bytes: u64, fin: bool },
    Datagram(usize),
    Close,
}

#[derive(Default)]
struct SocketLog {
    tos_values: Vec<u8>,
    closed: bool,
    paused: bool,
    writable_requests: u32,
}

struct TestSocket {
    log: Rc<RefCell<SocketLog>>,
}

impl UdpSocket for TestSocket {
    fn send(&mut self, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    fn pause_read(&mut self) {
        self.log.borrow_mut().paused = true;
    }

    fn close(&mut self) {
        self.log.borrow_mut().closed = true;
    }

    fn set_tos(&mut self, tos: u8) {
        self.log.borrow_mut().tos_values.push(tos);
    }

    fn request_writable_event(&mut self) {
        self.log.borrow_mut().writable_requests += 1;
    }
}

struct TestCodec {
    ops: Rc<RefCell<VecDeque<CodecOp>>>,
    wire: Rc<RefCell<Vec<WireEvent>>>,
    next_rx_packet: u64,
    next_tx_packet: u64,
    loss_alarms: Rc<Cell<u32>>,
}

impl TestCodec {
    fn send_packet(
        &mut self,
        conn: &mut ConnectionState,
        now: Instant,
        size: u64,
        ack_eliciting: bool,
    ) {
        conn.loss_state.total_packets_sent += 1;
        conn.loss_state.total_bytes_sent += size;
        if ack_eliciting {
            conn.loss_state.total_ack_eliciting_packets_sent += 1;
            conn.loss_state.inflight_bytes += size;
            conn.outstandings.on_packet_sent(crate::OutstandingPacket {
                packet_num: self.next_tx_packet,
                space: PacketNumberSpace::AppData,
                time_sent: now,
                encoded_size: size,
                ack_eliciting,
            });
        }
        self.next_tx_packet += 1;
    }
}

impl WireCodec for TestCodec {
    fn on_read_data(
        &mut self,
        conn: &mut ConnectionState,
        _peer: SocketAddr,
        _packet: crate::ReceivedUdpPacket,
    ) -> Result<(), TransportFault> {
        let Some(op) = self.ops.borrow_mut().pop_front() else {
            return Ok(());
        };
        let packet_num = self.next_rx_packet;
        self.next_rx_packet += 1;
        let mut bump = true;
        match op {
            CodecOp::NewPeerStream(id, group) => {
                conn.streams
                    .create_peer_stream(id, group)
                    .map_err(|_| TransportFault::Internal {
                        code: LocalErrorCode::InternalError,
                        what: "duplicate peer stream".into(),
                    })?;
            }
            CodecOp::StreamData { id, data, eof } => {
                if let Some(stream) = conn.streams.get_stream_mut(id) {
                    stream.push_read_data(data, eof);
                }
                conn.streams.add_readable(id);
            }
            CodecOp::AckStream { id, offset, finish } => {
                if let Some(stream) = conn.streams.get_stream_mut(id) {
                    stream.largest_deliverable_offset = Some(offset);
                }
                conn.streams.add_deliverable(id);
                conn.last_processed_ack_events.push(AckEvent {
                    ack_time: _packet.receive_time,
                    largest_acked_packet: packet_num,
                    acked_bytes: offset + 1,
                    srtt: conn.loss_state.srtt,
                    ecn_ce_count: conn.ack_states.app_data.ecn_ce_count_echoed,
                });
                conn.loss_state.inflight_bytes = 0;
                conn.outstandings.reset();
                if finish {
                    conn.streams.close_stream_send(id);
                    if let Some(stream) = conn.streams.get_stream_mut(id) {
                        stream.recv_state = StreamRecvState::Closed;
                    }
                    conn.streams.maybe_mark_closed(id);
                }
            }
            CodecOp::PeerReset(id, error) => {
                if let Some(stream) = conn.streams.get_stream_mut(id) {
                    stream.read_error = Some(QuicError::application(error, "peer reset"));
                    stream.recv_state = StreamRecvState::Closed;
                }
                conn.streams.add_readable(id);
                conn.streams.add_pending_reset(id);
            }
            CodecOp::PeerStopSending(id, error) => {
                conn.streams.add_stop_sending(id, error);
            }
            CodecOp::Ping => {
                conn.pending_events.notify_ping_received = true;
            }
            CodecOp::PingAck => {
                conn.pending_events.cancel_ping_timeout = true;
            }
            CodecOp::Knob(frame) => {
                conn.pending_events.received_knobs.push(frame);
            }
            CodecOp::Datagram(data) => {
                conn.datagram_state.on_datagram_received(data);
            }
            CodecOp::PeerClose => {
                conn.peer_connection_error = Some(QuicError::transport(
                    TransportErrorCode::NO_ERROR,
                    "peer says bye",
                ));
            }
            CodecOp::Stale => {
                bump = false;
            }
            CodecOp::Fault(fault) => return Err(fault),
        }
        if bump {
            conn.ack_states.app_data.on_packet_received(packet_num);
        }
        Ok(())
    }

    fn write_data(
        &mut self,
        conn: &mut ConnectionState,
        _socket: &mut dyn UdpSocket,
        now: Instant,
    ) -> Result<(), TransportFault> {
        if conn.pending_close_error.is_some() {
            self.wire.borrow_mut().push(WireEvent::Close);
            self.send_packet(conn, now, 40, false);
            return Ok(());
        }
        if conn.write_blocked_on_socket {
            // Socket full: leave everything queued
            return Ok(());
        }
        if conn.pending_events.send_ping {
            conn.pending_events.send_ping = false;
            self.wire.borrow_mut().push(WireEvent::Ping);
            self.send_packet(conn, now, 40, true);
        }
        for (id, error) in std::mem::take(&mut conn.pending_events.stop_sendings) {
            self.wire.borrow_mut().push(WireEvent::StopSending(id, error));
            self.send_packet(conn, now, 30, true);
        }
        for (id, error) in std::mem::take(&mut conn.pending_events.resets) {
            self.wire.borrow_mut().push(WireEvent::Reset(id, error));
            self.send_packet(conn, now, 30, true);
        }
        for knob in std::mem::take(&mut conn.pending_events.knobs) {
            self.wire
                .borrow_mut()
                .push(WireEvent::Knob(knob.knob_space, knob.knob_id));
            self.send_packet(conn, now, 30 + knob.blob.len() as u64, true);
        }
        if std::mem::take(&mut conn.pending_events.stream_limit_updates) {
            self.wire.borrow_mut().push(WireEvent::MaxStreams);
            self.send_packet(conn, now, 20, true);
        }
        let writable: Vec<_> = conn.streams.writable_streams().iter().copied().collect();
        for id in writable {
            let Some(stream) = conn.streams.get_stream_mut(id) else {
                continue;
            };
            let start = stream.current_write_offset;
            let end = stream.largest_write_offset_seen();
            if end <= start && stream.final_write_offset != Some(end) {
                continue;
            }
            let bytes = end - start;
            let fin = stream.final_write_offset == Some(end);
            stream.current_write_offset = end;
            if fin {
                // The fin occupies its own offset
                stream.largest_write_offset_txed = Some(end);
            } else if end > 0 {
                stream.largest_write_offset_txed = Some(end - 1);
            }
            stream.num_packets_tx_with_new_data += 1;
            conn.streams.add_tx(id);
            conn.streams.remove_writable(id);
            conn.flow_control.sum_cur_write_offset += bytes;
            self.wire
                .borrow_mut()
                .push(WireEvent::StreamData { id, bytes, fin });
            self.send_packet(conn, now, bytes + 20, true);
        }
        while let Some(data) = conn.datagram_state.dequeue_write() {
            self.wire.borrow_mut().push(WireEvent::Datagram(data.len()));
            self.send_packet(conn, now, data.len() as u64 + 10, false);
        }
        Ok(())
    }

    fn on_loss_timeout(
        &mut self,
        conn: &mut ConnectionState,
        _now: Instant,
    ) -> Result<(), TransportFault> {
        self.loss_alarms.set(self.loss_alarms.get() + 1);
        conn.loss_state.pto_count += 1;
        conn.pending_events.num_probe_packets[PacketNumberSpace::AppData as usize] = 1;
        Ok(())
    }
}

struct TestController {
    kind: CongestionControlType,
    window: u64,
    app_limited: Cell<bool>,
}

impl congestion::Controller for TestController {
    fn window(&self) -> u64 {
        self.window
    }

    fn writable_bytes(&self) -> u64 {
        self.window
    }

    fn set_app_limited(&mut self) {
        self.app_limited.set(true);
    }

    fn is_app_limited(&self) -> bool {
        self.app_limited.get()
    }

    fn kind(&self) -> CongestionControlType {
        self.kind
    }
}

struct TestControllerFactory;

impl congestion::ControllerFactory for TestControllerFactory {
    fn build(
        &self,
        kind: CongestionControlType,
        _mss: u64,
        _now: Instant,
    ) -> Box<dyn congestion::Controller> {
        Box::new(TestController {
            kind,
            window: 12_000,
            app_limited: Cell::new(false),
        })
    }
}

//
// Callback recorders
//

#[derive(Default)]
struct ConnEvents {
    new_streams: Vec<StreamId>,
    stop_sending: Vec<(StreamId, ApplicationErrorCode)>,
    ended: Cell<u32>,
    errors: RefCell<Vec<QuicError>>,
    knobs: Vec<(u64, u64)>,
    app_limited: Cell<u32>,
    streams_available: Vec<u64>,
    close_on_new_stream: bool,
}

struct ConnCb {
    events: Rc<RefCell<ConnEvents>>,
}

impl ConnectionCallback for ConnCb {
    fn on_new_bidirectional_stream(&self, transport: &mut QuicTransport, id: StreamId) {
        let close = self.events.borrow().close_on_new_stream;
        self.events.borrow_mut().new_streams.push(id);
        if close {
            transport.close(None, Instant::now());
        }
    }

    fn on_new_unidirectional_stream(&self, _transport: &mut QuicTransport, id: StreamId) {
        self.events.borrow_mut().new_streams.push(id);
    }

    fn on_stop_sending(
        &self,
        _transport: &mut QuicTransport,
        id: StreamId,
        error: ApplicationErrorCode,
    ) {
        self.events.borrow_mut().stop_sending.push((id, error));
    }

    fn on_connection_end(&self) {
        let events = self.events.borrow();
        events.ended.set(events.ended.get() + 1);
    }

    fn on_connection_error(&self, error: QuicError) {
        self.events.borrow().errors.borrow_mut().push(error);
    }

    fn on_knob(&self, knob_space: u64, knob_id: u64, _blob: Bytes) {
        self.events.borrow_mut().knobs.push((knob_space, knob_id));
    }

    fn on_app_rate_limited(&self) {
        let events = self.events.borrow();
        events.app_limited.set(events.app_limited.get() + 1);
    }

    fn on_bidirectional_streams_available(&self, _transport: &mut QuicTransport, count: u64) {
        self.events.borrow_mut().streams_available.push(count);
    }
}

#[derive(Default)]
struct ReadEvents {
    available: Vec<StreamId>,
    errors: Vec<(StreamId, QuicError)>,
}

struct ReadCb {
    events: Rc<RefCell<ReadEvents>>,
}

impl ReadCallback for ReadCb {
    fn read_available(&self, _transport: &mut QuicTransport, id: StreamId) {
        self.events.borrow_mut().available.push(id);
    }

    fn read_error(&self, _transport: &mut QuicTransport, id: StreamId, error: QuicError) {
        self.events.borrow_mut().errors.push((id, error));
    }
}

#[derive(Default)]
struct ByteEvents {
    registered: Vec<(ByteEventKind, StreamId, u64)>,
    fired: Vec<(ByteEventKind, StreamId, u64, Duration)>,
    canceled: Vec<(ByteEventKind, StreamId, u64)>,
}

struct ByteEventCb {
    events: Rc<RefCell<ByteEvents>>,
}

impl ByteEventCallback for ByteEventCb {
    fn on_byte_event_registered(&self, _transport: &mut QuicTransport, event: ByteEvent) {
        self.events
            .borrow_mut()
            .registered
            .push((event.kind, event.id, event.offset));
    }

    fn on_byte_event(&self, _transport: &mut QuicTransport, event: ByteEvent) {
        self.events
            .borrow_mut()
            .fired
            .push((event.kind, event.id, event.offset, event.srtt));
    }

    fn on_byte_event_canceled(
        &self,
        _transport: &mut QuicTransport,
        cancellation: ByteEventCancellation,
    ) {
        self.events
            .borrow_mut()
            .canceled
            .push((cancellation.kind, cancellation.id, cancellation.offset));
    }
}

struct DatagramCb {
    notified: Rc<Cell<u32>>,
}

impl DatagramCallback for DatagramCb {
    fn on_datagrams_available(&self, _transport: &mut QuicTransport) {
        self.notified.set(self.notified.get() + 1);
    }
}

struct PingCb {
    pings: Rc<Cell<u32>>,
    acks: Rc<Cell<u32>>,
    timeouts: Rc<Cell<u32>>,
}

impl PingCallback for PingCb {
    fn on_ping(&self, _transport: &mut QuicTransport) {
        self.pings.set(self.pings.get() + 1);
    }

    fn ping_acknowledged(&self, _transport: &mut QuicTransport) {
        self.acks.set(self.acks.get() + 1);
    }

    fn ping_timeout(&self, _transport: &mut QuicTransport) {
        self.timeouts.set(self.timeouts.get() + 1);
    }
}

//
// Harness
//

struct TestTransport {
    transport: QuicTransport,
    ops: Rc<RefCell<VecDeque<CodecOp>>>,
    wire: Rc<RefCell<Vec<WireEvent>>>,
    socket_log: Rc<RefCell<SocketLog>>,
    loss_alarms: Rc<Cell<u32>>,
    peer: SocketAddr,
    now: Instant,
}

impl TestTransport {
    fn new(side: Side, settings: TransportSettings) -> Self {
        subscribe();
        let ops = Rc::new(RefCell::new(VecDeque::new()));
        let wire = Rc::new(RefCell::new(Vec::new()));
        let socket_log = Rc::new(RefCell::new(SocketLog::default()));
        let loss_alarms = Rc::new(Cell::new(0));
        let peer = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433);
        let now = Instant::now();
        let codec = TestCodec {
            ops: ops.clone(),
            wire: wire.clone(),
            next_rx_packet: 0,
            next_tx_packet: 0,
            loss_alarms: loss_alarms.clone(),
        };
        let transport = QuicTransport::new(
            side,
            peer,
            settings,
            Box::new(codec),
            Box::new(TestControllerFactory),
            Box::new(TestSocket {
                log: socket_log.clone(),
            }),
            now,
        );
        Self {
            transport,
            ops,
            wire,
            socket_log,
            loss_alarms,
            peer,
            now,
        }
    }

    fn client(settings: TransportSettings) -> Self {
        Self::new(Side::Client, settings)
    }

    fn server(settings: TransportSettings) -> Self {
        Self::new(Side::Server, settings)
    }

    /// Deliver one scripted packet through the ingress path, then let the
    /// loopers it scheduled run
    fn deliver(&mut self, op: CodecOp) {
        self.ops.borrow_mut().push_back(op);
        let packet = crate::ReceivedUdpPacket::new(Bytes::from_static(b"pkt"), self.now);
        self.transport
            .on_network_data(self.peer, NetworkData::single(packet), self.now);
        self.drive();
    }

    /// Run event-loop turns until nothing is scheduled (bounded)
    fn drive(&mut self) {
        for _ in 0..16 {
            if !self.transport.has_pending_loop_work(self.now) {
                break;
            }
            self.transport.process_events(self.now);
        }
    }

    /// Advance the clock, expiring timers and running loop turns
    fn advance(&mut self, d: Duration) {
        self.now += d;
        self.transport.handle_timeout(self.now);
        self.drive();
    }

    fn wire_events(&self) -> Vec<WireEvent> {
        self.wire.borrow().clone()
    }
}

fn default_settings() -> TransportSettings {
    TransportSettings::default()
}

//
// Scenarios
//

#[test]
fn s1_idle_timeout_closes_with_drain() {
    let mut settings = default_settings();
    settings.idle_timeout(Duration::from_millis(100));
    let mut t = TestTransport::client(settings);
    let events = Rc::new(RefCell::new(ConnEvents::default()));
    t.transport
        .set_connection_callback(Some(Rc::new(ConnCb {
            events: events.clone(),
        })));
    t.transport.notify_transport_ready();

    assert!(t.transport.good());
    t.advance(Duration::from_millis(99));
    assert!(t.transport.good());

    t.advance(Duration::from_millis(1));
    assert_eq!(t.transport.get_close_state(), CloseState::Closed);
    let error = t.transport.error().expect("close error recorded");
    assert_eq!(error.code, ErrorCode::Local(LocalErrorCode::IdleTimeout));
    // Drain timer armed, socket still bound until it expires
    assert!(t.transport.timer_deadline(Timer::Drain).is_some());
    assert!(!t.socket_log.borrow().closed);
    // The app heard about the close exactly once
    assert_eq!(events.borrow().errors.borrow().len(), 1);

    // Idle close does not send a close packet
    assert!(!t.wire_events().contains(&WireEvent::Close));

    t.advance(Duration::from_secs(2));
    assert!(t.socket_log.borrow().closed);
}

#[test]
fn s2_delivery_callback_fires_and_stream_reaps() {
    let mut t = TestTransport::client(default_settings());
    let events = Rc::new(RefCell::new(ByteEvents::default()));
    let cb = Rc::new(ByteEventCb {
        events: events.clone(),
    });

    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .write_chain(id, Bytes::from_static(b"hello"), true, Some(cb), t.now)
        .unwrap();
    assert_eq!(
        events.borrow().registered,
        vec![(ByteEventKind::Ack, id, 5)]
    );

    // Flush the stream to the wire
    t.drive();
    assert!(t
        .wire_events()
        .contains(&WireEvent::StreamData { id, bytes: 5, fin: true }));

    // Peer acks through the fin
    t.deliver(CodecOp::AckStream {
        id,
        offset: 5,
        finish: true,
    });
    let fired = events.borrow().fired.clone();
    assert_eq!(fired.len(), 1);
    assert_eq!((fired[0].0, fired[0].1, fired[0].2), (ByteEventKind::Ack, id, 5));
    // Nothing holds the stream open: it is reaped
    assert_eq!(t.transport.get_connections_stats().num_streams, 0);
    assert!(events.borrow().canceled.is_empty());
}

#[test]
fn s3_null_read_callback_with_error_sends_stop_sending() {
    let mut t = TestTransport::server(default_settings());
    let id = StreamId::new(Side::Client, Dir::Bi, 1);
    assert_eq!(id.0, 4);
    t.deliver(CodecOp::NewPeerStream(id, None));

    let read_events = Rc::new(RefCell::new(ReadEvents::default()));
    t.transport
        .set_read_callback(
            id,
            Some(Rc::new(ReadCb {
                events: read_events.clone(),
            })),
            None,
            t.now,
        )
        .unwrap();

    t.transport
        .set_read_callback(id, None, Some(ApplicationErrorCode(7)), t.now)
        .unwrap();
    t.drive();
    assert!(t
        .wire_events()
        .contains(&WireEvent::StopSending(id, ApplicationErrorCode(7))));
}

#[test]
fn s4_graceful_close_waits_for_streams() {
    let mut t = TestTransport::client(default_settings());
    let events = Rc::new(RefCell::new(ConnEvents::default()));
    t.transport
        .set_connection_callback(Some(Rc::new(ConnCb {
            events: events.clone(),
        })));
    t.transport.notify_transport_ready();

    let read_events = Rc::new(RefCell::new(ReadEvents::default()));
    let a = t.transport.create_bidirectional_stream().unwrap();
    let b = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .set_read_callback(
            a,
            Some(Rc::new(ReadCb {
                events: read_events.clone(),
            })),
            None,
            t.now,
        )
        .unwrap();
    t.transport
        .write_chain(a, Bytes::from_static(b"tail"), true, None, t.now)
        .unwrap();

    t.transport.close_gracefully(t.now);
    assert_eq!(t.transport.get_close_state(), CloseState::GracefulClosing);
    // App callbacks were cancelled with no error
    let errors = read_events.borrow().errors.clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].1.code,
        ErrorCode::Local(LocalErrorCode::NoError)
    );

    // Streams drain one by one; the close completes with the last reap
    t.drive();
    t.deliver(CodecOp::AckStream {
        id: a,
        offset: 4,
        finish: true,
    });
    assert_eq!(t.transport.get_close_state(), CloseState::GracefulClosing);
    t.deliver(CodecOp::AckStream {
        id: b,
        offset: 0,
        finish: true,
    });
    assert_eq!(t.transport.get_close_state(), CloseState::Closed);
}

#[test]
fn s5_l4s_validation_success_and_failure() {
    let mut settings = default_settings();
    settings.use_l4s_ecn(true);
    let mut t = TestTransport::client(settings);
    // Construction pushed ECT1 into the socket TOS
    assert_eq!(
        t.socket_log.borrow().tos_values.last().copied(),
        Some(EcnCodepoint::Ect1 as u8)
    );

    {
        let conn = t.transport.conn_mut();
        assert_eq!(conn.ecn_state, EcnState::AttemptingL4s);
        conn.loss_state.total_packets_sent = 20;
        conn.ack_states.app_data.minimum_expected_ecn_marks_echoed = 15;
        conn.ack_states.app_data.ecn_ect1_count_echoed = 13;
        conn.ack_states.app_data.ecn_ce_count_echoed = 2;
    }
    t.deliver(CodecOp::Stale);
    assert_eq!(t.transport.conn_mut().ecn_state, EcnState::ValidatedL4s);
    let trackers_before = t.transport.conn_mut().ecn_state;
    assert_eq!(trackers_before, EcnState::ValidatedL4s);

    // Revalidation is idempotent: the tracker is installed exactly once
    t.deliver(CodecOp::Stale);
    assert_eq!(t.transport.conn_mut().ecn_state, EcnState::ValidatedL4s);

    // An ECT0 echo is corruption for L4S
    t.transport.conn_mut().ack_states.app_data.ecn_ect0_count_echoed = 1;
    t.deliver(CodecOp::Stale);
    assert_eq!(t.transport.conn_mut().ecn_state, EcnState::FailedValidation);
    // The ECN nibble was cleared on the socket
    assert_eq!(t.socket_log.borrow().tos_values.last().copied(), Some(0));
}

#[test]
fn s6_write_chain_on_receive_only_stream_rejected() {
    let mut t = TestTransport::server(default_settings());
    let id = StreamId::new(Side::Client, Dir::Uni, 0);
    t.deliver(CodecOp::NewPeerStream(id, None));
    let before = t.wire_events().len();

    let result = t.transport.write_chain(
        id,
        Bytes::from_static(b"nope"),
        false,
        None,
        t.now,
    );
    assert_eq!(result, Err(LocalErrorCode::InvalidOperation));
    t.drive();
    assert_eq!(t.wire_events().len(), before);
}

//
// Invariants and smaller behaviors
//

#[test]
fn close_state_is_monotone_and_second_close_is_noop() {
    let mut t = TestTransport::client(default_settings());
    t.transport.close(None, t.now);
    assert_eq!(t.transport.get_close_state(), CloseState::Closed);
    assert!(t.transport.timer_deadline(Timer::Drain).is_some());
    // A second close is a true no-op: the connection keeps draining and the
    // socket stays bound
    t.transport.close(None, t.now);
    assert_eq!(t.transport.get_close_state(), CloseState::Closed);
    assert!(t.transport.timer_deadline(Timer::Drain).is_some());
    assert!(!t.socket_log.borrow().closed);
}

#[test]
fn close_now_expires_a_pending_drain() {
    let mut t = TestTransport::client(default_settings());
    t.transport.close(None, t.now);
    assert!(t.transport.timer_deadline(Timer::Drain).is_some());
    assert!(!t.socket_log.borrow().closed);
    // close_impl itself no-ops, but the drain left by the previous close is
    // expired so the socket still comes down
    t.transport.close_now(None, t.now);
    assert!(t.transport.timer_deadline(Timer::Drain).is_none());
    assert!(t.socket_log.borrow().closed);
}

#[test]
fn close_cancels_timers_and_stops_loopers() {
    let mut t = TestTransport::client(default_settings());
    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .write_chain(id, Bytes::from_static(b"x"), false, None, t.now)
        .unwrap();
    t.transport.send_ping(Duration::from_secs(1), t.now);

    t.transport.close(None, t.now);
    for timer in Timer::VALUES {
        if timer == Timer::Drain {
            continue;
        }
        assert!(
            t.transport.timer_deadline(timer).is_none(),
            "{timer:?} should be cancelled"
        );
    }
    assert!(!t.transport.has_pending_loop_work(t.now) || t.transport.deferred.is_empty());
    assert_eq!(t.transport.conn_mut().outstandings.num_outstanding(), 0);
    // A close packet went out
    assert!(t.wire_events().contains(&WireEvent::Close));
}

#[test]
fn byte_events_ordered_and_duplicates_rejected() {
    let mut t = TestTransport::client(default_settings());
    let events = Rc::new(RefCell::new(ByteEvents::default()));
    let cb: Rc<dyn ByteEventCallback> = Rc::new(ByteEventCb {
        events: events.clone(),
    });

    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .write_chain(id, Bytes::from(vec![0u8; 100]), false, None, t.now)
        .unwrap();

    t.transport
        .register_delivery_callback(id, 50, cb.clone(), t.now)
        .unwrap();
    t.transport
        .register_delivery_callback(id, 10, cb.clone(), t.now)
        .unwrap();
    t.transport
        .register_delivery_callback(id, 90, cb.clone(), t.now)
        .unwrap();
    assert_eq!(
        t.transport
            .register_delivery_callback(id, 50, cb.clone(), t.now),
        Err(LocalErrorCode::InvalidOperation)
    );
    assert_eq!(t.transport.get_num_byte_event_callbacks_for_stream(id), 3);

    t.drive();
    t.deliver(CodecOp::AckStream {
        id,
        offset: 60,
        finish: false,
    });
    let fired: Vec<u64> = events.borrow().fired.iter().map(|f| f.2).collect();
    assert_eq!(fired, vec![10, 50]);

    // Close cancels the remainder exactly once
    t.transport.close(None, t.now);
    let canceled: Vec<u64> = events.borrow().canceled.iter().map(|c| c.2).collect();
    assert_eq!(canceled, vec![90]);
}

#[test]
fn byte_event_already_reached_fires_async() {
    let mut t = TestTransport::client(default_settings());
    let events = Rc::new(RefCell::new(ByteEvents::default()));
    let cb: Rc<dyn ByteEventCallback> = Rc::new(ByteEventCb {
        events: events.clone(),
    });
    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .write_chain(id, Bytes::from_static(b"data"), false, None, t.now)
        .unwrap();
    t.drive();
    t.deliver(CodecOp::AckStream {
        id,
        offset: 3,
        finish: false,
    });

    // Registration for an already-acked offset fires on the next loop turn
    t.transport
        .register_delivery_callback(id, 2, cb, t.now)
        .unwrap();
    assert!(events.borrow().fired.is_empty());
    t.drive();
    let fired: Vec<u64> = events.borrow().fired.iter().map(|f| f.2).collect();
    assert_eq!(fired, vec![2]);
}

#[test]
fn tx_callbacks_fire_after_write_pass() {
    let mut t = TestTransport::client(default_settings());
    let events = Rc::new(RefCell::new(ByteEvents::default()));
    let cb: Rc<dyn ByteEventCallback> = Rc::new(ByteEventCb {
        events: events.clone(),
    });
    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .register_tx_callback(id, 3, cb, t.now)
        .unwrap();
    t.transport
        .write_chain(id, Bytes::from_static(b"abcd"), false, None, t.now)
        .unwrap();
    t.drive();
    let fired: Vec<_> = events
        .borrow()
        .fired
        .iter()
        .map(|f| (f.0, f.2))
        .collect();
    assert_eq!(fired, vec![(ByteEventKind::Tx, 3)]);
}

#[test]
fn read_path_delivers_data_and_eof() {
    let mut t = TestTransport::server(default_settings());
    let id = StreamId::new(Side::Client, Dir::Bi, 0);
    t.deliver(CodecOp::NewPeerStream(id, None));
    let read_events = Rc::new(RefCell::new(ReadEvents::default()));
    t.transport
        .set_read_callback(
            id,
            Some(Rc::new(ReadCb {
                events: read_events.clone(),
            })),
            None,
            t.now,
        )
        .unwrap();
    t.deliver(CodecOp::StreamData {
        id,
        data: Bytes::from_static(b"hello world"),
        eof: true,
    });
    assert!(!read_events.borrow().available.is_empty());

    let (data, eof) = t.transport.read(id, 6, t.now).unwrap();
    assert_eq!(&data[..], b"hello ");
    assert!(!eof);
    let (data, eof) = t.transport.read(id, 0, t.now).unwrap();
    assert!(data.is_empty());
    assert!(!eof);
    let (data, eof) = t.transport.read(id, u64::MAX, t.now).unwrap();
    assert_eq!(&data[..], b"world");
    assert!(eof);
}

#[test]
fn ordered_read_callbacks_ascend_within_a_turn() {
    let mut settings = default_settings();
    settings.ordered_read_callbacks(true);
    let mut t = TestTransport::server(settings);
    let a = StreamId::new(Side::Client, Dir::Bi, 0);
    let b = StreamId::new(Side::Client, Dir::Bi, 1);
    let c = StreamId::new(Side::Client, Dir::Bi, 2);
    let read_events = Rc::new(RefCell::new(ReadEvents::default()));
    for id in [a, b, c] {
        t.deliver(CodecOp::NewPeerStream(id, None));
        t.transport
            .set_read_callback(
                id,
                Some(Rc::new(ReadCb {
                    events: read_events.clone(),
                })),
                None,
                t.now,
            )
            .unwrap();
    }

    // Data arrives in a scrambled order within one receive pass
    for id in [c, a, b] {
        t.ops.borrow_mut().push_back(CodecOp::StreamData {
            id,
            data: Bytes::from_static(b"x"),
            eof: false,
        });
    }
    let packets = NetworkData {
        packets: (0..3)
            .map(|_| crate::ReceivedUdpPacket::new(Bytes::from_static(b"p"), t.now))
            .collect(),
    };
    t.transport.on_network_data(t.peer, packets, t.now);

    // One loop turn delivers each readable stream once, in ascending id order
    t.transport.process_events(t.now);
    assert_eq!(read_events.borrow().available, vec![a, b, c]);
}

#[test]
fn pause_and_resume_gate_read_callbacks() {
    let mut t = TestTransport::server(default_settings());
    let id = StreamId::new(Side::Client, Dir::Bi, 0);
    t.deliver(CodecOp::NewPeerStream(id, None));
    let read_events = Rc::new(RefCell::new(ReadEvents::default()));
    t.transport
        .set_read_callback(
            id,
            Some(Rc::new(ReadCb {
                events: read_events.clone(),
            })),
            None,
            t.now,
        )
        .unwrap();
    t.transport.pause_read(id).unwrap();
    assert_eq!(
        t.transport.pause_read(id),
        Err(LocalErrorCode::InvalidOperation)
    );
    t.deliver(CodecOp::StreamData {
        id,
        data: Bytes::from_static(b"x"),
        eof: false,
    });
    assert!(read_events.borrow().available.is_empty());

    t.transport.resume_read(id).unwrap();
    t.drive();
    let available = read_events.borrow().available.clone();
    assert!(!available.is_empty());
    assert!(available.iter().all(|&readable| readable == id));
}

#[test]
fn peer_reset_delivers_read_error_and_cancels_byte_events() {
    let mut t = TestTransport::client(default_settings());
    let byte_events = Rc::new(RefCell::new(ByteEvents::default()));
    let cb: Rc<dyn ByteEventCallback> = Rc::new(ByteEventCb {
        events: byte_events.clone(),
    });
    let read_events = Rc::new(RefCell::new(ReadEvents::default()));

    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .set_read_callback(
            id,
            Some(Rc::new(ReadCb {
                events: read_events.clone(),
            })),
            None,
            t.now,
        )
        .unwrap();
    t.transport
        .write_chain(id, Bytes::from(vec![1u8; 10]), false, None, t.now)
        .unwrap();
    t.transport
        .register_delivery_callback(id, 9, cb, t.now)
        .unwrap();

    t.deliver(CodecOp::PeerReset(id, ApplicationErrorCode(3)));
    let canceled: Vec<u64> = byte_events.borrow().canceled.iter().map(|c| c.2).collect();
    assert_eq!(canceled, vec![9]);
    let errors = read_events.borrow().errors.clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].1.code,
        ErrorCode::Application(ApplicationErrorCode(3))
    );
}

#[test]
fn keepalive_sends_ping_before_idle() {
    let mut settings = default_settings();
    settings
        .idle_timeout(Duration::from_millis(100))
        .enable_keepalive(true);
    let mut t = TestTransport::client(settings);
    t.advance(Duration::from_millis(86));
    assert!(t.wire_events().contains(&WireEvent::Ping));
    assert!(t.transport.good());
    // The write reset the idle timer, so the connection survives
    t.advance(Duration::from_millis(50));
    assert!(t.transport.good());
}

#[test]
fn ping_round_trip_and_timeout() {
    let mut t = TestTransport::client(default_settings());
    let pings = Rc::new(Cell::new(0));
    let acks = Rc::new(Cell::new(0));
    let timeouts = Rc::new(Cell::new(0));
    t.transport
        .set_ping_callback(Rc::new(PingCb {
            pings: pings.clone(),
            acks: acks.clone(),
            timeouts: timeouts.clone(),
        }))
        .unwrap();

    t.transport.send_ping(Duration::from_millis(50), t.now);
    t.drive();
    assert!(t.wire_events().contains(&WireEvent::Ping));
    t.deliver(CodecOp::PingAck);
    assert_eq!(acks.get(), 1);
    assert!(t.transport.timer_deadline(Timer::Ping).is_none());

    // Second ping is never acked
    t.transport.send_ping(Duration::from_millis(50), t.now);
    t.advance(Duration::from_millis(51));
    assert_eq!(timeouts.get(), 1);

    // Peer-initiated ping surfaces through on_ping
    t.deliver(CodecOp::Ping);
    assert_eq!(pings.get(), 1);
}

#[test]
fn datagram_buffers_and_callback() {
    let mut t = TestTransport::client(default_settings());
    let notified = Rc::new(Cell::new(0));
    t.transport
        .set_datagram_callback(Rc::new(DatagramCb {
            notified: notified.clone(),
        }))
        .unwrap();

    let limit = t.transport.get_datagram_size_limit();
    assert_eq!(limit, 1252 - 9);
    assert_eq!(
        t.transport
            .write_datagram(Bytes::from(vec![0u8; limit as usize + 1]), t.now),
        Err(LocalErrorCode::InvalidWriteData)
    );
    t.transport
        .write_datagram(Bytes::from_static(b"dgram"), t.now)
        .unwrap();
    t.drive();
    assert!(t.wire_events().contains(&WireEvent::Datagram(5)));

    t.deliver(CodecOp::Datagram(Bytes::from_static(b"aa")));
    t.deliver(CodecOp::Datagram(Bytes::from_static(b"bb")));
    // One notification per empty-to-nonempty transition
    assert_eq!(notified.get(), 1);
    let bufs = t.transport.read_datagrams(0).unwrap();
    assert_eq!(bufs.len(), 2);
}

#[test]
fn knob_routing() {
    let mut t = TestTransport::client(default_settings());
    let events = Rc::new(RefCell::new(ConnEvents::default()));
    t.transport
        .set_connection_callback(Some(Rc::new(ConnCb {
            events: events.clone(),
        })));
    t.transport.notify_transport_ready();

    // Outgoing knobs need the peer to have advertised support
    assert_eq!(
        t.transport
            .set_knob(1, 2, Bytes::from_static(b"v"), t.now),
        Err(LocalErrorCode::KnobFrameUnsupported)
    );
    t.transport.conn_mut().peer_advertised_knob_frame_support = true;
    t.transport
        .set_knob(1, 2, Bytes::from_static(b"v"), t.now)
        .unwrap();
    t.drive();
    assert!(t.wire_events().contains(&WireEvent::Knob(1, 2)));

    // Incoming non-transport knobs reach the app
    t.deliver(CodecOp::Knob(KnobFrame {
        knob_space: 9,
        knob_id: 1,
        blob: Bytes::from_static(b"blob"),
    }));
    assert_eq!(events.borrow().knobs, vec![(9, 1)]);

    // Transport-space knobs stay internal
    t.deliver(CodecOp::Knob(KnobFrame {
        knob_space: TRANSPORT_KNOB_SPACE,
        knob_id: 3,
        blob: Bytes::new(),
    }));
    assert_eq!(events.borrow().knobs, vec![(9, 1)]);
}

#[test]
fn peer_close_maps_to_no_error_close() {
    let mut t = TestTransport::client(default_settings());
    t.deliver(CodecOp::PeerClose);
    assert_eq!(t.transport.get_close_state(), CloseState::Closed);
    // The local close code records that we did not generate the close
    let error = t.transport.error().expect("close error recorded");
    assert_eq!(error.code, ErrorCode::Transport(TransportErrorCode::NO_ERROR));
    assert_eq!(error.message, "Peer closed");
}

#[test]
fn codec_fault_closes_with_sanitized_message() {
    let mut t = TestTransport::client(default_settings());
    t.deliver(CodecOp::Fault(TransportFault::Protocol {
        code: TransportErrorCode::PROTOCOL_VIOLATION,
        what: "frame soup".into(),
    }));
    assert_eq!(t.transport.get_close_state(), CloseState::Closed);
    let error = t.transport.error().unwrap();
    assert_eq!(
        error.code,
        ErrorCode::Transport(TransportErrorCode::PROTOCOL_VIOLATION)
    );
}

#[test]
fn dispatch_stops_after_callback_closes_connection() {
    let mut t = TestTransport::server(default_settings());
    let events = Rc::new(RefCell::new(ConnEvents {
        close_on_new_stream: true,
        ..ConnEvents::default()
    }));
    t.transport
        .set_connection_callback(Some(Rc::new(ConnCb {
            events: events.clone(),
        })));
    t.transport.notify_transport_ready();

    let first = StreamId::new(Side::Client, Dir::Bi, 0);
    let second = StreamId::new(Side::Client, Dir::Bi, 1);
    t.ops
        .borrow_mut()
        .push_back(CodecOp::NewPeerStream(first, None));
    t.ops
        .borrow_mut()
        .push_back(CodecOp::NewPeerStream(second, None));
    let packets = NetworkData {
        packets: vec![
            crate::ReceivedUdpPacket::new(Bytes::from_static(b"a"), t.now),
            crate::ReceivedUdpPacket::new(Bytes::from_static(b"b"), t.now),
        ],
    };
    t.transport.on_network_data(t.peer, packets, t.now);

    // The first announcement closed the connection; the second never fired
    assert_eq!(events.borrow().new_streams, vec![first]);
    assert_eq!(t.transport.get_close_state(), CloseState::Closed);
}

#[test]
fn flow_control_invariants_hold() {
    let mut t = TestTransport::client(default_settings());
    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .write_chain(id, Bytes::from(vec![0u8; 1000]), false, None, t.now)
        .unwrap();

    let conn_max = t.transport.max_writable_on_conn();
    let stream_max = t.transport.get_max_writable_on_stream(id).unwrap();
    assert!(stream_max <= conn_max);

    let buffered = 1000;
    assert_eq!(
        t.transport.buffer_space_available() + buffered,
        t.transport.get_transport_settings().total_buffer_space_available
    );
}

#[test]
fn loss_timer_fires_collaborator_alarm() {
    let mut t = TestTransport::client(default_settings());
    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .write_chain(id, Bytes::from_static(b"probe me"), false, None, t.now)
        .unwrap();
    t.drive();
    assert!(t.transport.timer_deadline(Timer::LossDetection).is_some());

    t.advance(Duration::from_secs(2));
    assert!(t.loss_alarms.get() >= 1);
    assert!(t.transport.conn_mut().loss_state.pto_count >= 1);
}

#[test]
fn streams_available_fires_on_limit_increase() {
    let mut settings = default_settings();
    settings.max_local_bidirectional_streams = 1;
    let mut t = TestTransport::client(settings);
    let events = Rc::new(RefCell::new(ConnEvents::default()));
    t.transport
        .set_connection_callback(Some(Rc::new(ConnCb {
            events: events.clone(),
        })));
    t.transport.notify_transport_ready();

    t.transport.create_bidirectional_stream().unwrap();
    assert_eq!(
        t.transport.create_bidirectional_stream(),
        Err(LocalErrorCode::InvalidOperation)
    );

    t.transport
        .conn_mut()
        .streams
        .set_max_local_bidirectional_streams(3);
    t.deliver(CodecOp::Stale);
    assert_eq!(events.borrow().streams_available, vec![2]);
}

#[test]
fn app_limited_declared_after_draining_write() {
    let mut t = TestTransport::client(default_settings());
    let events = Rc::new(RefCell::new(ConnEvents::default()));
    t.transport
        .set_connection_callback(Some(Rc::new(ConnCb {
            events: events.clone(),
        })));
    t.transport.notify_transport_ready();

    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .write_chain(id, Bytes::from_static(b"small"), false, None, t.now)
        .unwrap();
    t.drive();
    assert!(events.borrow().app_limited.get() >= 1);
    assert!(t.transport.get_transport_info().app_limited);
}

#[test]
fn detach_and_attach_round_trip() {
    let mut t = TestTransport::client(default_settings());
    assert!(t.transport.is_detachable());
    let socket = t.transport.detach_event_base().expect("socket returned");
    assert!(t.transport.timer_deadline(Timer::Idle).is_none());

    t.transport.attach_event_base(socket, t.now);
    assert!(t.transport.timer_deadline(Timer::Idle).is_some());
}

#[test]
fn server_is_not_detachable() {
    let t = TestTransport::server(default_settings());
    assert!(!t.transport.is_detachable());
}

#[test]
fn unpaced_bbr_downgraded_to_cubic() {
    let mut settings = default_settings();
    settings.congestion_controller(CongestionControlType::Bbr);
    let t = TestTransport::client(settings);
    assert_matches!(
        t.transport.get_transport_info().congestion_control_type,
        Some(CongestionControlType::Cubic)
    );

    let mut settings = default_settings();
    settings
        .congestion_controller(CongestionControlType::Bbr)
        .pacing_enabled(true);
    let t = TestTransport::client(settings);
    assert_matches!(
        t.transport.get_transport_info().congestion_control_type,
        Some(CongestionControlType::Bbr)
    );
}

#[test]
fn stop_sending_skipped_when_recv_closed() {
    let mut t = TestTransport::server(default_settings());
    let id = StreamId::new(Side::Client, Dir::Bi, 0);
    t.deliver(CodecOp::NewPeerStream(id, None));
    t.deliver(CodecOp::StreamData {
        id,
        data: Bytes::from_static(b"x"),
        eof: true,
    });
    let (_, eof) = t.transport.read(id, 100, t.now).unwrap();
    assert!(eof);

    let before = t.wire_events().len();
    t.transport
        .stop_sending(id, ApplicationErrorCode(1), t.now)
        .unwrap();
    t.drive();
    assert_eq!(t.wire_events().len(), before);
}

#[test]
fn peer_stop_sending_reaches_app() {
    let mut t = TestTransport::client(default_settings());
    let events = Rc::new(RefCell::new(ConnEvents::default()));
    t.transport
        .set_connection_callback(Some(Rc::new(ConnCb {
            events: events.clone(),
        })));
    t.transport.notify_transport_ready();

    let id = t.transport.create_bidirectional_stream().unwrap();
    t.deliver(CodecOp::PeerStopSending(id, ApplicationErrorCode(11)));
    assert_eq!(
        events.borrow().stop_sending,
        vec![(id, ApplicationErrorCode(11))]
    );
}

#[test]
fn reset_stream_emits_frame_and_drops_write_state() {
    let mut t = TestTransport::client(default_settings());
    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .write_chain(id, Bytes::from(vec![0u8; 64]), false, None, t.now)
        .unwrap();
    t.transport
        .reset_stream(id, ApplicationErrorCode(9), t.now)
        .unwrap();
    t.drive();
    assert!(t
        .wire_events()
        .contains(&WireEvent::Reset(id, ApplicationErrorCode(9))));
    // Buffered bytes were released
    assert_eq!(
        t.transport.buffer_space_available(),
        t.transport.get_transport_settings().total_buffer_space_available
    );
}

#[test]
fn stale_packets_bump_read_loop_detector() {
    struct Detector {
        stale: Cell<u64>,
    }
    impl LoopDetectorCallback for Detector {
        fn on_suspicious_read_loops(&self, loop_count: u64, _reason: NoReadReason) {
            self.stale.set(loop_count);
        }
        fn on_suspicious_write_loops(&self, _loop_count: u64, _reason: NoWriteReason) {}
    }

    let mut t = TestTransport::client(default_settings());
    let detector = Rc::new(Detector {
        stale: Cell::new(0),
    });
    t.transport.set_loop_detector_callback(Some(detector.clone()));

    t.deliver(CodecOp::Stale);
    t.deliver(CodecOp::Stale);
    assert_eq!(detector.stale.get(), 2);
    // Real progress resets the counter
    t.deliver(CodecOp::Ping);
    t.deliver(CodecOp::Stale);
    assert_eq!(detector.stale.get(), 1);
}

#[test]
fn conn_write_ready_fires_when_budget_exists() {
    #[derive(Default)]
    struct WriteReady {
        conn_ready: Cell<u32>,
        stream_ready: RefCell<Vec<(StreamId, u64)>>,
    }
    struct WriteCb {
        state: Rc<WriteReady>,
    }
    impl WriteCallback for WriteCb {
        fn connection_write_ready(&self, _t: &mut QuicTransport, _max: u64) {
            self.state.conn_ready.set(self.state.conn_ready.get() + 1);
        }
        fn stream_write_ready(&self, _t: &mut QuicTransport, id: StreamId, max: u64) {
            self.state.stream_ready.borrow_mut().push((id, max));
        }
    }

    let mut t = TestTransport::client(default_settings());
    let state = Rc::new(WriteReady::default());
    t.transport
        .notify_pending_write_on_connection(Rc::new(WriteCb {
            state: state.clone(),
        }))
        .unwrap();
    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .notify_pending_write_on_stream(
            id,
            Rc::new(WriteCb {
                state: state.clone(),
            }),
        )
        .unwrap();
    // Double registration is rejected
    assert_eq!(
        t.transport.notify_pending_write_on_stream(
            id,
            Rc::new(WriteCb {
                state: state.clone()
            })
        ),
        Err(LocalErrorCode::InvalidWriteCallback)
    );

    t.drive();
    assert_eq!(state.conn_ready.get(), 1);
    let stream_ready = state.stream_ready.borrow().clone();
    assert_eq!(stream_ready.len(), 1);
    assert_eq!(stream_ready[0].0, id);
    assert!(stream_ready[0].1 > 0);
}

#[test]
fn read_on_errored_stream_closes_connection() {
    let mut t = TestTransport::client(default_settings());
    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .conn_mut()
        .streams
        .get_stream_mut(id)
        .unwrap()
        .read_error = Some(QuicError::transport(
        TransportErrorCode::FLOW_CONTROL_ERROR,
        "flow gone wrong",
    ));
    assert_eq!(
        t.transport.read(id, 10, t.now),
        Err(LocalErrorCode::TransportError)
    );
    assert_eq!(t.transport.get_close_state(), CloseState::Closed);
    // The sanitized context goes in the close error, not the raw message
    assert_eq!(t.transport.error().unwrap().message, "read() error");
}

#[test]
fn blocked_socket_arms_writable_event_and_resumes() {
    let mut settings = default_settings();
    settings.use_sock_writable_events(true);
    let mut t = TestTransport::client(settings);
    let id = t.transport.create_bidirectional_stream().unwrap();

    t.transport.conn_mut().write_blocked_on_socket = true;
    t.transport
        .write_chain(id, Bytes::from_static(b"held"), false, None, t.now)
        .unwrap();
    t.transport.process_events(t.now);
    // The pass wrote nothing, then parked the write looper on the socket
    // event instead of spinning
    assert_eq!(t.socket_log.borrow().writable_requests, 1);
    assert!(!t.transport.has_pending_loop_work(t.now));
    assert!(t.wire_events().is_empty());

    t.transport.on_socket_writable(t.now);
    assert!(t.transport.has_pending_loop_work(t.now));
    t.drive();
    assert!(t
        .wire_events()
        .iter()
        .any(|e| matches!(e, WireEvent::StreamData { .. })));
}

#[test]
fn stream_groups_and_retransmission_policies() {
    let mut settings = default_settings();
    settings.advertised_max_stream_groups(4);
    let mut t = TestTransport::client(settings);

    let group = t.transport.create_bidirectional_stream_group().unwrap();
    let id = t
        .transport
        .create_bidirectional_stream_in_group(group)
        .unwrap();
    assert_eq!(
        t.transport.conn_mut().streams.get_stream(id).unwrap().group_id,
        Some(group)
    );
    // Unknown group is rejected
    assert_eq!(
        t.transport
            .create_bidirectional_stream_in_group(StreamGroupId(999)),
        Err(LocalErrorCode::InvalidOperation)
    );

    let policy = StreamGroupRetransmissionPolicy {
        disable_retransmission: true,
    };
    t.transport
        .set_stream_group_retransmission_policy(group, Some(policy))
        .unwrap();
    assert_eq!(
        t.transport.get_stream_group_retransmission_policy(group),
        Some(policy)
    );
    // The override limit maps to its own error code
    for index in 0..20 {
        let result = t
            .transport
            .set_stream_group_retransmission_policy(StreamGroupId(index * 2), Some(policy));
        if index >= 16 {
            assert_eq!(result, Err(LocalErrorCode::RtxPoliciesLimitExceeded));
        } else {
            assert_eq!(result, Ok(()));
        }
    }
    t.transport
        .set_stream_group_retransmission_policy(group, None)
        .unwrap();
    assert_eq!(t.transport.get_stream_group_retransmission_policy(group), None);
}

#[test]
fn excess_write_timer_yields_between_passes() {
    let mut settings = default_settings();
    settings.schedule_timer_for_excess_writes(true);
    let mut t = TestTransport::client(settings);
    let id = t.transport.create_bidirectional_stream().unwrap();
    t.transport
        .write_chain(id, Bytes::from(vec![0u8; 10]), false, None, t.now)
        .unwrap();
    // First pass drains the stream but pings remain possible; the timer only
    // arms while data is still pending after the pass
    t.transport.process_events(t.now);
    assert!(t.transport.timer_deadline(Timer::ExcessWrite).is_none());
}
