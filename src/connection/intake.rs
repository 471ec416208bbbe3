//! Network-data intake: receive, per-packet state update, callback dispatch,
//! timer rearm.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, trace};

use crate::callbacks::{ByteEvent, ByteEventKind};
use crate::connection::state::CloseState;
use crate::connection::QuicTransport;
use crate::error::{QuicError, TransportErrorCode, TransportFault};
use crate::looper::NoReadReason;
use crate::observer::{
    AcksProcessedEvent, KnobFrameEvent, PacketsReceivedEvent, ReceivedPacketInfo,
};
use crate::socket::NetworkData;
use crate::{Dir, TRANSPORT_KNOB_SPACE};

impl QuicTransport {
    /// Ingress entry point: decode a batch of datagrams, mutate connection
    /// state, dispatch callbacks, rearm timers
    pub fn on_network_data(&mut self, peer: SocketAddr, data: NetworkData, now: Instant) {
        // If per-socket-read batching is on, the embedder runs the write
        // looper itself after all socket reads
        let schedule_write_looper = !self.conn.transport_settings.network_data_per_socket_read;

        if let Err(fault) = self.on_network_data_inner(peer, data, now) {
            debug!(what = fault.what(), "onNetworkData error");
            self.exception_close_what = Some(fault.what().to_string());
            let error = self.sanitize_fault(&fault);
            self.close_impl(Some(error), true, true, now);
        }

        self.check_for_closed_stream(now);
        self.update_read_looper();
        self.update_peek_looper();
        if schedule_write_looper {
            let run_inline = self.conn.transport_settings.inline_write_after_read;
            self.update_write_looper(true, run_inline, now);
        }
    }

    fn on_network_data_inner(
        &mut self,
        peer: SocketAddr,
        data: NetworkData,
        now: Instant,
    ) -> Result<(), TransportFault> {
        self.conn.loss_state.total_bytes_recvd += data.total_data();
        let original_ack_version = self.conn.ack_states.current_version();

        if !self.observers.is_empty() {
            let event = PacketsReceivedEvent {
                receive_loop_time: now,
                num_packets_received: data.packets.len() as u64,
                num_bytes_received: data.total_data(),
                packets: data
                    .packets
                    .iter()
                    .map(|p| ReceivedPacketInfo {
                        receive_time: p.receive_time,
                        num_bytes: p.data.len() as u64,
                        tos: p.tos,
                    })
                    .collect(),
            };
            self.observers
                .for_each(|observer| observer.packets_received(&event));
        }

        let mut processed_callbacks = false;
        for packet in data.packets {
            self.codec.on_read_data(&mut self.conn, peer, packet)?;
            if self.conn.peer_connection_error.is_some() {
                self.close_impl(
                    Some(QuicError::transport(
                        TransportErrorCode::NO_ERROR,
                        "Peer closed",
                    )),
                    true,
                    true,
                    now,
                );
                return Ok(());
            }
            if self.conn.transport_settings.process_callbacks_per_packet {
                self.process_callbacks_after_network_data(now);
                self.invoke_read_data_and_callbacks(now);
                processed_callbacks = true;
            }
        }

        // Avoid dispatching twice for the last packet
        if !processed_callbacks {
            self.process_callbacks_after_network_data(now);
        }

        if self.close_state != CloseState::Closed {
            if self.conn.ack_states.current_version() != original_ack_version {
                self.set_idle_timer(now);
                self.conn.received_new_packet_before_write = true;
                self.read_loop_count = 0;
            } else if let Some(detector) = self.loop_detector.clone() {
                self.read_loop_count += 1;
                detector.on_suspicious_read_loops(self.read_loop_count, NoReadReason::StaleData);
            }
            // Reading data could process an ack and move the loss timer, and
            // could change ack state; both timers need explicit rearming
            self.set_loss_detection_alarm(now);
            self.schedule_ack_timeout(now);
            // A valid path response cancels the validation timer
            self.schedule_path_validation_timeout(now);
            self.validate_ecn_state();
        } else {
            // In the closed state the write looper is stopped, but a pending
            // close packet should still go out
            self.write_socket_data(now)?;
        }
        Ok(())
    }

    /// Map a collaborator fault to the close error, applying the message
    /// sanitization budget
    pub(crate) fn sanitize_fault(&self, fault: &TransportFault) -> QuicError {
        let budget = self.conn.transport_settings.udp_send_packet_len as usize;
        let mut message = fault.what().to_string();
        if message.len() > budget {
            let mut cut = budget;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        fault.to_close_error(&message)
    }

    /// The fixed-order callback dispatch run after ingress
    ///
    /// Every step re-checks the close state and bails once a callback closed
    /// the connection.
    pub(crate) fn process_callbacks_after_network_data(&mut self, now: Instant) {
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_new_stream_callbacks(now);
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_ping_callbacks(now);
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_knob_callbacks();
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_ack_event_callbacks();
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_cancel_byte_event_callbacks(now);
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_delivery_callbacks(now);
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_stream_flow_control_updated_callbacks(now);
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_stream_stop_sending_callbacks(now);
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_conn_writable(now);
        if self.close_state != CloseState::Open {
            return;
        }

        self.invoke_streams_available_callbacks(now);
        if self.close_state != CloseState::Open {
            return;
        }

        self.handle_datagram_callbacks(now);
        self.cleanup_ack_event_state();
    }

    /// Steps 1 and 2: announce peer-opened streams, plain and grouped
    fn handle_new_stream_callbacks(&mut self, now: Instant) {
        let new_streams = self.conn.streams.take_new_peer_streams();
        let (grouped, plain): (Vec<_>, Vec<_>) = new_streams
            .into_iter()
            .partition(|id| {
                self.conn
                    .streams
                    .get_stream(*id)
                    .map(|s| s.group_id.is_some())
                    .unwrap_or(false)
            });

        let Some(cb) = self.connection_callback.clone() else {
            return;
        };
        for id in plain {
            if self.close_state != CloseState::Open {
                return;
            }
            if let Some(qlogger) = &self.qlogger {
                qlogger.add_transport_state_update(format!("new stream {}", id.0));
            }
            match id.dir() {
                Dir::Bi => cb.on_new_bidirectional_stream(self, id),
                Dir::Uni => cb.on_new_unidirectional_stream(self, id),
            }
        }
        if self.close_state != CloseState::Open {
            return;
        }

        for (group, dir) in self.conn.streams.take_new_peer_stream_groups() {
            if self.close_state != CloseState::Open {
                return;
            }
            match dir {
                Dir::Bi => cb.on_new_bidirectional_stream_group(self, group),
                Dir::Uni => cb.on_new_unidirectional_stream_group(self, group),
            }
        }
        for id in grouped {
            if self.close_state != CloseState::Open {
                return;
            }
            let Some(group) = self
                .conn
                .streams
                .get_stream(id)
                .and_then(|s| s.group_id)
            else {
                continue;
            };
            match id.dir() {
                Dir::Bi => cb.on_new_bidirectional_stream_in_group(self, id, group),
                Dir::Uni => cb.on_new_unidirectional_stream_in_group(self, id, group),
            }
        }
        let _ = now;
    }

    /// Step 3: surface received pings and acknowledged pings
    fn handle_ping_callbacks(&mut self, now: Instant) {
        if self.conn.pending_events.notify_ping_received {
            self.conn.pending_events.notify_ping_received = false;
            if let Some(cb) = self.ping_callback.clone() {
                cb.on_ping(self);
            }
        }
        if self.close_state != CloseState::Open {
            return;
        }
        if self.conn.pending_events.cancel_ping_timeout {
            self.conn.pending_events.cancel_ping_timeout = false;
            self.timers.stop(crate::timer::Timer::Ping);
            if let Some(cb) = self.ping_callback.clone() {
                cb.ping_acknowledged(self);
            }
        }
        let _ = now;
    }

    /// Step 4: route received knob frames
    fn handle_knob_callbacks(&mut self) {
        let knobs = std::mem::take(&mut self.conn.pending_events.received_knobs);
        if knobs.is_empty() {
            return;
        }
        if !self.conn.transport_settings.advertised_knob_frame_support {
            debug!(count = knobs.len(), "dropping knobs, support not advertised");
            return;
        }
        for knob in knobs {
            if self.close_state != CloseState::Open {
                return;
            }
            if knob.knob_space == TRANSPORT_KNOB_SPACE {
                self.on_transport_knobs(&knob);
            } else {
                self.observers.for_each(|observer| {
                    observer.knob_frame_received(&KnobFrameEvent {
                        knob_space: knob.knob_space,
                        knob_id: knob.knob_id,
                        len: knob.blob.len(),
                    })
                });
                if let Some(cb) = self.connection_callback.clone() {
                    cb.on_knob(knob.knob_space, knob.knob_id, knob.blob);
                }
            }
        }
    }

    /// Transport-internal knobs; none are currently defined beyond logging
    fn on_transport_knobs(&mut self, knob: &crate::connection::KnobFrame) {
        trace!(
            knob_id = knob.knob_id,
            len = knob.blob.len(),
            "transport knob received"
        );
    }

    /// Step 5: report processed acks to observers and packet processors
    fn handle_ack_event_callbacks(&mut self) {
        if self.conn.last_processed_ack_events.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.conn.last_processed_ack_events);
        for processor in self.packet_processors.clone() {
            for event in &events {
                processor.on_packet_ack(event);
            }
        }
        let event = AcksProcessedEvent {
            num_ack_events: events.len() as u64,
            srtt: self.conn.loss_state.srtt,
        };
        self.observers
            .for_each(|observer| observer.acks_processed(&event));
    }

    /// Step 6: peer resets cancel that stream's byte events
    fn handle_cancel_byte_event_callbacks(&mut self, now: Instant) {
        for id in self.conn.streams.take_pending_resets() {
            self.cancel_byte_event_callbacks_for_stream_impl(None, id, None, now);
            if self.close_state != CloseState::Open {
                return;
            }
        }
    }

    /// Step 7: deliver ACK byte events up to each stream's deliverable offset
    fn handle_delivery_callbacks(&mut self, now: Instant) {
        while let Some(id) = self.conn.streams.pop_deliverable() {
            let Some(largest) = self
                .conn
                .streams
                .get_stream(id)
                .and_then(|s| s.largest_deliverable_offset)
            else {
                continue;
            };
            // Acked bytes will never be retransmitted; free them
            if let Some(stream) = self.conn.streams.get_stream_mut(id) {
                let freed = stream.trim_write_buffer_to(largest + 1);
                self.conn.flow_control.sum_cur_stream_buffer_len = self
                    .conn
                    .flow_control
                    .sum_cur_stream_buffer_len
                    .saturating_sub(freed);
            }
            loop {
                if self.close_state != CloseState::Open {
                    return;
                }
                let Some(queue) = self.delivery_callbacks.get_mut(&id) else {
                    break;
                };
                let deliver = matches!(queue.first(), Some(detail) if detail.offset <= largest);
                if !deliver {
                    if queue.is_empty() {
                        self.delivery_callbacks.remove(&id);
                    }
                    break;
                }
                let detail = queue.remove(0);
                if queue.is_empty() {
                    self.delivery_callbacks.remove(&id);
                }
                let srtt = self.conn.loss_state.srtt;
                detail.cb.on_byte_event(
                    self,
                    ByteEvent {
                        id,
                        offset: detail.offset,
                        kind: ByteEventKind::Ack,
                        srtt,
                    },
                );
            }
            self.conn.streams.maybe_mark_closed(id);
        }
        self.check_for_closed_stream(now);
    }

    /// Step 8: flow control updates, and write-ready follow-ups they unlock
    fn handle_stream_flow_control_updated_callbacks(&mut self, now: Instant) {
        let updated = self.conn.streams.take_flow_control_updated();
        let cb = self.connection_callback.clone();
        for id in updated {
            if self.close_state != CloseState::Open {
                return;
            }
            if !self.conn.streams.stream_exists(id) {
                continue;
            }
            if let Some(cb) = &cb {
                cb.on_flow_control_update(self, id);
            }
            if self.close_state != CloseState::Open {
                return;
            }
            self.maybe_fire_stream_write_ready(id, now);
        }
    }

    /// Step 9: the peer asked us to stop sending
    fn handle_stream_stop_sending_callbacks(&mut self, now: Instant) {
        let Some(cb) = self.connection_callback.clone() else {
            return;
        };
        for (id, error) in self.conn.streams.take_stop_sending() {
            if self.close_state != CloseState::Open {
                return;
            }
            cb.on_stop_sending(self, id, error);
        }
        let _ = now;
    }

    /// Step 10: connection-level write readiness
    pub(crate) fn handle_conn_writable(&mut self, now: Instant) {
        let max_writable = self.max_writable_on_conn();
        if max_writable == 0 {
            return;
        }
        if let Some(cb) = self.conn_write_callback.take() {
            cb.connection_write_ready(self, max_writable);
        }
        if self.close_state != CloseState::Open {
            return;
        }
        let pending: Vec<_> = self.pending_write_callbacks.keys().copied().collect();
        for id in pending {
            if self.close_state != CloseState::Open {
                return;
            }
            self.maybe_fire_stream_write_ready(id, now);
        }
    }

    /// Step 11: announce newly openable streams after a limit increase
    fn invoke_streams_available_callbacks(&mut self, now: Instant) {
        let Some(cb) = self.connection_callback.clone() else {
            return;
        };
        if self.conn.streams.take_bidi_limit_increase() {
            let openable = self.conn.streams.openable_local_bidirectional_streams();
            if openable > 0 {
                cb.on_bidirectional_streams_available(self, openable);
            }
        }
        if self.close_state != CloseState::Open {
            return;
        }
        if self.conn.streams.take_uni_limit_increase() {
            let openable = self.conn.streams.openable_local_unidirectional_streams();
            if openable > 0 {
                cb.on_unidirectional_streams_available(self, openable);
            }
        }
        let _ = now;
    }

    /// Datagram arrival notification, once per empty-to-nonempty transition
    fn handle_datagram_callbacks(&mut self, now: Instant) {
        if !self.conn.datagram_state.new_datagrams {
            return;
        }
        self.conn.datagram_state.new_datagrams = false;
        if let Some(cb) = self.datagram_callback.clone() {
            cb.on_datagrams_available(self);
        }
        let _ = now;
    }

    /// Step 12: drop ack telemetry once nothing is outstanding
    fn cleanup_ack_event_state(&mut self) {
        if self.conn.outstandings.packets.is_empty() {
            self.conn.last_processed_ack_events = Vec::new();
        }
    }

    //
    // Read / peek looper bodies
    //

    /// The read looper's work function: deliver data and read errors
    pub(crate) fn invoke_read_data_and_callbacks(&mut self, now: Instant) {
        let mut readable: Vec<_> = self
            .conn
            .streams
            .readable_streams()
            .iter()
            .copied()
            .collect();
        // Container order unless the application asked for ascending ids
        if self.conn.transport_settings.ordered_read_callbacks {
            readable.sort_unstable();
        }
        for id in readable {
            if self.close_state != CloseState::Open {
                return;
            }
            let Some(stream) = self.conn.streams.get_stream(id) else {
                continue;
            };
            let group = stream.group_id;
            let read_error = stream.read_error.clone();
            let Some(entry) = self.read_callbacks.get(&id) else {
                continue;
            };
            let Some(cb) = entry.cb.clone() else {
                continue;
            };
            match read_error {
                Some(error) => {
                    // A stream in error leaves the readable and peekable sets
                    // for good
                    self.conn.streams.remove_readable(id);
                    self.conn.streams.remove_peekable(id);
                    match group {
                        Some(group) => cb.read_error_with_group(self, id, group, error),
                        None => cb.read_error(self, id, error),
                    }
                }
                None => {
                    if !entry.resumed {
                        continue;
                    }
                    match group {
                        Some(group) => cb.read_available_with_group(self, id, group),
                        None => cb.read_available(self, id),
                    }
                }
            }
        }
        let _ = now;
    }

    /// The peek looper's work function
    pub(crate) fn invoke_peek_data_and_callbacks(&mut self, now: Instant) {
        let peekable: Vec<_> = self
            .conn
            .streams
            .peekable_streams()
            .iter()
            .copied()
            .collect();
        for id in peekable {
            if self.close_state != CloseState::Open {
                return;
            }
            let Some(stream) = self.conn.streams.get_stream(id) else {
                continue;
            };
            let read_error = stream.read_error.clone();
            let Some(entry) = self.peek_callbacks.get(&id) else {
                continue;
            };
            let Some(cb) = entry.cb.clone() else {
                continue;
            };
            match read_error {
                Some(error) => {
                    self.conn.streams.remove_peekable(id);
                    cb.peek_error(self, id, error);
                }
                None => {
                    if !entry.resumed {
                        continue;
                    }
                    cb.peek_available(self, id);
                }
            }
        }
        let _ = now;
    }
}
