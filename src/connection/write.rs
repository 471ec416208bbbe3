//! The egress pipeline: pacing, the socket write pass, app-limited
//! detection, and TX byte-event follow-ups.

use std::time::Instant;

use tracing::debug;

use crate::callbacks::{ByteEvent, ByteEventKind};
use crate::connection::state::CloseState;
use crate::connection::QuicTransport;
use crate::error::{TransportErrorCode, TransportFault};
use crate::looper::NoWriteReason;
use crate::observer::{AppLimitedEvent, PacketsWrittenEvent};
use crate::socket::CmsgMap;
use crate::timer::Timer;

impl QuicTransport {
    /// The write looper's work function: one unpaced pass, or one pacing
    /// burst
    pub(crate) fn paced_write_data_to_socket(&mut self, now: Instant) {
        if !self.is_connection_paced() {
            // Not paced: normal write. Even if pacing was enabled earlier and
            // then disabled, flush the residue from pacing writes.
            self.write_socket_data_and_catch(now);
            if self.conn.transport_settings.schedule_timer_for_excess_writes
                && self.close_state != CloseState::Closed
                && self.has_data_to_write()
            {
                // Yield to the loop between passes
                self.timers.set(Timer::ExcessWrite, now);
            }
            self.check_idle_timer(now);
            return;
        }

        if self.write_looper.is_pacing_scheduled() {
            // The next burst is already scheduled; burst size doesn't depend
            // on how much data is buffered, so nothing to update
            self.check_idle_timer(now);
            return;
        }

        // Burst now, then wait out the interval the pacer asks for
        self.write_socket_data_and_catch(now);
        self.check_idle_timer(now);
    }

    /// Run a write pass and route any collaborator fault into the close path
    pub(crate) fn write_socket_data_and_catch(&mut self, now: Instant) {
        if let Err(fault) = self.write_socket_data(now) {
            debug!(what = fault.what(), "write error");
            self.exception_close_what = Some(fault.what().to_string());
            let error = fault.to_close_error("writeSocketData() error");
            self.close_impl(Some(error), true, true, now);
            return;
        }
        self.process_callbacks_after_write_data(now);
    }

    /// One pass of the write pipeline
    pub(crate) fn write_socket_data(&mut self, now: Instant) -> Result<(), TransportFault> {
        if self.socket.is_some() {
            // Incremented on each write or write attempt
            self.conn.write_count += 1;

            let before_bytes_sent = self.conn.loss_state.total_bytes_sent;
            let before_packets_sent = self.conn.loss_state.total_packets_sent;
            let before_ack_eliciting = self.conn.loss_state.total_ack_eliciting_packets_sent;
            let before_outstanding = self.conn.outstandings.num_outstanding();

            self.update_packet_processors_prewrite_requests();

            // Leaving the app-limited state is observable
            if self.conn.app_limited_tracker.is_app_limited() && self.congestion.is_some() {
                self.conn.app_limited_tracker.set_not_app_limited();
                self.notify_start_writing_from_app_rate_limited();
            }

            {
                let socket = self.socket.as_mut().expect("checked above");
                self.codec.write_data(&mut self.conn, socket.as_mut(), now)?;
            }

            if self.close_state != CloseState::Closed {
                if self.conn.pending_events.close_transport {
                    return Err(TransportFault::Protocol {
                        code: TransportErrorCode::PROTOCOL_VIOLATION,
                        what: "Max packet number reached".to_string(),
                    });
                }
                self.set_loss_detection_alarm(now);

                let after_bytes_sent = self.conn.loss_state.total_bytes_sent;
                let after_packets_sent = self.conn.loss_state.total_packets_sent;
                let after_ack_eliciting = self.conn.loss_state.total_ack_eliciting_packets_sent;
                let after_outstanding = self.conn.outstandings.num_outstanding();
                debug_assert!(before_packets_sent <= after_packets_sent);
                debug_assert!(before_ack_eliciting <= after_ack_eliciting);
                debug_assert!(before_outstanding <= after_outstanding);
                debug_assert_eq!(
                    after_outstanding - before_outstanding,
                    after_ack_eliciting - before_ack_eliciting
                );
                let new_packets = after_packets_sent > before_packets_sent;
                let new_outstanding_packets = after_ack_eliciting > before_ack_eliciting;

                if new_packets {
                    self.notify_packets_written(PacketsWrittenEvent {
                        num_packets_written: after_packets_sent - before_packets_sent,
                        num_ack_eliciting_packets_written: after_ack_eliciting
                            - before_ack_eliciting,
                        num_bytes_written: after_bytes_sent - before_bytes_sent,
                    });
                    // Keep the pacer fed with what this pass cost
                    if let (Some(congestion), Some(pacer)) =
                        (self.congestion.as_ref(), self.pacer.as_mut())
                    {
                        pacer.refresh_pacing_rate(
                            congestion.window(),
                            self.conn.loss_state.srtt,
                            now,
                        );
                        if let Some(throttle) = self
                            .throttling_signal_provider
                            .as_ref()
                            .and_then(|p| p.current_throttle_rate())
                        {
                            pacer.set_max_pacing_rate(throttle);
                        }
                        pacer.on_transmit(after_bytes_sent - before_bytes_sent, now);
                    }
                }

                if new_outstanding_packets {
                    self.write_empty_loop_count = 0;
                } else if self.needs_write_loop_detect {
                    if let Some(detector) = self.loop_detector.clone() {
                        self.write_empty_loop_count += 1;
                        detector.on_suspicious_write_loops(
                            self.write_empty_loop_count,
                            NoWriteReason::EmptyScheduler,
                        );
                    }
                }

                // First packet after quiescence, or first write since a new
                // packet arrived: the peer knows we are alive again
                if new_outstanding_packets
                    && (before_outstanding == 0 || self.conn.received_new_packet_before_write)
                {
                    self.set_idle_timer(now);
                    self.conn.received_new_packet_before_write = false;
                }

                // App-limited once this round drained everything we had
                let buffered = self.conn.flow_control.sum_cur_stream_buffer_len;
                let loss_buffers_empty =
                    !self.conn.streams.has_loss() && self.conn.crypto_state.loss_buffers_empty();
                let writable = self.congestion.as_ref().map_or(0, |c| c.writable_bytes());
                if self.congestion.is_some()
                    && buffered < self.conn.transport_settings.udp_send_packet_len
                    && loss_buffers_empty
                    && writable > 0
                {
                    if let Some(congestion) = self.congestion.as_mut() {
                        congestion.set_app_limited();
                    }
                    if self.transport_ready_notified {
                        if let Some(cb) = self.connection_callback.clone() {
                            cb.on_app_rate_limited();
                        }
                    }
                    self.conn.app_limited_tracker.set_app_limited();
                    self.notify_app_rate_limited();
                }
            }
        }
        // A write can flush an ACK and cancel the ack timer; both timers need
        // explicit rearming either way
        self.schedule_ack_timeout(now);
        self.schedule_path_validation_timeout(now);
        self.update_write_looper(false, false, now);
        self.maybe_stop_write_looper_and_arm_socket_writable_event(now);
        Ok(())
    }

    /// TX byte events fire once the write pass put their offsets on the wire
    pub(crate) fn process_callbacks_after_write_data(&mut self, now: Instant) {
        if self.close_state != CloseState::Open {
            return;
        }
        while let Some(id) = self.conn.streams.pop_tx() {
            let Some(largest) = self
                .conn
                .streams
                .get_stream(id)
                .and_then(|s| s.largest_write_offset_txed)
            else {
                continue;
            };
            loop {
                if self.close_state != CloseState::Open {
                    return;
                }
                let Some(queue) = self.tx_callbacks.get_mut(&id) else {
                    break;
                };
                let deliver = matches!(queue.first(), Some(detail) if detail.offset <= largest);
                if !deliver {
                    if queue.is_empty() {
                        self.tx_callbacks.remove(&id);
                    }
                    break;
                }
                let detail = queue.remove(0);
                if queue.is_empty() {
                    self.tx_callbacks.remove(&id);
                }
                let srtt = self.conn.loss_state.srtt;
                detail.cb.on_byte_event(
                    self,
                    ByteEvent {
                        id,
                        offset: detail.offset,
                        kind: ByteEventKind::Tx,
                        srtt,
                    },
                );
            }
        }
        let _ = now;
    }

    /// While the socket is unwritable, stop burning loop turns and wait for
    /// its writable event instead
    fn maybe_stop_write_looper_and_arm_socket_writable_event(&mut self, _now: Instant) {
        if !self.conn.transport_settings.use_sock_writable_events {
            return;
        }
        if !self.conn.write_blocked_on_socket || !self.write_looper.is_running() {
            return;
        }
        if let Some(socket) = self.socket.as_mut() {
            socket.request_writable_event();
            self.write_looper.stop();
        }
    }

    /// The socket can take data again
    pub fn on_socket_writable(&mut self, now: Instant) {
        self.conn.write_blocked_on_socket = false;
        self.update_write_looper(true, false, now);
    }

    /// Collect ancillary data requests from packet processors for the next
    /// send batch
    fn update_packet_processors_prewrite_requests(&mut self) {
        if self.packet_processors.is_empty() {
            return;
        }
        let mut merged: Option<CmsgMap> = None;
        for processor in &self.packet_processors {
            if let Some(cmsgs) = processor.prewrite_request() {
                merged.get_or_insert_with(CmsgMap::default).extend(cmsgs);
            }
        }
        if let Some(socket) = self.socket.as_mut() {
            socket.set_additional_cmsgs(merged);
        }
    }

    fn notify_packets_written(&mut self, event: PacketsWrittenEvent) {
        self.observers
            .for_each(|observer| observer.packets_written(&event));
    }

    fn notify_start_writing_from_app_rate_limited(&mut self) {
        let event = AppLimitedEvent {
            writable_bytes: self.congestion.as_ref().map_or(0, |c| c.writable_bytes()),
        };
        self.observers
            .for_each(|observer| observer.start_writing_from_app_limited(&event));
    }

    fn notify_app_rate_limited(&mut self) {
        let event = AppLimitedEvent {
            writable_bytes: self.congestion.as_ref().map_or(0, |c| c.writable_bytes()),
        };
        self.observers
            .for_each(|observer| observer.app_rate_limited(&event));
    }

    //
    // Datagram API
    //

    /// Largest datagram payload the connection currently accepts
    pub fn get_datagram_size_limit(&self) -> u64 {
        self.conn
            .datagram_state
            .size_limit(self.conn.transport_settings.udp_send_packet_len)
    }

    /// Queue an unreliable datagram for transmission
    pub fn write_datagram(
        &mut self,
        data: bytes::Bytes,
        now: Instant,
    ) -> Result<(), crate::error::LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(crate::error::LocalErrorCode::ConnectionClosed);
        }
        if data.len() as u64 > self.get_datagram_size_limit() {
            return Err(crate::error::LocalErrorCode::InvalidWriteData);
        }
        self.conn.datagram_state.enqueue_write(data);
        self.update_write_looper(true, false, now);
        Ok(())
    }

    /// Receive buffered datagrams, coalesced into owned buffers
    pub fn read_datagrams(
        &mut self,
        at_most: usize,
    ) -> Result<Vec<bytes::Bytes>, crate::error::LocalErrorCode> {
        if self.close_state != CloseState::Open {
            return Err(crate::error::LocalErrorCode::ConnectionClosed);
        }
        Ok(self.conn.datagram_state.read(at_most))
    }

    /// Receive buffered datagrams without copying
    pub fn read_datagram_bufs(
        &mut self,
        at_most: usize,
    ) -> Result<Vec<bytes::Bytes>, crate::error::LocalErrorCode> {
        self.read_datagrams(at_most)
    }
}
