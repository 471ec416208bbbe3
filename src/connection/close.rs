//! Connection close lifecycle: graceful close, immediate close, drain, and
//! the teardown of every registered application callback.

use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::connection::state::CloseState;
use crate::connection::QuicTransport;
use crate::error::{ErrorCode, LocalErrorCode, QuicError, TransportErrorCode};
use crate::observer::CloseStartedEvent;
use crate::qlog::TransportSummary;
use crate::timer::Timer;
use crate::DRAIN_FACTOR;

impl QuicTransport {
    /// Close the connection, sending a close frame and draining
    pub fn close(&mut self, error: Option<QuicError>, now: Instant) {
        self.close_impl(error, true, true, now);
    }

    /// Close immediately: no drain period
    pub fn close_now(&mut self, error: Option<QuicError>, now: Instant) {
        debug!("close_now");
        self.close_impl(error, false, true, now);
        // The drain timeout may have been scheduled by a previous close, in
        // which case this close would not take effect. Expire it so the
        // socket still comes down.
        if self.timers.is_armed(Timer::Drain) {
            self.timers.stop(Timer::Drain);
            self.drain_timeout_expired();
        }
    }

    /// Stop accepting new work and close once all streams have drained
    pub fn close_gracefully(&mut self, now: Instant) {
        if self.close_state == CloseState::GracefulClosing
            || self.close_state == CloseState::Closed
        {
            return;
        }
        self.close_state = CloseState::GracefulClosing;
        if let Some(qlogger) = &self.qlogger {
            qlogger.add_transport_state_update("graceful close".to_string());
        }
        self.read_looper.stop();
        self.peek_looper.stop();
        self.cancel_all_app_callbacks(
            &QuicError::local_with(LocalErrorCode::NoError, "No error"),
            now,
        );
        if self.conn.streams.stream_count() == 0 {
            self.close_impl(None, true, true, now);
        }
    }

    /// The one close path everything funnels through
    ///
    /// Safe to invoke from any callback, including during another close: the
    /// Closed-state guard makes the second entry a no-op.
    pub(crate) fn close_impl(
        &mut self,
        error: Option<QuicError>,
        drain_connection: bool,
        send_close_immediately: bool,
        now: Instant,
    ) {
        if self.close_state == CloseState::Closed {
            return;
        }

        self.observers.for_each(|observer| {
            observer.close_started(&CloseStartedEvent {
                close_reason: error.clone(),
            })
        });

        let drain_connection = drain_connection && self.conn.transport_settings.should_drain;

        if let Some(qlogger) = &self.qlogger {
            let crypto = &self.conn.crypto_state;
            let total_crypto_data_written = crypto.initial_stream.current_write_offset
                + crypto.handshake_stream.current_write_offset
                + crypto.one_rtt_stream.current_write_offset;
            let total_crypto_data_recvd = crypto.initial_stream.max_offset_observed
                + crypto.handshake_stream.max_offset_observed
                + crypto.one_rtt_stream.max_offset_observed;
            qlogger.add_transport_summary(&TransportSummary {
                total_bytes_sent: self.conn.loss_state.total_bytes_sent,
                total_bytes_recvd: self.conn.loss_state.total_bytes_recvd,
                sum_cur_write_offset: self.conn.flow_control.sum_cur_write_offset,
                sum_max_observed_offset: self.conn.flow_control.sum_max_observed_offset,
                sum_cur_stream_buffer_len: self.conn.flow_control.sum_cur_stream_buffer_len,
                total_bytes_retransmitted: self.conn.loss_state.total_bytes_retransmitted,
                total_stream_bytes_cloned: self.conn.loss_state.total_stream_bytes_cloned,
                total_bytes_cloned: self.conn.loss_state.total_bytes_cloned,
                total_crypto_data_written,
                total_crypto_data_recvd,
                current_writable_bytes: self
                    .congestion
                    .as_ref()
                    .map_or(u64::MAX, |c| c.writable_bytes()),
                current_conn_flow_control: self.conn.flow_control.send_flow_control_bytes(),
                total_packets_spuriously_marked_lost: self
                    .conn
                    .loss_state
                    .total_packets_spuriously_marked_lost,
                used_zero_rtt: self.conn.used_zero_rtt,
                quic_version: self.conn.version.unwrap_or(0),
                dsr_packet_count: self.conn.dsr_packet_count,
            });
        }

        self.close_state = CloseState::Closed;
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.reset();
        }

        // cancel_code reaches the local app layer; error becomes
        // local_connection_error and goes in the close frame. The unsanitized
        // fault message may ride in cancel_code but never on the wire.
        let mut cancel_code = QuicError::local_with(LocalErrorCode::NoError, "no error");
        if let Some(peer_error) = &self.conn.peer_connection_error {
            cancel_code = peer_error.clone();
        } else if let Some(error) = &error {
            cancel_code = error.clone();
        }
        if let Some(what) = &self.exception_close_what {
            cancel_code.message = what.clone();
        }

        let local_code = cancel_code.code.as_local();
        let is_reset = local_code == Some(LocalErrorCode::ConnectionReset);
        let is_abandon = local_code == Some(LocalErrorCode::ConnectionAbandoned);
        let is_invalid_migration =
            cancel_code.code.as_transport() == Some(TransportErrorCode::INVALID_MIGRATION);
        if is_reset {
            trace!("closing transport due to stateless reset");
        }
        if is_abandon {
            trace!("closing transport due to abandoned connection");
        }

        if let Some(error) = &error {
            self.conn.local_connection_error = Some(error.clone());
            if let Some(qlogger) = &self.qlogger {
                qlogger.add_connection_close(
                    error.message.clone(),
                    error.message.clone(),
                    drain_connection,
                    send_close_immediately,
                );
            }
        } else if let Some(qlogger) = &self.qlogger {
            qlogger.add_connection_close(
                "No Error".to_string(),
                format!("Peer: isReset: {is_reset}, Peer: isAbandon: {is_abandon}"),
                drain_connection,
                send_close_immediately,
            );
        }

        self.timers.stop_all_except(&[Timer::Drain]);

        trace!("stopping loopers due to immediate close");
        self.read_looper.stop();
        self.peek_looper.stop();
        self.write_looper.stop();

        self.cancel_all_app_callbacks(&cancel_code, now);

        // The peer implicitly resets all streams when it sees the close
        self.conn.streams.clear_open_streams();
        self.conn.datagram_state.clear();
        self.conn.pending_events.reset();
        self.conn.streams.clear_actionable();
        self.conn.streams.clear_writable();
        self.conn.ack_states.clear_acks();

        if self.transport_ready_notified {
            self.process_connection_callbacks(cancel_code);
        } else {
            self.process_connection_setup_callbacks(cancel_code);
        }
        // No further connection callbacks may fire
        self.connection_callback = None;
        self.connection_setup_callback = None;

        self.conn.outstandings.reset();
        self.congestion = None;

        let send_close_immediately = send_close_immediately && !is_reset && !is_abandon;
        if send_close_immediately {
            self.conn.pending_close_error = Some(self.conn.local_connection_error.clone().unwrap_or_else(
                || QuicError::transport(TransportErrorCode::NO_ERROR, "No error"),
            ));
            self.write_close_packet(now);
        }

        let drain_connection =
            drain_connection && !is_reset && !is_abandon && !is_invalid_migration;
        if drain_connection {
            debug_assert!(!self.timers.is_armed(Timer::Drain));
            let drain = DRAIN_FACTOR * self.conn.pto();
            self.timers.set(Timer::Drain, now + drain);
        } else {
            self.drain_timeout_expired();
        }
    }

    /// Emit the final CONNECTION_CLOSE through the codec
    pub(crate) fn write_close_packet(&mut self, now: Instant) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        if let Err(fault) = self.codec.write_data(&mut self.conn, socket.as_mut(), now) {
            // This could happen if the writes fail
            error!(what = fault.what(), "close packet write threw");
        }
    }

    /// Drain lapsed: release the socket and unbind
    pub(crate) fn drain_timeout_expired(&mut self) {
        self.close_udp_socket();
        self.unbind_connection();
    }

    pub(crate) fn close_udp_socket(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        self.observers.for_each(|observer| observer.closing());
        socket.pause_read();
        socket.close();
    }

    fn unbind_connection(&mut self) {
        self.attached = false;
    }

    fn process_connection_setup_callbacks(&mut self, cancel_code: QuicError) {
        // connSetupCallback may be null if the app hasn't set it yet
        if let Some(cb) = self.connection_setup_callback.clone() {
            cb.on_connection_setup_error(self, cancel_code);
        }
    }

    fn process_connection_callbacks(&mut self, cancel_code: QuicError) {
        let Some(cb) = self.connection_callback.clone() else {
            return;
        };
        if self
            .conn
            .transport_settings
            .use_connection_end_with_error_callback
        {
            cb.on_connection_end_with_error(cancel_code);
        } else if is_no_error(&cancel_code) {
            cb.on_connection_end();
        } else {
            cb.on_connection_error(cancel_code);
        }
    }

    /// Error out every registered application callback with one classified
    /// error, in a fixed order
    pub(crate) fn cancel_all_app_callbacks(&mut self, error: &QuicError, now: Instant) {
        self.conn.streams.clear_actionable();
        self.cancel_all_byte_event_callbacks(now);

        let read_snapshot: Vec<_> = self.read_callbacks.keys().copied().collect();
        for id in read_snapshot {
            let Some(entry) = self.read_callbacks.remove(&id) else {
                continue;
            };
            if let Some(cb) = entry.cb {
                let group = self.conn.streams.get_stream(id).and_then(|s| s.group_id);
                match group {
                    Some(group) => cb.read_error_with_group(self, id, group, error.clone()),
                    None => cb.read_error(self, id, error.clone()),
                }
            }
        }

        trace!("clearing datagram callback");
        self.datagram_callback = None;
        trace!("clearing ping callback");
        self.ping_callback = None;

        let peek_snapshot: Vec<_> = self.peek_callbacks.keys().copied().collect();
        trace!(count = peek_snapshot.len(), "clearing peek callbacks");
        for id in peek_snapshot {
            let Some(entry) = self.peek_callbacks.remove(&id) else {
                continue;
            };
            if let Some(cb) = entry.cb {
                cb.peek_error(self, id, error.clone());
            }
        }

        if let Some(cb) = self.conn_write_callback.take() {
            cb.connection_write_error(self, error.clone());
        }
        let write_snapshot: Vec<_> = self.pending_write_callbacks.keys().copied().collect();
        for id in write_snapshot {
            let Some(cb) = self.pending_write_callbacks.remove(&id) else {
                continue;
            };
            cb.stream_write_error(self, id, error.clone());
        }

        self.check_for_closed_stream(now);
        self.update_read_looper();
        self.update_peek_looper();
        self.update_write_looper(true, false, now);
    }

    /// Reap streams the stream manager flagged closed, once nothing holds
    /// them open
    ///
    /// A stream survives reaping while it has an active read callback (unless
    /// EOM was already delivered and the EOM-unset knob allows it), an active
    /// peek callback, or pending byte events. Reaching zero streams while
    /// gracefully closing finishes the close.
    pub(crate) fn check_for_closed_stream(&mut self, now: Instant) {
        if self.close_state == CloseState::Closed {
            return;
        }
        let closed: Vec<_> = self.conn.streams.closed_streams().iter().copied().collect();
        for id in closed {
            let retain_for_read = match self.read_callbacks.get(&id) {
                Some(entry) if entry.cb.is_some() => {
                    self.conn
                        .transport_settings
                        .remove_stream_after_eom_callback_unset
                        || !entry.delivered_eom
                }
                _ => false,
            };
            if retain_for_read {
                trace!(stream = %id, "not closing stream with active read callback");
                continue;
            }
            let retain_for_peek = matches!(
                self.peek_callbacks.get(&id),
                Some(entry) if entry.cb.is_some()
            );
            if retain_for_peek {
                trace!(stream = %id, "not closing stream with active peek callback");
                continue;
            }
            let byte_events = self.get_num_byte_event_callbacks_for_stream(id);
            if byte_events > 0 {
                trace!(
                    stream = %id,
                    byte_events,
                    "not closing stream with pending byte events"
                );
                continue;
            }

            trace!(stream = %id, "closing stream");
            if let Some(qlogger) = &self.qlogger {
                qlogger.add_transport_state_update(format!("closing stream {}", id.0));
            }
            let initiator = self.stream_initiator(id);
            let directionality = self.stream_directionality(id);
            self.observers.for_each(|observer| {
                observer.stream_closed(&crate::observer::StreamCloseEvent {
                    stream_id: id,
                    initiator,
                    directionality,
                })
            });
            if let Some(cb) = self.connection_callback.clone() {
                cb.on_stream_pre_reaped(self, id);
            }
            let freed = self.conn.streams.remove_closed_stream(id);
            self.conn.flow_control.sum_cur_stream_buffer_len = self
                .conn
                .flow_control
                .sum_cur_stream_buffer_len
                .saturating_sub(freed);
            // Reaping a remote stream frees credit the peer should hear about
            if initiator == crate::streams::StreamInitiator::Remote
                && self.close_state == CloseState::Open
            {
                self.conn.pending_events.stream_limit_updates = true;
                self.update_write_looper(true, false, now);
            }
            self.read_callbacks.remove(&id);
            self.peek_callbacks.remove(&id);
        }

        if self.close_state == CloseState::GracefulClosing
            && self.conn.streams.stream_count() == 0
        {
            self.close_impl(None, true, true, now);
        }
    }

    /// Reset every non-control stream, used when backgrounding tears down
    /// low-priority work
    pub fn reset_non_control_streams(
        &mut self,
        error: crate::error::ApplicationErrorCode,
        now: Instant,
    ) {
        let ids: Vec<_> = self
            .conn
            .streams
            .stream_ids()
            .into_iter()
            .filter(|id| {
                self.conn
                    .streams
                    .get_stream(*id)
                    .map(|s| !s.is_control)
                    .unwrap_or(false)
            })
            .collect();
        for id in ids {
            if id.is_receiving_for(self.conn.side) {
                continue;
            }
            if let Err(code) = self.reset_stream(id, error, now) {
                warn!(stream = %id, code = ?code, "failed to reset non-control stream");
            }
        }
    }
}

fn is_no_error(error: &QuicError) -> bool {
    match error.code {
        ErrorCode::Local(code) => code == LocalErrorCode::NoError,
        ErrorCode::Transport(code) => code == TransportErrorCode::NO_ERROR,
        ErrorCode::Application(_) => false,
    }
}
