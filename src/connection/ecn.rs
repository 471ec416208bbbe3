//! ECN validation: trust ECT0/ECT1/CE echoes only after the path proves it
//! preserves markings.

use std::cell::Cell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::callbacks::PacketProcessor;
use crate::connection::spaces::AckEvent;
use crate::connection::state::EcnState;
use crate::connection::QuicTransport;
use crate::ECN_MIN_MARKED_PACKETS;

/// Packet processor installed once L4S validation succeeds; tracks the CE
/// marking fraction the path reports so the congestion layer can react to it
pub struct EcnL4sTracker {
    acked_packets: Cell<u64>,
    ce_marked: Cell<u64>,
    last_ce_count: Cell<u64>,
}

impl EcnL4sTracker {
    pub(crate) fn new() -> Self {
        Self {
            acked_packets: Cell::new(0),
            ce_marked: Cell::new(0),
            last_ce_count: Cell::new(0),
        }
    }

    /// Fraction of acknowledged packets the path marked CE
    pub fn ce_fraction(&self) -> f64 {
        let acked = self.acked_packets.get();
        if acked == 0 {
            return 0.0;
        }
        self.ce_marked.get() as f64 / acked as f64
    }
}

impl PacketProcessor for EcnL4sTracker {
    fn on_packet_ack(&self, ack: &AckEvent) {
        self.acked_packets.set(self.acked_packets.get() + 1);
        let new_ce = ack.ecn_ce_count.saturating_sub(self.last_ce_count.get());
        self.last_ce_count.set(ack.ecn_ce_count);
        self.ce_marked.set(self.ce_marked.get() + new_ce);
    }
}

impl QuicTransport {
    /// Check ECN echoes against what we sent and disable marking on mismatch
    ///
    /// Runs after every ingress pass. Validation starts only once enough
    /// ack-eliciting app-data packets have been echoed.
    pub(crate) fn validate_ecn_state(&mut self) {
        match self.conn.ecn_state {
            EcnState::NotAttempted | EcnState::FailedValidation => return,
            _ => {}
        }
        let min_expected = self
            .conn
            .ack_states
            .app_data
            .minimum_expected_ecn_marks_echoed;
        if min_expected < ECN_MIN_MARKED_PACKETS {
            return;
        }
        let max_expected = self.conn.loss_state.total_packets_sent;
        let app_data = &self.conn.ack_states.app_data;

        match self.conn.ecn_state {
            EcnState::AttemptingEcn | EcnState::ValidatedEcn => {
                // Count ECT0 + CE marks; ECT1 must never be echoed
                let marked = app_data.ecn_ce_count_echoed + app_data.ecn_ect0_count_echoed;
                if marked >= min_expected
                    && marked <= max_expected
                    && app_data.ecn_ect1_count_echoed == 0
                {
                    if self.conn.ecn_state != EcnState::ValidatedEcn {
                        self.conn.ecn_state = EcnState::ValidatedEcn;
                        trace!(marked, min_expected, "ECN validation successful");
                    }
                } else {
                    self.conn.ecn_state = EcnState::FailedValidation;
                    debug!(marked, min_expected, "ECN validation failed");
                }
            }
            EcnState::AttemptingL4s | EcnState::ValidatedL4s => {
                // Count ECT1 + CE marks; ECT0 must never be echoed
                let marked = app_data.ecn_ce_count_echoed + app_data.ecn_ect1_count_echoed;
                if marked >= min_expected
                    && marked <= max_expected
                    && app_data.ecn_ect0_count_echoed == 0
                {
                    if self.conn.ecn_state != EcnState::ValidatedL4s {
                        if self.ecn_l4s_tracker.is_none() {
                            let tracker = Rc::new(EcnL4sTracker::new());
                            self.ecn_l4s_tracker = Some(tracker.clone());
                            self.packet_processors.push(tracker);
                        }
                        self.conn.ecn_state = EcnState::ValidatedL4s;
                        trace!(marked, min_expected, "L4S validation successful");
                    }
                } else {
                    self.conn.ecn_state = EcnState::FailedValidation;
                    debug!(marked, min_expected, "L4S validation failed");
                }
            }
            EcnState::NotAttempted | EcnState::FailedValidation => unreachable!(),
        }

        if self.conn.ecn_state == EcnState::FailedValidation {
            self.conn.socket_tos.ecn = 0;
            if let Some(socket) = self.socket.as_mut() {
                socket.set_tos(self.conn.socket_tos.value());
            }
            debug!("ECN validation failed, disabling ECN");
            if let Some(tracker) = self.ecn_l4s_tracker.take() {
                let tracker: Rc<dyn PacketProcessor> = tracker;
                self.packet_processors
                    .retain(|p| !Rc::ptr_eq(p, &tracker));
            }
        }
    }
}
