use std::ops::{Index, IndexMut};
use std::time::{Duration, Instant};

/// The three packet number spaces, each with its own ack state and loss
/// accounting
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PacketNumberSpace {
    Initial = 0,
    Handshake = 1,
    AppData = 2,
}

impl PacketNumberSpace {
    pub const VALUES: [Self; 3] = [Self::Initial, Self::Handshake, Self::AppData];
}

impl<T> Index<PacketNumberSpace> for [T; 3] {
    type Output = T;
    fn index(&self, space: PacketNumberSpace) -> &T {
        &self.as_ref()[space as usize]
    }
}

impl<T> IndexMut<PacketNumberSpace> for [T; 3] {
    fn index_mut(&mut self, space: PacketNumberSpace) -> &mut T {
        &mut self.as_mut()[space as usize]
    }
}

/// Receive-side acknowledgment state for one packet number space
#[derive(Debug, Clone, Default)]
pub struct AckState {
    /// Largest packet number received from the peer
    pub largest_recvd_packet_num: Option<u64>,
    /// Bumped every time a new packet is processed in this space; the
    /// transport compares versions across an ingress pass to detect progress
    pub version: u64,
    /// Packet number ranges pending acknowledgment
    pub acks: Vec<(u64, u64)>,
    /// Whether an ACK must be flushed on the ack timer
    pub needs_ack: bool,
    //
    // ECN feedback, meaningful for AppData only
    //
    pub ecn_ce_count_echoed: u64,
    pub ecn_ect0_count_echoed: u64,
    pub ecn_ect1_count_echoed: u64,
    /// Ack-eliciting packets we sent with a mark that the peer has echoed
    /// acknowledgments for
    pub minimum_expected_ecn_marks_echoed: u64,
}

impl AckState {
    /// Record that a new packet was processed
    pub fn on_packet_received(&mut self, packet_num: u64) {
        self.version += 1;
        match self.largest_recvd_packet_num {
            Some(largest) if largest >= packet_num => {}
            _ => self.largest_recvd_packet_num = Some(packet_num),
        }
        self.acks.push((packet_num, packet_num));
    }
}

/// Acknowledgment state for all three packet number spaces
#[derive(Debug, Clone, Default)]
pub struct AckStates {
    pub initial: AckState,
    pub handshake: AckState,
    pub app_data: AckState,
}

impl AckStates {
    /// Combined version counter; a change means some space saw a new packet
    pub fn current_version(&self) -> u64 {
        self.initial.version + self.handshake.version + self.app_data.version
    }

    pub fn get_mut(&mut self, space: PacketNumberSpace) -> &mut AckState {
        match space {
            PacketNumberSpace::Initial => &mut self.initial,
            PacketNumberSpace::Handshake => &mut self.handshake,
            PacketNumberSpace::AppData => &mut self.app_data,
        }
    }

    pub fn clear_acks(&mut self) {
        self.initial.acks.clear();
        self.handshake.acks.clear();
        self.app_data.acks.clear();
    }
}

/// A transmitted packet awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct OutstandingPacket {
    pub packet_num: u64,
    pub space: PacketNumberSpace,
    pub time_sent: Instant,
    pub encoded_size: u64,
    pub ack_eliciting: bool,
}

/// Sent-but-unacknowledged packet accounting across spaces
#[derive(Debug, Clone, Default)]
pub struct Outstandings {
    pub packets: Vec<OutstandingPacket>,
    pub packet_count: [u64; 3],
    pub ack_eliciting_count: [u64; 3],
}

impl Outstandings {
    pub fn num_outstanding(&self) -> u64 {
        self.packets.len() as u64
    }

    pub fn num_ack_eliciting(&self) -> u64 {
        self.ack_eliciting_count.iter().sum()
    }

    pub fn on_packet_sent(&mut self, packet: OutstandingPacket) {
        self.packet_count[packet.space] += 1;
        if packet.ack_eliciting {
            self.ack_eliciting_count[packet.space] += 1;
        }
        self.packets.push(packet);
    }

    /// Earliest send time among ack-eliciting packets, the input to the
    /// loss-detection alarm
    pub fn earliest_ack_eliciting_sent(&self) -> Option<Instant> {
        self.packets
            .iter()
            .filter(|p| p.ack_eliciting)
            .map(|p| p.time_sent)
            .min()
    }

    pub fn reset(&mut self) {
        self.packets.clear();
        self.packet_count = [0; 3];
        self.ack_eliciting_count = [0; 3];
    }
}

/// Acknowledgment batch handed to packet processors and observers
#[derive(Debug, Clone)]
pub struct AckEvent {
    pub ack_time: Instant,
    pub largest_acked_packet: u64,
    pub acked_bytes: u64,
    pub srtt: Duration,
    pub ecn_ce_count: u64,
}
