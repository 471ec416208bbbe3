use std::io;
use std::time::Instant;

use bytes::Bytes;
use rustc_hash::FxHashMap;

/// Explicit congestion notification codepoint carried in the low two bits of
/// the TOS byte
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum EcnCodepoint {
    NotEct = 0b00,
    /// ECT(1), used by L4S
    Ect1 = 0b01,
    /// ECT(0), used by classic ECN
    Ect0 = 0b10,
    /// Congestion experienced
    Ce = 0b11,
}

impl EcnCodepoint {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => Self::Ect1,
            0b10 => Self::Ect0,
            0b11 => Self::Ce,
            _ => Self::NotEct,
        }
    }
}

/// The socket TOS byte: DSCP in the upper six bits, ECN in the lower two
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SocketTos {
    pub dscp: u8,
    pub ecn: u8,
}

impl SocketTos {
    pub fn value(self) -> u8 {
        self.dscp << 2 | (self.ecn & 0b11)
    }
}

/// One UDP datagram handed to the transport by the socket layer
#[derive(Debug, Clone)]
pub struct ReceivedUdpPacket {
    pub data: Bytes,
    pub receive_time: Instant,
    pub tos: u8,
}

impl ReceivedUdpPacket {
    pub fn new(data: Bytes, receive_time: Instant) -> Self {
        Self {
            data,
            receive_time,
            tos: 0,
        }
    }

    pub fn ecn(&self) -> EcnCodepoint {
        EcnCodepoint::from_bits(self.tos)
    }
}

/// A batch of datagrams read from the socket in one receive pass
#[derive(Debug, Clone, Default)]
pub struct NetworkData {
    pub packets: Vec<ReceivedUdpPacket>,
}

impl NetworkData {
    pub fn single(packet: ReceivedUdpPacket) -> Self {
        Self {
            packets: vec![packet],
        }
    }

    /// Total payload bytes across the batch
    pub fn total_data(&self) -> u64 {
        self.packets.iter().map(|p| p.data.len() as u64).sum()
    }
}

/// Ancillary socket options keyed by (cmsg_level, cmsg_type)
pub type CmsgMap = FxHashMap<(i32, i32), u64>;

/// The UDP socket the transport exclusively owns
///
/// Packet serialization and the actual send path live in the codec; the
/// connection core uses this surface for lifecycle and QoS control only.
pub trait UdpSocket {
    /// Transmit one datagram to the connected peer
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Stop delivering received datagrams to the transport
    fn pause_read(&mut self);

    /// Close the socket and release its file descriptor
    fn close(&mut self);

    /// Push a new TOS byte (DSCP + ECN) to the socket
    fn set_tos(&mut self, tos: u8);

    /// Replace the ancillary data attached to future sends
    #[allow(unused_variables)]
    fn set_additional_cmsgs(&mut self, cmsgs: Option<CmsgMap>) {}

    /// Ask the socket layer to report the next writable transition
    fn request_writable_event(&mut self) {}

    /// Whether the socket can currently accept more data
    fn is_writable(&self) -> bool {
        true
    }
}
