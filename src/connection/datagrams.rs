use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use crate::config::TransportSettings;

/// Frame overhead reserved when computing the datagram payload limit: type
/// byte plus worst-case length varint
const DATAGRAM_FRAME_OVERHEAD: u64 = 1 + 8;

/// Buffers for unreliable datagrams in both directions
///
/// Both buffers are bounded; once full, the oldest entry is dropped to make
/// room, since late datagrams lose value quickly.
#[derive(Debug, Default)]
pub struct DatagramState {
    pub(crate) read_buffer: VecDeque<Bytes>,
    read_buffer_bytes: usize,
    pub(crate) write_buffer: VecDeque<Bytes>,
    write_buffer_bytes: usize,
    max_read_buffer_size: usize,
    max_write_buffer_size: usize,
    pub(crate) max_read_frame_size: u64,
    pub(crate) max_write_frame_size: u64,
    /// Reception made the read buffer non-empty since the last dispatch
    pub(crate) new_datagrams: bool,
}

impl DatagramState {
    pub fn new(settings: &TransportSettings) -> Self {
        Self {
            read_buffer: VecDeque::new(),
            read_buffer_bytes: 0,
            write_buffer: VecDeque::new(),
            write_buffer_bytes: 0,
            max_read_buffer_size: settings.max_datagram_read_buffer_size,
            max_write_buffer_size: settings.max_datagram_write_buffer_size,
            max_read_frame_size: settings.max_datagram_read_frame_size,
            max_write_frame_size: settings.max_datagram_write_frame_size,
            new_datagrams: false,
        }
    }

    /// Datagram payload limit given the path's packet size
    pub fn size_limit(&self, udp_send_packet_len: u64) -> u64 {
        self.max_write_frame_size
            .min(udp_send_packet_len)
            .saturating_sub(DATAGRAM_FRAME_OVERHEAD)
    }

    /// Buffer a datagram received from the peer
    pub fn on_datagram_received(&mut self, data: Bytes) {
        let was_empty = self.read_buffer.is_empty();
        while !self.read_buffer.is_empty()
            && self.read_buffer_bytes + data.len() > self.max_read_buffer_size
        {
            let dropped = self.read_buffer.pop_front().unwrap();
            self.read_buffer_bytes -= dropped.len();
            trace!(len = dropped.len(), "dropping stale received datagram");
        }
        self.read_buffer_bytes += data.len();
        self.read_buffer.push_back(data);
        if was_empty {
            self.new_datagrams = true;
        }
    }

    /// Queue a datagram for transmission
    pub fn enqueue_write(&mut self, data: Bytes) {
        while !self.write_buffer.is_empty()
            && self.write_buffer_bytes + data.len() > self.max_write_buffer_size
        {
            let dropped = self.write_buffer.pop_front().unwrap();
            self.write_buffer_bytes -= dropped.len();
            trace!(len = dropped.len(), "dropping oldest outgoing datagram");
        }
        self.write_buffer_bytes += data.len();
        self.write_buffer.push_back(data);
    }

    /// Hand the next outgoing datagram to the codec
    pub fn dequeue_write(&mut self) -> Option<Bytes> {
        let data = self.write_buffer.pop_front()?;
        self.write_buffer_bytes -= data.len();
        Some(data)
    }

    pub(crate) fn read(&mut self, at_most: usize) -> Vec<Bytes> {
        let take = if at_most == 0 {
            self.read_buffer.len()
        } else {
            at_most.min(self.read_buffer.len())
        };
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            let data = self.read_buffer.pop_front().unwrap();
            self.read_buffer_bytes -= data.len();
            out.push(data);
        }
        out
    }

    pub(crate) fn has_write_data(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.read_buffer.clear();
        self.read_buffer_bytes = 0;
        self.write_buffer.clear();
        self.write_buffer_bytes = 0;
        self.new_datagrams = false;
    }
}
