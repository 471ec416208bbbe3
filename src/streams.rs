use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::config::TransportSettings;
use crate::error::{ApplicationErrorCode, LocalErrorCode, QuicError};
use crate::{Dir, Side, StreamGroupId, StreamId};

/// Which endpoint opened a stream
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamInitiator {
    Local,
    Remote,
}

/// Directionality of a stream as seen by the observer surface
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamDirectionality {
    Bidirectional,
    Unidirectional,
}

/// Send-side stream state machine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamSendState {
    Open,
    ResetSent,
    Closed,
    /// Receive-only stream; there is no send side
    Invalid,
}

/// Receive-side stream state machine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamRecvState {
    Open,
    Closed,
    /// Send-only stream; there is no receive side
    Invalid,
}

/// Stream priority: 8 levels, lower is more urgent; incremental streams
/// round-robin within a level
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StreamPriority {
    pub level: u8,
    pub incremental: bool,
}

/// Per-group override of how stream data is retransmitted
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct StreamGroupRetransmissionPolicy {
    /// Lost stream frames in this group are not retransmitted
    pub disable_retransmission: bool,
}

impl Default for StreamPriority {
    fn default() -> Self {
        Self {
            level: 3,
            incremental: false,
        }
    }
}

/// Per-stream flow control bookkeeping
#[derive(Debug, Copy, Clone, Default)]
pub struct StreamFlowControlState {
    /// Window we grant the peer on updates
    pub window_size: u64,
    /// Largest offset the peer allows us to send up to
    pub peer_advertised_max_offset: u64,
    /// Largest offset we have allowed the peer to send up to
    pub advertised_max_offset: u64,
}

/// Retransmittable bytes buffered for a stream's send side
#[derive(Debug, Default)]
struct WriteBuffer {
    start_offset: u64,
    chunks: VecDeque<Bytes>,
    len: u64,
}

impl WriteBuffer {
    fn append(&mut self, data: Bytes) {
        self.len += data.len() as u64;
        if !data.is_empty() {
            self.chunks.push_back(data);
        }
    }

    fn end_offset(&self) -> u64 {
        self.start_offset + self.len
    }

    /// Drop bytes below `offset`, returning how many were freed
    fn trim_to(&mut self, offset: u64) -> u64 {
        let mut freed = 0;
        while self.start_offset < offset {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let drop = ((offset - self.start_offset) as usize).min(front.len());
            let _ = front.split_to(drop);
            self.start_offset += drop as u64;
            self.len -= drop as u64;
            freed += drop as u64;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        freed
    }

    fn clear(&mut self) -> u64 {
        let freed = self.len;
        self.start_offset = self.end_offset();
        self.chunks.clear();
        self.len = 0;
        freed
    }
}

/// Head-of-line blocking telemetry for a receive stream
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct HolbStats {
    pub(crate) total_time: Duration,
    pub(crate) count: u32,
    pub(crate) blocked: bool,
}

/// Mutable state of a single stream
pub struct StreamState {
    pub id: StreamId,
    pub group_id: Option<StreamGroupId>,
    pub(crate) send_state: StreamSendState,
    pub(crate) recv_state: StreamRecvState,
    /// Next offset the application will read
    pub(crate) current_read_offset: u64,
    /// Next offset the codec will put on the wire
    pub(crate) current_write_offset: u64,
    /// Contiguous bytes ready for the application
    read_buffer: VecDeque<Bytes>,
    read_buffer_len: u64,
    /// Where the peer's FIN sits, once known
    pub(crate) final_read_offset: Option<u64>,
    write_buffer: WriteBuffer,
    /// Offset one past the last byte the application will ever write
    pub(crate) final_write_offset: Option<u64>,
    /// Largest offset handed to the socket at least once
    pub(crate) largest_write_offset_txed: Option<u64>,
    /// Largest offset fully acknowledged by the peer
    pub(crate) largest_deliverable_offset: Option<u64>,
    pub(crate) flow_control: StreamFlowControlState,
    pub(crate) priority: StreamPriority,
    pub(crate) is_control: bool,
    pub(crate) read_error: Option<QuicError>,
    pub(crate) write_error: Option<QuicError>,
    pub(crate) holb: HolbStats,
    pub(crate) num_packets_tx_with_new_data: u64,
    pub(crate) loss_count: u64,
}

impl StreamState {
    fn new(id: StreamId, side: Side, settings: &TransportSettings) -> Self {
        let window = settings.stream_flow_control_window;
        let (send_state, recv_state) = match (id.dir(), id.initiator() == side) {
            (Dir::Bi, _) => (StreamSendState::Open, StreamRecvState::Open),
            (Dir::Uni, true) => (StreamSendState::Open, StreamRecvState::Invalid),
            (Dir::Uni, false) => (StreamSendState::Invalid, StreamRecvState::Open),
        };
        Self {
            id,
            group_id: None,
            send_state,
            recv_state,
            current_read_offset: 0,
            current_write_offset: 0,
            read_buffer: VecDeque::new(),
            read_buffer_len: 0,
            final_read_offset: None,
            write_buffer: WriteBuffer::default(),
            final_write_offset: None,
            largest_write_offset_txed: None,
            largest_deliverable_offset: None,
            flow_control: StreamFlowControlState {
                window_size: window,
                peer_advertised_max_offset: window,
                advertised_max_offset: window,
            },
            priority: StreamPriority::default(),
            is_control: false,
            read_error: None,
            write_error: None,
            holb: HolbStats::default(),
            num_packets_tx_with_new_data: 0,
            loss_count: 0,
        }
    }

    pub fn send_state(&self) -> StreamSendState {
        self.send_state
    }

    pub fn recv_state(&self) -> StreamRecvState {
        self.recv_state
    }

    /// Why the receive side can no longer deliver data, if it cannot
    pub fn stream_read_error(&self) -> Option<&QuicError> {
        self.read_error.as_ref()
    }

    /// Why the send side can no longer accept data, if it cannot
    pub fn stream_write_error(&self) -> Option<&QuicError> {
        self.write_error.as_ref()
    }

    /// Whether the application may still enqueue data
    pub fn writable(&self) -> bool {
        self.send_state == StreamSendState::Open && self.final_write_offset.is_none()
    }

    /// Whether data or a pending EOF is ready for the application
    pub fn readable(&self) -> bool {
        self.read_buffer_len > 0
            || (self.final_read_offset == Some(self.current_read_offset)
                && self.recv_state == StreamRecvState::Open)
    }

    /// Largest send offset the application has produced so far
    pub fn largest_write_offset_seen(&self) -> u64 {
        self.final_write_offset
            .unwrap_or_else(|| self.write_buffer.end_offset())
    }

    /// Bytes currently buffered for (re)transmission
    pub fn write_buffered_bytes(&self) -> u64 {
        self.write_buffer.len
    }

    /// Bytes the peer's stream window still permits
    pub fn send_flow_control_bytes(&self) -> u64 {
        self.flow_control
            .peer_advertised_max_offset
            .saturating_sub(self.largest_write_offset_seen())
    }

    /// Whether both sides of the stream have reached a terminal state
    fn all_terminal(&self) -> bool {
        let send_done = matches!(
            self.send_state,
            StreamSendState::Closed | StreamSendState::ResetSent | StreamSendState::Invalid
        );
        let recv_done = matches!(
            self.recv_state,
            StreamRecvState::Closed | StreamRecvState::Invalid
        );
        send_done && recv_done
    }

    /// Append received, in-order application data
    pub fn push_read_data(&mut self, data: Bytes, eof: bool) {
        let end = self.current_read_offset + self.read_buffer_len + data.len() as u64;
        self.read_buffer_len += data.len() as u64;
        if !data.is_empty() {
            self.read_buffer.push_back(data);
        }
        if eof {
            self.final_read_offset = Some(end);
        }
    }

    /// Drain up to `max_len` bytes; the flag reports whether EOF was reached
    pub(crate) fn read(&mut self, max_len: u64) -> (Vec<Bytes>, bool) {
        let mut out = Vec::new();
        let mut remaining = max_len;
        while remaining > 0 {
            let Some(front) = self.read_buffer.front_mut() else {
                break;
            };
            if (front.len() as u64) <= remaining {
                remaining -= front.len() as u64;
                self.current_read_offset += front.len() as u64;
                self.read_buffer_len -= front.len() as u64;
                out.push(self.read_buffer.pop_front().unwrap());
            } else {
                let taken = front.split_to(remaining as usize);
                self.current_read_offset += taken.len() as u64;
                self.read_buffer_len -= taken.len() as u64;
                out.push(taken);
                remaining = 0;
            }
        }
        let eof = self.final_read_offset == Some(self.current_read_offset);
        if eof {
            self.recv_state = StreamRecvState::Closed;
        }
        (out, eof)
    }

    /// Contiguous readable range without consuming it
    pub(crate) fn peek_range(&self) -> (u64, Vec<Bytes>) {
        (
            self.current_read_offset,
            self.read_buffer.iter().cloned().collect(),
        )
    }

    /// Advance the read cursor without surfacing the bytes
    pub(crate) fn consume(&mut self, amount: u64) {
        let (_, _) = self.read(amount);
    }

    pub(crate) fn clear_read_buffer(&mut self) {
        self.current_read_offset += self.read_buffer_len;
        self.read_buffer.clear();
        self.read_buffer_len = 0;
    }

    /// Drop retransmit storage below `offset`, returning freed bytes
    pub(crate) fn trim_write_buffer_to(&mut self, offset: u64) -> u64 {
        self.write_buffer.trim_to(offset)
    }
}

/// Owns per-stream state and the actionable-stream sets the dispatcher
/// consumes
pub struct StreamManager {
    side: Side,
    streams: FxHashMap<StreamId, StreamState>,
    readable: FxHashSet<StreamId>,
    peekable: FxHashSet<StreamId>,
    writable: BTreeSet<StreamId>,
    /// Streams whose lifecycle ended, awaiting reaping by the transport
    closed: BTreeSet<StreamId>,
    deliverable: BTreeSet<StreamId>,
    tx: BTreeSet<StreamId>,
    flow_control_updated: BTreeSet<StreamId>,
    stop_sending: Vec<(StreamId, ApplicationErrorCode)>,
    /// Streams reset by the peer whose byte events must be cancelled
    pending_reset_callbacks: Vec<StreamId>,
    new_peer_streams: Vec<StreamId>,
    new_peer_stream_groups: Vec<(StreamGroupId, Dir)>,
    loss_streams: BTreeSet<StreamId>,
    next_bidi_index: u64,
    next_uni_index: u64,
    next_bidi_group_index: u64,
    next_uni_group_index: u64,
    groups: BTreeSet<StreamGroupId>,
    /// Peer-advertised limits on locally initiated streams
    max_local_bidi: u64,
    max_local_uni: u64,
    /// Set when the peer raised a limit, cleared once reported
    bidi_limit_increased: bool,
    uni_limit_increased: bool,
    max_groups: u64,
    settings: TransportSettings,
}

impl StreamManager {
    pub fn new(side: Side, settings: &TransportSettings) -> Self {
        Self {
            side,
            streams: FxHashMap::default(),
            readable: FxHashSet::default(),
            peekable: FxHashSet::default(),
            writable: BTreeSet::new(),
            closed: BTreeSet::new(),
            deliverable: BTreeSet::new(),
            tx: BTreeSet::new(),
            flow_control_updated: BTreeSet::new(),
            stop_sending: Vec::new(),
            pending_reset_callbacks: Vec::new(),
            new_peer_streams: Vec::new(),
            new_peer_stream_groups: Vec::new(),
            loss_streams: BTreeSet::new(),
            next_bidi_index: 0,
            next_uni_index: 0,
            next_bidi_group_index: 0,
            next_uni_group_index: 0,
            groups: BTreeSet::new(),
            max_local_bidi: settings.max_local_bidirectional_streams,
            max_local_uni: settings.max_local_unidirectional_streams,
            bidi_limit_increased: false,
            uni_limit_increased: false,
            max_groups: settings.advertised_max_stream_groups,
            settings: settings.clone(),
        }
    }

    pub fn stream_exists(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn get_stream(&self, id: StreamId) -> Option<&StreamState> {
        self.streams.get(&id)
    }

    pub fn get_stream_mut(&mut self, id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn num_control_streams(&self) -> u64 {
        self.streams.values().filter(|s| s.is_control).count() as u64
    }

    //
    // Local stream creation
    //

    pub fn create_next_bidirectional_stream(
        &mut self,
        group: Option<StreamGroupId>,
    ) -> Result<StreamId, LocalErrorCode> {
        self.check_group(group)?;
        if self.openable_local_bidirectional_streams() == 0 {
            return Err(LocalErrorCode::InvalidOperation);
        }
        let id = StreamId::new(self.side, Dir::Bi, self.next_bidi_index);
        self.next_bidi_index += 1;
        Ok(self.insert_local(id, group))
    }

    pub fn create_next_unidirectional_stream(
        &mut self,
        group: Option<StreamGroupId>,
    ) -> Result<StreamId, LocalErrorCode> {
        self.check_group(group)?;
        if self.openable_local_unidirectional_streams() == 0 {
            return Err(LocalErrorCode::InvalidOperation);
        }
        let id = StreamId::new(self.side, Dir::Uni, self.next_uni_index);
        self.next_uni_index += 1;
        Ok(self.insert_local(id, group))
    }

    fn check_group(&self, group: Option<StreamGroupId>) -> Result<(), LocalErrorCode> {
        match group {
            Some(group) if !self.groups.contains(&group) => Err(LocalErrorCode::InvalidOperation),
            _ => Ok(()),
        }
    }

    fn insert_local(&mut self, id: StreamId, group: Option<StreamGroupId>) -> StreamId {
        let mut stream = StreamState::new(id, self.side, &self.settings);
        stream.group_id = group;
        self.streams.insert(id, stream);
        trace!(stream = %id, "opened local stream");
        id
    }

    pub fn create_stream_group(&mut self, dir: Dir) -> Result<StreamGroupId, LocalErrorCode> {
        if self.max_groups == 0 || self.groups.len() as u64 >= self.max_groups {
            return Err(LocalErrorCode::InvalidOperation);
        }
        let index = match dir {
            Dir::Bi => {
                let i = self.next_bidi_group_index;
                self.next_bidi_group_index += 1;
                i << 1
            }
            Dir::Uni => {
                let i = self.next_uni_group_index;
                self.next_uni_group_index += 1;
                i << 1 | 1
            }
        };
        let group = StreamGroupId(index);
        self.groups.insert(group);
        Ok(group)
    }

    /// Install a stream opened by the peer; the dispatcher will announce it
    pub fn create_peer_stream(
        &mut self,
        id: StreamId,
        group: Option<StreamGroupId>,
    ) -> Result<&mut StreamState, LocalErrorCode> {
        if id.initiator() == self.side {
            return Err(LocalErrorCode::InvalidOperation);
        }
        if let Some(group) = group {
            if !self.groups.contains(&group) {
                self.new_peer_stream_groups.push((group, id.dir()));
                self.groups.insert(group);
            }
        }
        let mut stream = StreamState::new(id, self.side, &self.settings);
        stream.group_id = group;
        self.streams.insert(id, stream);
        self.new_peer_streams.push(id);
        Ok(self.streams.get_mut(&id).unwrap())
    }

    pub fn openable_local_bidirectional_streams(&self) -> u64 {
        self.max_local_bidi.saturating_sub(self.next_bidi_index)
    }

    pub fn openable_local_unidirectional_streams(&self) -> u64 {
        self.max_local_uni.saturating_sub(self.next_uni_index)
    }

    /// Record a MAX_STREAMS increase from the peer
    pub fn set_max_local_bidirectional_streams(&mut self, max: u64) {
        if max > self.max_local_bidi {
            self.max_local_bidi = max;
            self.bidi_limit_increased = true;
        }
    }

    pub fn set_max_local_unidirectional_streams(&mut self, max: u64) {
        if max > self.max_local_uni {
            self.max_local_uni = max;
            self.uni_limit_increased = true;
        }
    }

    pub(crate) fn take_bidi_limit_increase(&mut self) -> bool {
        std::mem::take(&mut self.bidi_limit_increased)
    }

    pub(crate) fn take_uni_limit_increase(&mut self) -> bool {
        std::mem::take(&mut self.uni_limit_increased)
    }

    //
    // Actionable sets
    //

    pub fn add_readable(&mut self, id: StreamId) {
        self.readable.insert(id);
        self.peekable.insert(id);
    }

    pub fn remove_readable(&mut self, id: StreamId) {
        self.readable.remove(&id);
    }

    pub fn add_peekable(&mut self, id: StreamId) {
        self.peekable.insert(id);
    }

    pub fn remove_peekable(&mut self, id: StreamId) {
        self.peekable.remove(&id);
    }

    pub fn readable_streams(&self) -> &FxHashSet<StreamId> {
        &self.readable
    }

    pub fn peekable_streams(&self) -> &FxHashSet<StreamId> {
        &self.peekable
    }

    pub fn add_writable(&mut self, id: StreamId) {
        self.writable.insert(id);
    }

    pub fn remove_writable(&mut self, id: StreamId) {
        self.writable.remove(&id);
    }

    pub fn writable_streams(&self) -> &BTreeSet<StreamId> {
        &self.writable
    }

    pub fn has_writable(&self) -> bool {
        !self.writable.is_empty()
    }

    pub fn add_deliverable(&mut self, id: StreamId) {
        self.deliverable.insert(id);
    }

    pub fn remove_deliverable(&mut self, id: StreamId) {
        self.deliverable.remove(&id);
    }

    pub(crate) fn pop_deliverable(&mut self) -> Option<StreamId> {
        let id = *self.deliverable.iter().next()?;
        self.deliverable.remove(&id);
        Some(id)
    }

    pub fn deliverable_streams(&self) -> &BTreeSet<StreamId> {
        &self.deliverable
    }

    pub fn add_tx(&mut self, id: StreamId) {
        self.tx.insert(id);
    }

    pub fn remove_tx(&mut self, id: StreamId) {
        self.tx.remove(&id);
    }

    pub(crate) fn pop_tx(&mut self) -> Option<StreamId> {
        let id = *self.tx.iter().next()?;
        self.tx.remove(&id);
        Some(id)
    }

    pub fn queue_flow_control_updated(&mut self, id: StreamId) {
        self.flow_control_updated.insert(id);
    }

    pub(crate) fn take_flow_control_updated(&mut self) -> Vec<StreamId> {
        let ids = self.flow_control_updated.iter().copied().collect();
        self.flow_control_updated.clear();
        ids
    }

    pub fn add_stop_sending(&mut self, id: StreamId, error: ApplicationErrorCode) {
        self.stop_sending.push((id, error));
    }

    pub(crate) fn take_stop_sending(&mut self) -> Vec<(StreamId, ApplicationErrorCode)> {
        std::mem::take(&mut self.stop_sending)
    }

    /// Record that the peer reset a stream; byte events for it are cancelled
    /// on the next dispatch
    pub fn add_pending_reset(&mut self, id: StreamId) {
        self.pending_reset_callbacks.push(id);
    }

    pub(crate) fn take_pending_resets(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.pending_reset_callbacks)
    }

    pub(crate) fn take_new_peer_streams(&mut self) -> Vec<StreamId> {
        std::mem::take(&mut self.new_peer_streams)
    }

    pub(crate) fn take_new_peer_stream_groups(&mut self) -> Vec<(StreamGroupId, Dir)> {
        std::mem::take(&mut self.new_peer_stream_groups)
    }

    pub fn add_loss(&mut self, id: StreamId) {
        self.loss_streams.insert(id);
    }

    pub fn remove_loss(&mut self, id: StreamId) {
        self.loss_streams.remove(&id);
    }

    pub fn has_loss(&self) -> bool {
        !self.loss_streams.is_empty()
    }

    //
    // Lifecycle
    //

    /// Move a stream whose both halves are terminal into the closed set
    pub fn maybe_mark_closed(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get(&id) {
            if stream.all_terminal() {
                self.closed.insert(id);
            }
        }
    }

    pub fn closed_streams(&self) -> &BTreeSet<StreamId> {
        &self.closed
    }

    /// Remove a reaped stream entirely, returning any buffered send bytes so
    /// the caller can settle connection-level accounting
    pub fn remove_closed_stream(&mut self, id: StreamId) -> u64 {
        self.closed.remove(&id);
        self.readable.remove(&id);
        self.peekable.remove(&id);
        self.writable.remove(&id);
        self.deliverable.remove(&id);
        self.tx.remove(&id);
        self.flow_control_updated.remove(&id);
        self.loss_streams.remove(&id);
        match self.streams.remove(&id) {
            Some(mut stream) => stream.write_buffer.clear(),
            None => 0,
        }
    }

    /// Drop all streams at connection close; the peer resets them implicitly
    /// when it sees the close
    pub fn clear_open_streams(&mut self) {
        self.streams.clear();
        self.closed.clear();
        self.clear_actionable();
        self.writable.clear();
        self.loss_streams.clear();
    }

    /// Forget everything queued for dispatch
    pub fn clear_actionable(&mut self) {
        self.readable.clear();
        self.peekable.clear();
        self.deliverable.clear();
        self.tx.clear();
        self.flow_control_updated.clear();
        self.stop_sending.clear();
        self.pending_reset_callbacks.clear();
        self.new_peer_streams.clear();
        self.new_peer_stream_groups.clear();
    }

    pub fn clear_writable(&mut self) {
        self.writable.clear();
    }

    //
    // Send-side transitions
    //

    /// Append application data to a stream's send buffer, returning the bytes
    /// enqueued
    pub fn write_data_to_stream(
        &mut self,
        id: StreamId,
        data: Bytes,
        eof: bool,
    ) -> Result<u64, LocalErrorCode> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(LocalErrorCode::StreamNotExists)?;
        if !stream.writable() {
            return Err(LocalErrorCode::StreamClosed);
        }
        let added = data.len() as u64;
        stream.write_buffer.append(data);
        if eof {
            stream.final_write_offset = Some(stream.write_buffer.end_offset());
        }
        self.writable.insert(id);
        Ok(added)
    }

    /// Abandon the send side of a stream, returning the buffered bytes freed
    pub fn reset_stream_send(
        &mut self,
        id: StreamId,
        error: ApplicationErrorCode,
    ) -> Result<u64, LocalErrorCode> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(LocalErrorCode::StreamNotExists)?;
        if stream.send_state == StreamSendState::Invalid {
            return Err(LocalErrorCode::InvalidOperation);
        }
        stream.send_state = StreamSendState::ResetSent;
        stream.write_error = Some(QuicError::application(error, "reset locally"));
        let freed = stream.write_buffer.clear();
        self.writable.remove(&id);
        self.loss_streams.remove(&id);
        self.maybe_mark_closed(id);
        Ok(freed)
    }

    /// The codec finished the send side (all data acked through FIN)
    pub fn close_stream_send(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.send_state = StreamSendState::Closed;
        }
        self.writable.remove(&id);
        self.maybe_mark_closed(id);
    }
}
