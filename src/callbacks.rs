use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::connection::QuicTransport;
use crate::error::{ApplicationErrorCode, QuicError};
use crate::socket::CmsgMap;
use crate::{StreamGroupId, StreamId};

/// Whether a byte event reports acknowledgement or first transmission
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ByteEventKind {
    /// The byte at the registered offset was acknowledged by the peer
    Ack,
    /// The byte at the registered offset was handed to the socket at least once
    Tx,
}

/// A per-offset notification on a stream
#[derive(Debug, Clone, Copy)]
pub struct ByteEvent {
    pub id: StreamId,
    pub offset: u64,
    pub kind: ByteEventKind,
    /// Smoothed RTT at delivery time, for RTT telemetry on ACK events
    pub srtt: Duration,
}

/// A byte event registration that will never fire
#[derive(Debug, Clone, Copy)]
pub struct ByteEventCancellation {
    pub id: StreamId,
    pub offset: u64,
    pub kind: ByteEventKind,
}

/// Consumer of readable-data notifications for a stream
pub trait ReadCallback {
    /// The stream has data (or an EOF) ready to `read`
    fn read_available(&self, transport: &mut QuicTransport, id: StreamId);

    fn read_available_with_group(
        &self,
        transport: &mut QuicTransport,
        id: StreamId,
        _group: StreamGroupId,
    ) {
        self.read_available(transport, id);
    }

    /// The stream can no longer deliver data
    fn read_error(&self, transport: &mut QuicTransport, id: StreamId, error: QuicError);

    fn read_error_with_group(
        &self,
        transport: &mut QuicTransport,
        id: StreamId,
        _group: StreamGroupId,
        error: QuicError,
    ) {
        self.read_error(transport, id, error);
    }
}

/// Consumer of peekable-data notifications for a stream
pub trait PeekCallback {
    fn peek_available(&self, transport: &mut QuicTransport, id: StreamId);

    fn peek_error(&self, transport: &mut QuicTransport, id: StreamId, error: QuicError);
}

/// Consumer of write-readiness notifications, at stream or connection level
pub trait WriteCallback {
    /// The stream has budget to accept up to `max_to_send` bytes
    #[allow(unused_variables)]
    fn stream_write_ready(&self, transport: &mut QuicTransport, id: StreamId, max_to_send: u64) {}

    #[allow(unused_variables)]
    fn connection_write_ready(&self, transport: &mut QuicTransport, max_to_send: u64) {}

    #[allow(unused_variables)]
    fn stream_write_error(&self, transport: &mut QuicTransport, id: StreamId, error: QuicError) {}

    #[allow(unused_variables)]
    fn connection_write_error(&self, transport: &mut QuicTransport, error: QuicError) {}
}

/// Consumer of byte-event notifications
pub trait ByteEventCallback {
    /// The registration was accepted
    #[allow(unused_variables)]
    fn on_byte_event_registered(&self, transport: &mut QuicTransport, event: ByteEvent) {}

    /// The registered offset was reached
    fn on_byte_event(&self, transport: &mut QuicTransport, event: ByteEvent);

    /// The registration will never fire
    #[allow(unused_variables)]
    fn on_byte_event_canceled(
        &self,
        transport: &mut QuicTransport,
        cancellation: ByteEventCancellation,
    ) {
    }
}

/// Consumer of datagram arrival notifications
pub trait DatagramCallback {
    fn on_datagrams_available(&self, transport: &mut QuicTransport);
}

/// Consumer of ping outcomes
pub trait PingCallback {
    /// The peer sent us a PING
    #[allow(unused_variables)]
    fn on_ping(&self, transport: &mut QuicTransport) {}

    fn ping_acknowledged(&self, transport: &mut QuicTransport);

    fn ping_timeout(&self, transport: &mut QuicTransport);
}

/// Callbacks delivered while the connection is being established
pub trait ConnectionSetupCallback {
    fn on_connection_setup_error(&self, transport: &mut QuicTransport, error: QuicError);

    #[allow(unused_variables)]
    fn on_transport_ready(&self, transport: &mut QuicTransport) {}

    #[allow(unused_variables)]
    fn on_replay_safe(&self, transport: &mut QuicTransport) {}
}

/// Callbacks delivered over the lifetime of an established connection
pub trait ConnectionCallback {
    fn on_new_bidirectional_stream(&self, transport: &mut QuicTransport, id: StreamId);

    fn on_new_unidirectional_stream(&self, transport: &mut QuicTransport, id: StreamId);

    #[allow(unused_variables)]
    fn on_new_bidirectional_stream_group(
        &self,
        transport: &mut QuicTransport,
        group: StreamGroupId,
    ) {
    }

    #[allow(unused_variables)]
    fn on_new_unidirectional_stream_group(
        &self,
        transport: &mut QuicTransport,
        group: StreamGroupId,
    ) {
    }

    #[allow(unused_variables)]
    fn on_new_bidirectional_stream_in_group(
        &self,
        transport: &mut QuicTransport,
        id: StreamId,
        group: StreamGroupId,
    ) {
    }

    #[allow(unused_variables)]
    fn on_new_unidirectional_stream_in_group(
        &self,
        transport: &mut QuicTransport,
        id: StreamId,
        group: StreamGroupId,
    ) {
    }

    /// The peer asked us to stop sending on a stream
    fn on_stop_sending(
        &self,
        transport: &mut QuicTransport,
        id: StreamId,
        error: ApplicationErrorCode,
    );

    /// The connection closed without an error to report
    fn on_connection_end(&self);

    /// The connection closed with an error
    fn on_connection_error(&self, error: QuicError);

    /// The connection closed; always carries the close code. Only invoked
    /// when `use_connection_end_with_error_callback` is set, in place of the
    /// two-callback shape above.
    fn on_connection_end_with_error(&self, error: QuicError) {
        let _ = error;
        self.on_connection_end();
    }

    #[allow(unused_variables)]
    fn on_flow_control_update(&self, transport: &mut QuicTransport, id: StreamId) {}

    #[allow(unused_variables)]
    fn on_bidirectional_streams_available(&self, transport: &mut QuicTransport, count: u64) {}

    #[allow(unused_variables)]
    fn on_unidirectional_streams_available(&self, transport: &mut QuicTransport, count: u64) {}

    /// The sender ran out of data before filling the congestion window
    fn on_app_rate_limited(&self) {}

    #[allow(unused_variables)]
    fn on_knob(&self, knob_space: u64, knob_id: u64, blob: Bytes) {}

    /// A stream is about to be removed from the stream manager
    #[allow(unused_variables)]
    fn on_stream_pre_reaped(&self, transport: &mut QuicTransport, id: StreamId) {}
}

/// Per-packet hook consulted before writes and after acknowledgements
pub trait PacketProcessor {
    /// Additional cmsgs to attach to the next send batch
    fn prewrite_request(&self) -> Option<CmsgMap> {
        None
    }

    #[allow(unused_variables)]
    fn on_packet_ack(&self, ack: &crate::connection::AckEvent) {}
}

/// Source of external throttling hints consulted by the congestion layer
pub trait ThrottlingSignalProvider {
    /// Currently advised maximum pacing rate, if any
    fn current_throttle_rate(&self) -> Option<u64>;
}

/// State for a read or peek callback registration
pub(crate) struct ReadCallbackEntry {
    pub(crate) cb: Option<Rc<dyn ReadCallback>>,
    pub(crate) resumed: bool,
    pub(crate) delivered_eom: bool,
}

pub(crate) struct PeekCallbackEntry {
    pub(crate) cb: Option<Rc<dyn PeekCallback>>,
    pub(crate) resumed: bool,
}

/// One registered byte event; the queue per (kind, stream) is kept sorted by
/// offset
pub(crate) struct ByteEventDetail {
    pub(crate) offset: u64,
    pub(crate) cb: Rc<dyn ByteEventCallback>,
}

pub(crate) type ByteEventMap = FxHashMap<StreamId, Vec<ByteEventDetail>>;
