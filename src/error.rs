use std::fmt;

use thiserror::Error;

/// Errors surfaced to the local application without involving the peer
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Error)]
pub enum LocalErrorCode {
    #[error("invalid operation")]
    InvalidOperation,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("stream does not exist")]
    StreamNotExists,
    #[error("stream closed")]
    StreamClosed,
    #[error("invalid write callback")]
    InvalidWriteCallback,
    #[error("callback already installed")]
    CallbackAlreadyInstalled,
    #[error("invalid write data")]
    InvalidWriteData,
    #[error("application error")]
    AppError,
    #[error("transport error")]
    TransportError,
    #[error("internal error")]
    InternalError,
    #[error("pacer not available")]
    PacerNotAvailable,
    #[error("knob frames not supported by peer")]
    KnobFrameUnsupported,
    #[error("retransmission policies limit exceeded")]
    RtxPoliciesLimitExceeded,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("shutting down")]
    ShuttingDown,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection abandoned")]
    ConnectionAbandoned,
    #[error("no error")]
    NoError,
}

/// Transport-level error codes carried in CONNECTION_CLOSE frames
///
/// Only the codes the connection core itself raises or classifies are named;
/// arbitrary codes produced by the codec are representable all the same.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportErrorCode(pub u64);

impl TransportErrorCode {
    pub const NO_ERROR: Self = Self(0x0);
    pub const INTERNAL_ERROR: Self = Self(0x1);
    pub const FLOW_CONTROL_ERROR: Self = Self(0x3);
    pub const PROTOCOL_VIOLATION: Self = Self(0xa);
    pub const INVALID_MIGRATION: Self = Self(0xc);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::NO_ERROR => "NO_ERROR",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            Self::PROTOCOL_VIOLATION => "PROTOCOL_VIOLATION",
            Self::INVALID_MIGRATION => "INVALID_MIGRATION",
            _ => return None,
        })
    }
}

impl fmt::Debug for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "TransportErrorCode({:#x})", self.0),
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Debug>::fmt(self, f)
    }
}

/// Application protocol error code, opaque to the transport
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ApplicationErrorCode(pub u64);

impl fmt::Display for ApplicationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three families an error attached to a connection can come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Local(LocalErrorCode),
    Transport(TransportErrorCode),
    Application(ApplicationErrorCode),
}

impl ErrorCode {
    pub fn as_local(&self) -> Option<LocalErrorCode> {
        match self {
            Self::Local(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_transport(&self) -> Option<TransportErrorCode> {
        match self {
            Self::Transport(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_application(&self) -> Option<ApplicationErrorCode> {
        match self {
            Self::Application(c) => Some(*c),
            _ => None,
        }
    }
}

/// An error code plus a human-readable message, as attached to a connection
/// or delivered to application callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicError {
    pub code: ErrorCode,
    pub message: String,
}

impl QuicError {
    pub fn local(code: LocalErrorCode) -> Self {
        Self {
            code: ErrorCode::Local(code),
            message: code.to_string(),
        }
    }

    pub fn local_with(code: LocalErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Local(code),
            message: message.into(),
        }
    }

    pub fn transport(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Transport(code),
            message: message.into(),
        }
    }

    pub fn application(code: ApplicationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Application(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for QuicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            ErrorCode::Local(c) => write!(f, "{}: {}", c, self.message),
            ErrorCode::Transport(c) => write!(f, "{}: {}", c, self.message),
            ErrorCode::Application(c) => write!(f, "application error {}: {}", c, self.message),
        }
    }
}

/// Failure reported by a collaborator (codec, frame scheduler, stream
/// machinery) at a transport boundary
///
/// The `what` string is the unsanitized description; the close path keeps it
/// for local delivery only and puts a sanitized message on the wire.
#[derive(Debug, Clone, Error)]
pub enum TransportFault {
    #[error("protocol fault {code}: {what}")]
    Protocol {
        code: TransportErrorCode,
        what: String,
    },
    #[error("internal fault: {what}")]
    Internal { code: LocalErrorCode, what: String },
    #[error("application fault {code}: {what}")]
    App {
        code: ApplicationErrorCode,
        what: String,
    },
}

impl TransportFault {
    /// The unsanitized message carried by the fault
    pub fn what(&self) -> &str {
        match self {
            Self::Protocol { what, .. } => what,
            Self::Internal { what, .. } => what,
            Self::App { what, .. } => what,
        }
    }

    /// Classify the fault into the error that closes the connection, using
    /// `context` as the sanitized message
    pub(crate) fn to_close_error(&self, context: &str) -> QuicError {
        match self {
            Self::Protocol { code, .. } => QuicError::transport(*code, context),
            Self::Internal { code, .. } => QuicError::local_with(*code, context),
            Self::App { code, .. } => QuicError::application(*code, context),
        }
    }
}
