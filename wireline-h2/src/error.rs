/// HTTP/2 error codes (RFC 9113 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    Protocol = 0x1,
    Internal = 0x2,
    FlowControl = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSize = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    Compression = 0x9,
    Connect = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::Protocol,
            0x2 => Self::Internal,
            0x3 => Self::FlowControl,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSize,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::Compression,
            0xa => Self::Connect,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            // Unknown codes MUST be treated as INTERNAL_ERROR.
            _ => Self::Internal,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A protocol violation detected by the codec or the machine.
///
/// Stream-scoped violations leave the connection usable; connection-scoped
/// violations require a GOAWAY and teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoError {
    /// Violation scoped to a single stream.
    Stream {
        stream_id: u32,
        reason: ErrorCode,
        text: &'static str,
    },
    /// Violation that must terminate the connection.
    Connection {
        reason: ErrorCode,
        text: &'static str,
    },
}

impl ProtoError {
    /// The error code to put on the wire (RST_STREAM or GOAWAY).
    pub fn reason(&self) -> ErrorCode {
        match self {
            Self::Stream { reason, .. } | Self::Connection { reason, .. } => *reason,
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            Self::Stream { text, .. } | Self::Connection { text, .. } => text,
        }
    }
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream {
                stream_id,
                reason,
                text,
            } => write!(f, "stream {stream_id} error ({reason:?}): {text}"),
            Self::Connection { reason, text } => {
                write!(f, "connection error ({reason:?}): {text}")
            }
        }
    }
}

impl std::error::Error for ProtoError {}
