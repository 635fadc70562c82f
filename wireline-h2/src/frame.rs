//! HTTP/2 frame parsing and serialization (RFC 9113 Section 4).
//!
//! Frames share a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```
//!
//! `parse` is a pure verdict function: it never buffers and never touches
//! connection state. Recoverable violations are reported per stream,
//! everything else as a connection error.

use crate::error::{ErrorCode, ProtoError};
use crate::settings::Settings;

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

// Frame type identifiers (RFC 9113 Section 6).
pub const TYPE_DATA: u8 = 0x0;
pub const TYPE_HEADERS: u8 = 0x1;
pub const TYPE_PRIORITY: u8 = 0x2;
pub const TYPE_RST_STREAM: u8 = 0x3;
pub const TYPE_SETTINGS: u8 = 0x4;
pub const TYPE_PUSH_PROMISE: u8 = 0x5;
pub const TYPE_PING: u8 = 0x6;
pub const TYPE_GOAWAY: u8 = 0x7;
pub const TYPE_WINDOW_UPDATE: u8 = 0x8;
pub const TYPE_CONTINUATION: u8 = 0x9;

// Flag bits.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// A decoded HTTP/2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Vec<u8>,
        end_stream: bool,
    },
    /// HPACK-encoded header block fragment. Priority information, when
    /// present, is stripped during parsing.
    Headers {
        stream_id: u32,
        fragment: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
    },
    /// Advisory; carried through so the machine can account for it.
    Priority { stream_id: u32 },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings { ack: bool, settings: Settings },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
        fragment: Vec<u8>,
        end_headers: bool,
    },
    Ping { ack: bool, payload: [u8; 8] },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    WindowUpdate { stream_id: u32, increment: u32 },
    Continuation {
        stream_id: u32,
        fragment: Vec<u8>,
        end_headers: bool,
    },
}

/// Verdict of parsing the front of an input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// One complete frame.
    Frame { frame: Frame, consumed: usize },
    /// Unknown or extension frame type; drop silently.
    Ignored { consumed: usize },
    /// Recoverable violation scoped to one stream.
    StreamError {
        stream_id: u32,
        reason: ErrorCode,
        text: &'static str,
        consumed: usize,
    },
    /// Violation that must terminate the connection.
    ConnectionError {
        reason: ErrorCode,
        text: &'static str,
    },
    /// The buffer holds a strict prefix of a frame.
    More,
}

fn connection_error(reason: ErrorCode, text: &'static str) -> Parsed {
    Parsed::ConnectionError { reason, text }
}

/// Parse one frame from the front of `buf`.
pub fn parse(buf: &[u8], max_frame_size: u32) -> Parsed {
    if buf.len() < FRAME_HEADER_LEN {
        return Parsed::More;
    }
    let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
    let frame_type = buf[3];
    let flags = buf[4];
    let stream_id =
        u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;

    if length > max_frame_size as usize {
        return connection_error(ErrorCode::FrameSize, "Frame exceeds SETTINGS_MAX_FRAME_SIZE.");
    }
    let total = FRAME_HEADER_LEN + length;
    if buf.len() < total {
        return Parsed::More;
    }
    let payload = &buf[FRAME_HEADER_LEN..total];

    let frame = match frame_type {
        TYPE_DATA => {
            if stream_id == 0 {
                return connection_error(ErrorCode::Protocol, "DATA frame on stream 0.");
            }
            let data = match strip_padding(payload, flags) {
                Ok(d) => d,
                Err(p) => return p,
            };
            Frame::Data {
                stream_id,
                payload: data.to_vec(),
                end_stream: flags & FLAG_END_STREAM != 0,
            }
        }
        TYPE_HEADERS => {
            if stream_id == 0 {
                return connection_error(ErrorCode::Protocol, "HEADERS frame on stream 0.");
            }
            let data = match strip_padding(payload, flags) {
                Ok(d) => d,
                Err(p) => return p,
            };
            let fragment = if flags & FLAG_PRIORITY != 0 {
                if data.len() < 5 {
                    return connection_error(
                        ErrorCode::FrameSize,
                        "HEADERS priority section truncated.",
                    );
                }
                let dependency =
                    u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
                if dependency == stream_id {
                    return Parsed::StreamError {
                        stream_id,
                        reason: ErrorCode::Protocol,
                        text: "HEADERS frame depends on itself.",
                        consumed: total,
                    };
                }
                &data[5..]
            } else {
                data
            };
            Frame::Headers {
                stream_id,
                fragment: fragment.to_vec(),
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        TYPE_PRIORITY => {
            if stream_id == 0 {
                return connection_error(ErrorCode::Protocol, "PRIORITY frame on stream 0.");
            }
            if payload.len() != 5 {
                return Parsed::StreamError {
                    stream_id,
                    reason: ErrorCode::FrameSize,
                    text: "PRIORITY frame with an incorrect length.",
                    consumed: total,
                };
            }
            let dependency =
                u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
            if dependency == stream_id {
                return Parsed::StreamError {
                    stream_id,
                    reason: ErrorCode::Protocol,
                    text: "PRIORITY frame depends on itself.",
                    consumed: total,
                };
            }
            Frame::Priority { stream_id }
        }
        TYPE_RST_STREAM => {
            if stream_id == 0 {
                return connection_error(ErrorCode::Protocol, "RST_STREAM frame on stream 0.");
            }
            if payload.len() != 4 {
                return connection_error(
                    ErrorCode::FrameSize,
                    "RST_STREAM frame with an incorrect length.",
                );
            }
            let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            Frame::RstStream {
                stream_id,
                error_code: ErrorCode::from_u32(code),
            }
        }
        TYPE_SETTINGS => {
            if stream_id != 0 {
                return connection_error(
                    ErrorCode::Protocol,
                    "SETTINGS frame on a non-zero stream.",
                );
            }
            if flags & FLAG_ACK != 0 {
                if !payload.is_empty() {
                    return connection_error(
                        ErrorCode::FrameSize,
                        "SETTINGS acknowledgement with a non-empty payload.",
                    );
                }
                Frame::Settings {
                    ack: true,
                    settings: Settings::default(),
                }
            } else {
                if !payload.len().is_multiple_of(6) {
                    return connection_error(
                        ErrorCode::FrameSize,
                        "SETTINGS payload is not a multiple of 6 bytes.",
                    );
                }
                match Settings::decode(payload) {
                    Ok(settings) => Frame::Settings {
                        ack: false,
                        settings,
                    },
                    Err(ProtoError::Connection { reason, text })
                    | Err(ProtoError::Stream { reason, text, .. }) => {
                        return connection_error(reason, text);
                    }
                }
            }
        }
        TYPE_PUSH_PROMISE => {
            if stream_id == 0 {
                return connection_error(ErrorCode::Protocol, "PUSH_PROMISE frame on stream 0.");
            }
            let data = match strip_padding(payload, flags) {
                Ok(d) => d,
                Err(p) => return p,
            };
            if data.len() < 4 {
                return connection_error(
                    ErrorCode::FrameSize,
                    "PUSH_PROMISE frame with an incorrect length.",
                );
            }
            let promised_id =
                u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
            Frame::PushPromise {
                stream_id,
                promised_id,
                fragment: data[4..].to_vec(),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        TYPE_PING => {
            if stream_id != 0 {
                return connection_error(ErrorCode::Protocol, "PING frame on a non-zero stream.");
            }
            if payload.len() != 8 {
                return connection_error(
                    ErrorCode::FrameSize,
                    "PING frame with an incorrect length.",
                );
            }
            let mut data = [0u8; 8];
            data.copy_from_slice(payload);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                payload: data,
            }
        }
        TYPE_GOAWAY => {
            if stream_id != 0 {
                return connection_error(
                    ErrorCode::Protocol,
                    "GOAWAY frame on a non-zero stream.",
                );
            }
            if payload.len() < 8 {
                return connection_error(
                    ErrorCode::FrameSize,
                    "GOAWAY frame with an incorrect length.",
                );
            }
            let last_stream_id =
                u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
            let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            Frame::GoAway {
                last_stream_id,
                error_code: ErrorCode::from_u32(code),
                debug_data: payload[8..].to_vec(),
            }
        }
        TYPE_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return connection_error(
                    ErrorCode::FrameSize,
                    "WINDOW_UPDATE frame with an incorrect length.",
                );
            }
            let increment =
                u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
            if increment == 0 {
                if stream_id == 0 {
                    return connection_error(
                        ErrorCode::Protocol,
                        "WINDOW_UPDATE frame with an increment of 0.",
                    );
                }
                return Parsed::StreamError {
                    stream_id,
                    reason: ErrorCode::Protocol,
                    text: "WINDOW_UPDATE frame with an increment of 0.",
                    consumed: total,
                };
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        TYPE_CONTINUATION => {
            if stream_id == 0 {
                return connection_error(
                    ErrorCode::Protocol,
                    "CONTINUATION frame on stream 0.",
                );
            }
            Frame::Continuation {
                stream_id,
                fragment: payload.to_vec(),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        // Unknown and extension frame types MUST be ignored.
        _ => return Parsed::Ignored { consumed: total },
    };

    Parsed::Frame {
        frame,
        consumed: total,
    }
}

fn strip_padding(payload: &[u8], flags: u8) -> Result<&[u8], Parsed> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(connection_error(
            ErrorCode::FrameSize,
            "Padded frame with an empty payload.",
        ));
    }
    let pad_len = payload[0] as usize;
    if pad_len >= payload.len() {
        return Err(connection_error(
            ErrorCode::Protocol,
            "Padding exceeds the frame payload.",
        ));
    }
    Ok(&payload[1..payload.len() - pad_len])
}

fn put_header(buf: &mut Vec<u8>, length: usize, frame_type: u8, flags: u8, stream_id: u32) {
    let len = length as u32;
    buf.extend_from_slice(&len.to_be_bytes()[1..]);
    buf.push(frame_type);
    buf.push(flags);
    buf.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
}

impl Frame {
    /// Serialize this frame (header plus payload) into `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                put_header(buf, payload.len(), TYPE_DATA, flags, *stream_id);
                buf.extend_from_slice(payload);
            }
            Frame::Headers {
                stream_id,
                fragment,
                end_stream,
                end_headers,
            } => {
                let mut flags = 0;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                put_header(buf, fragment.len(), TYPE_HEADERS, flags, *stream_id);
                buf.extend_from_slice(fragment);
            }
            Frame::Priority { stream_id } => {
                put_header(buf, 5, TYPE_PRIORITY, 0, *stream_id);
                buf.extend_from_slice(&[0, 0, 0, 0, 16]);
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                put_header(buf, 4, TYPE_RST_STREAM, 0, *stream_id);
                buf.extend_from_slice(&error_code.as_u32().to_be_bytes());
            }
            Frame::Settings { ack, settings } => {
                if *ack {
                    put_header(buf, 0, TYPE_SETTINGS, FLAG_ACK, 0);
                } else {
                    let payload = settings.encode_to_vec();
                    put_header(buf, payload.len(), TYPE_SETTINGS, 0, 0);
                    buf.extend_from_slice(&payload);
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_id,
                fragment,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                put_header(buf, 4 + fragment.len(), TYPE_PUSH_PROMISE, flags, *stream_id);
                buf.extend_from_slice(&(promised_id & 0x7fff_ffff).to_be_bytes());
                buf.extend_from_slice(fragment);
            }
            Frame::Ping { ack, payload } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                put_header(buf, 8, TYPE_PING, flags, 0);
                buf.extend_from_slice(payload);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                put_header(buf, 8 + debug_data.len(), TYPE_GOAWAY, 0, 0);
                buf.extend_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
                buf.extend_from_slice(&error_code.as_u32().to_be_bytes());
                buf.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                put_header(buf, 4, TYPE_WINDOW_UPDATE, 0, *stream_id);
                buf.extend_from_slice(&(increment & 0x7fff_ffff).to_be_bytes());
            }
            Frame::Continuation {
                stream_id,
                fragment,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                put_header(buf, fragment.len(), TYPE_CONTINUATION, flags, *stream_id);
                buf.extend_from_slice(fragment);
            }
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}
