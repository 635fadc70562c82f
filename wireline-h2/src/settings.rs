//! HTTP/2 SETTINGS parameters (RFC 9113 Section 6.5).

use crate::error::{ErrorCode, ProtoError};

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
const SETTINGS_ENABLE_PUSH: u16 = 0x2;
const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// HTTP/2 SETTINGS parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1). Default 4096.
    pub header_table_size: u32,
    /// SETTINGS_ENABLE_PUSH (0x2). Default enabled.
    pub enable_push: bool,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3). Default unlimited.
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4). Default 65535.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE (0x5). Default 16384.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6). Default unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Settings announced by the client at connection start. Push stays
    /// enabled so the server may promise streams.
    pub fn client_default() -> Self {
        Self::default()
    }

    /// Serialize as a sequence of 6-byte (identifier, value) pairs.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_setting(buf, SETTINGS_HEADER_TABLE_SIZE, self.header_table_size);
        put_setting(buf, SETTINGS_ENABLE_PUSH, u32::from(self.enable_push));
        if let Some(v) = self.max_concurrent_streams {
            put_setting(buf, SETTINGS_MAX_CONCURRENT_STREAMS, v);
        }
        put_setting(buf, SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size);
        put_setting(buf, SETTINGS_MAX_FRAME_SIZE, self.max_frame_size);
        if let Some(v) = self.max_header_list_size {
            put_setting(buf, SETTINGS_MAX_HEADER_LIST_SIZE, v);
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Parse a SETTINGS payload. The caller guarantees the length is a
    /// multiple of six.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        let mut settings = Settings::default();
        for pair in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([pair[0], pair[1]]);
            let value = u32::from_be_bytes([pair[2], pair[3], pair[4], pair[5]]);
            match id {
                SETTINGS_HEADER_TABLE_SIZE => settings.header_table_size = value,
                SETTINGS_ENABLE_PUSH => {
                    if value > 1 {
                        return Err(ProtoError::Connection {
                            reason: ErrorCode::Protocol,
                            text: "SETTINGS_ENABLE_PUSH must be 0 or 1.",
                        });
                    }
                    settings.enable_push = value == 1;
                }
                SETTINGS_MAX_CONCURRENT_STREAMS => {
                    settings.max_concurrent_streams = Some(value);
                }
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > 0x7fff_ffff {
                        return Err(ProtoError::Connection {
                            reason: ErrorCode::FlowControl,
                            text: "SETTINGS_INITIAL_WINDOW_SIZE exceeds the maximum window.",
                        });
                    }
                    settings.initial_window_size = value;
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(16_384..=16_777_215).contains(&value) {
                        return Err(ProtoError::Connection {
                            reason: ErrorCode::Protocol,
                            text: "SETTINGS_MAX_FRAME_SIZE out of range.",
                        });
                    }
                    settings.max_frame_size = value;
                }
                SETTINGS_MAX_HEADER_LIST_SIZE => {
                    settings.max_header_list_size = Some(value);
                }
                // Unknown identifiers MUST be ignored.
                _ => {}
            }
        }
        Ok(settings)
    }
}

fn put_setting(buf: &mut Vec<u8>, id: u16, value: u32) {
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&value.to_be_bytes());
}
