//! Client-side HTTP/2 protocol machine.
//!
//! `Machine` is pure state: it consumes decoded frames and produces
//! validated events, and it consumes send requests and produces frames to
//! serialize. It owns the HPACK tables, the settings, every flow control
//! window, and the per-stream half-states. It never touches a socket; the
//! engine layered on top is responsible for all I/O and for acknowledging
//! SETTINGS and PING frames once the machine has accepted them.

use std::collections::{BTreeMap, VecDeque};

use hpack::{Decoder, Encoder};

use crate::error::{ErrorCode, ProtoError};
use crate::flowcontrol::Window;
use crate::frame::Frame;
use crate::headers::{HeaderField, RequestPseudo};
use crate::settings::Settings;

/// HTTP/2 connection preface (RFC 9113 Section 3.4).
const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Terminal flag on HEADERS and DATA: whether the sending side half-closes
/// after this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fin {
    Fin,
    NoFin,
}

impl Fin {
    pub fn is_fin(self) -> bool {
        matches!(self, Fin::Fin)
    }

    pub fn from_flag(end_stream: bool) -> Self {
        if end_stream { Fin::Fin } else { Fin::NoFin }
    }
}

/// One direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    /// No frame has travelled in this direction yet.
    Idle,
    /// Frames may still travel in this direction.
    Open,
    /// This direction carried its END_STREAM flag.
    HalfClosed,
    /// The stream was reset.
    Closed,
}

impl HalfState {
    /// Whether this direction can carry no further frames.
    pub fn is_terminal(self) -> bool {
        matches!(self, HalfState::HalfClosed | HalfState::Closed)
    }
}

/// Validated protocol events surfaced to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Data {
        stream_id: u32,
        fin: Fin,
        payload: Vec<u8>,
    },
    /// Response HEADERS, informational or final. `headers` excludes
    /// pseudo-headers.
    Headers {
        stream_id: u32,
        fin: Fin,
        status: u16,
        headers: Vec<HeaderField>,
        body_len: Option<u64>,
    },
    Trailers {
        stream_id: u32,
        headers: Vec<HeaderField>,
    },
    RstStream {
        stream_id: u32,
        reason: ErrorCode,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
        pseudo: RequestPseudo,
        headers: Vec<HeaderField>,
    },
    GoAway {
        last_stream_id: u32,
        reason: ErrorCode,
        debug_data: Vec<u8>,
    },
}

/// A run of DATA frames released for one stream. `fin` reports whether the
/// run carries the stream's END_STREAM flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOut {
    pub stream_id: u32,
    pub fin: Fin,
    pub frames: Vec<Frame>,
}

/// Outcome of feeding one frame to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameResult {
    /// Frame consumed; nothing application-visible happened.
    Consumed,
    Event(Event),
    /// Flow control released parked DATA; the engine must serialize these.
    Send(Vec<SendOut>),
    Error(ProtoError),
}

/// Outcome of a send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataResult {
    /// Everything was parked behind flow control.
    Queued,
    Send(Vec<SendOut>),
}

/// Outbound data parked behind flow control.
struct Parked {
    fin: Fin,
    payload: Vec<u8>,
    offset: usize,
}

/// An in-flight header block (HEADERS or PUSH_PROMISE plus CONTINUATIONs).
struct HeaderBlock {
    stream_id: u32,
    /// Present when the block started with PUSH_PROMISE.
    promised_id: Option<u32>,
    end_stream: bool,
    fragment: Vec<u8>,
}

struct StreamFsm {
    local: HalfState,
    remote: HalfState,
    recv_window: Window,
    send_window: Window,
    method: String,
    /// Set once a final (non-1xx) response arrived; later HEADERS are
    /// trailers.
    final_response_seen: bool,
    /// Bytes of body still expected per the response content-length.
    body_remaining: Option<u64>,
    parked: VecDeque<Parked>,
}

impl StreamFsm {
    fn new(method: String, recv_window: i64, send_window: i64) -> Self {
        Self {
            local: HalfState::Idle,
            remote: HalfState::Idle,
            recv_window: Window::new(recv_window),
            send_window: Window::new(send_window),
            method,
            final_response_seen: false,
            body_remaining: None,
            parked: VecDeque::new(),
        }
    }

    fn is_finished(&self) -> bool {
        self.local.is_terminal() && self.remote.is_terminal() && self.parked.is_empty()
    }
}

/// Pure client-side HTTP/2 protocol state.
pub struct Machine {
    local_settings: Settings,
    remote_settings: Settings,
    streams: BTreeMap<u32, StreamFsm>,
    /// Next client-initiated stream id; always odd, strictly increasing.
    next_stream_id: u32,
    /// Highest server-initiated (promised) stream id observed.
    last_remote_stream_id: u32,
    conn_recv_window: Window,
    conn_send_window: Window,
    encoder: Encoder<'static>,
    decoder: Decoder<'static>,
    /// In-flight header block; while present only CONTINUATION frames for
    /// the same stream are legal.
    continuation: Option<HeaderBlock>,
    /// The server preface (its initial SETTINGS) has been observed.
    remote_preface_seen: bool,
}

impl Machine {
    /// Create a client machine. Returns the bytes the engine must write
    /// first: the connection preface magic plus the initial SETTINGS.
    pub fn new(local_settings: Settings) -> (Vec<u8>, Self) {
        let mut preface = Vec::with_capacity(64);
        preface.extend_from_slice(CLIENT_PREFACE);
        Frame::Settings {
            ack: false,
            settings: local_settings.clone(),
        }
        .encode(&mut preface);

        let initial_recv = i64::from(local_settings.initial_window_size);
        // Windows above the protocol default need an immediate credit.
        if initial_recv > crate::flowcontrol::DEFAULT_WINDOW_SIZE {
            Frame::WindowUpdate {
                stream_id: 0,
                increment: (initial_recv - crate::flowcontrol::DEFAULT_WINDOW_SIZE) as u32,
            }
            .encode(&mut preface);
        }

        let machine = Self {
            conn_recv_window: Window::new(initial_recv),
            conn_send_window: Window::default(),
            local_settings,
            remote_settings: Settings::default(),
            streams: BTreeMap::new(),
            next_stream_id: 1,
            last_remote_stream_id: 0,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            continuation: None,
            remote_preface_seen: false,
        };
        (preface, machine)
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// Highest server-initiated stream id processed; carried in GOAWAY.
    pub fn last_remote_stream_id(&self) -> u32 {
        self.last_remote_stream_id
    }

    pub fn stream_local_state(&self, stream_id: u32) -> Option<HalfState> {
        self.streams.get(&stream_id).map(|s| s.local)
    }

    pub fn stream_remote_state(&self, stream_id: u32) -> Option<HalfState> {
        self.streams.get(&stream_id).map(|s| s.remote)
    }

    // ── Inbound ────────────────────────────────────────────────────────

    /// Feed one decoded frame to the machine.
    pub fn frame(&mut self, frame: Frame) -> FrameResult {
        if let Some(block) = &self.continuation {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == block.stream_id => {}
                _ => {
                    return FrameResult::Error(ProtoError::Connection {
                        reason: ErrorCode::Protocol,
                        text: "Expected a CONTINUATION frame.",
                    });
                }
            }
        }
        if !self.remote_preface_seen {
            match &frame {
                Frame::Settings { ack: false, .. } => {}
                _ => {
                    return FrameResult::Error(ProtoError::Connection {
                        reason: ErrorCode::Protocol,
                        text: "The first frame from the server must be SETTINGS.",
                    });
                }
            }
        }

        match frame {
            Frame::Settings {
                ack: false,
                settings,
            } => self.apply_remote_settings(settings),
            Frame::Settings { ack: true, .. } => FrameResult::Consumed,
            Frame::Ping { .. } => FrameResult::Consumed,
            Frame::Priority { .. } => FrameResult::Consumed,
            Frame::Headers {
                stream_id,
                fragment,
                end_stream,
                end_headers,
            } => {
                if end_headers {
                    self.headers_block(stream_id, &fragment, Fin::from_flag(end_stream))
                } else {
                    self.continuation = Some(HeaderBlock {
                        stream_id,
                        promised_id: None,
                        end_stream,
                        fragment,
                    });
                    FrameResult::Consumed
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_id,
                fragment,
                end_headers,
            } => {
                if !self.local_settings.enable_push {
                    return FrameResult::Error(ProtoError::Connection {
                        reason: ErrorCode::Protocol,
                        text: "PUSH_PROMISE received although push is disabled.",
                    });
                }
                if promised_id % 2 != 0 || promised_id <= self.last_remote_stream_id {
                    return FrameResult::Error(ProtoError::Connection {
                        reason: ErrorCode::Protocol,
                        text: "PUSH_PROMISE with an invalid promised stream id.",
                    });
                }
                if end_headers {
                    self.push_block(stream_id, promised_id, &fragment)
                } else {
                    self.continuation = Some(HeaderBlock {
                        stream_id,
                        promised_id: Some(promised_id),
                        end_stream: false,
                        fragment,
                    });
                    FrameResult::Consumed
                }
            }
            Frame::Continuation {
                stream_id: _,
                fragment,
                end_headers,
            } => {
                let Some(block) = self.continuation.as_mut() else {
                    return FrameResult::Error(ProtoError::Connection {
                        reason: ErrorCode::Protocol,
                        text: "Unexpected CONTINUATION frame.",
                    });
                };
                block.fragment.extend_from_slice(&fragment);
                if !end_headers {
                    return FrameResult::Consumed;
                }
                let Some(block) = self.continuation.take() else {
                    return FrameResult::Consumed;
                };
                match block.promised_id {
                    Some(promised_id) => {
                        self.push_block(block.stream_id, promised_id, &block.fragment)
                    }
                    None => self.headers_block(
                        block.stream_id,
                        &block.fragment,
                        Fin::from_flag(block.end_stream),
                    ),
                }
            }
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => self.data_frame(stream_id, payload, Fin::from_flag(end_stream)),
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                if self.streams.remove(&stream_id).is_some() {
                    FrameResult::Event(Event::RstStream {
                        stream_id,
                        reason: error_code,
                    })
                } else {
                    self.unknown_stream(stream_id, "RST_STREAM frame on an idle stream.")
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => FrameResult::Event(Event::GoAway {
                last_stream_id,
                reason: error_code,
                debug_data,
            }),
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => {
                if !self.conn_send_window.credit(increment) {
                    return FrameResult::Error(ProtoError::Connection {
                        reason: ErrorCode::FlowControl,
                        text: "The connection send window overflowed.",
                    });
                }
                let released = self.release_all();
                if released.is_empty() {
                    FrameResult::Consumed
                } else {
                    FrameResult::Send(released)
                }
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let Some(fsm) = self.streams.get_mut(&stream_id) else {
                    return self.unknown_stream(stream_id, "WINDOW_UPDATE frame on an idle stream.");
                };
                if !fsm.send_window.credit(increment) {
                    self.streams.remove(&stream_id);
                    return FrameResult::Error(ProtoError::Stream {
                        stream_id,
                        reason: ErrorCode::FlowControl,
                        text: "The stream send window overflowed.",
                    });
                }
                match self.release_stream(stream_id) {
                    Some(out) => FrameResult::Send(vec![out]),
                    None => FrameResult::Consumed,
                }
            }
        }
    }

    /// Account for a frame the codec told the engine to drop.
    pub fn ignored_frame(&mut self) -> Result<(), ProtoError> {
        if self.continuation.is_some() {
            return Err(ProtoError::Connection {
                reason: ErrorCode::Protocol,
                text: "Expected a CONTINUATION frame.",
            });
        }
        Ok(())
    }

    fn apply_remote_settings(&mut self, settings: Settings) -> FrameResult {
        self.remote_preface_seen = true;
        let delta = i64::from(settings.initial_window_size)
            - i64::from(self.remote_settings.initial_window_size);
        self.remote_settings = settings;
        if delta != 0 {
            for fsm in self.streams.values_mut() {
                if !fsm.send_window.adjust(delta) {
                    return FrameResult::Error(ProtoError::Connection {
                        reason: ErrorCode::FlowControl,
                        text: "SETTINGS_INITIAL_WINDOW_SIZE overflowed a stream window.",
                    });
                }
            }
            // A larger window may unblock parked data.
            if delta > 0 {
                let released = self.release_all();
                if !released.is_empty() {
                    return FrameResult::Send(released);
                }
            }
        }
        FrameResult::Consumed
    }

    /// Frames referencing streams the machine no longer tracks: ids from a
    /// finished or reset stream race the close and are dropped; ids never
    /// opened are a connection error.
    fn unknown_stream(&self, stream_id: u32, text: &'static str) -> FrameResult {
        let was_local = stream_id % 2 == 1 && stream_id < self.next_stream_id;
        let was_remote = stream_id % 2 == 0 && stream_id <= self.last_remote_stream_id;
        if was_local || was_remote {
            FrameResult::Consumed
        } else {
            FrameResult::Error(ProtoError::Connection {
                reason: ErrorCode::Protocol,
                text,
            })
        }
    }

    fn decode_block(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, ProtoError> {
        match self.decoder.decode(block) {
            Ok(fields) => Ok(fields
                .into_iter()
                .map(|(name, value)| HeaderField { name, value })
                .collect()),
            Err(_) => Err(ProtoError::Connection {
                reason: ErrorCode::Compression,
                text: "HPACK decoding failed.",
            }),
        }
    }

    fn headers_block(&mut self, stream_id: u32, block: &[u8], fin: Fin) -> FrameResult {
        let fields = match self.decode_block(block) {
            Ok(fields) => fields,
            Err(err) => return FrameResult::Error(err),
        };
        // Resolve the stream before validating the header list so that a
        // malformed block on a dead stream never produces a stray RST_STREAM.
        match self.streams.get(&stream_id) {
            None => {
                return self.unknown_stream(stream_id, "HEADERS frame on an idle stream.");
            }
            Some(fsm) if fsm.remote.is_terminal() => {
                return self.stream_error(
                    stream_id,
                    ErrorCode::StreamClosed,
                    "HEADERS frame on a closed stream.",
                );
            }
            Some(_) => {}
        }
        let (status, headers) = match split_response_pseudo(&fields) {
            Ok(split) => split,
            Err(text) => return self.stream_error(stream_id, ErrorCode::Protocol, text),
        };
        let Some(fsm) = self.streams.get_mut(&stream_id) else {
            return FrameResult::Consumed;
        };

        if fsm.final_response_seen {
            // Trailers: no pseudo-headers, must end the stream.
            if status.is_some() {
                return self.stream_error(
                    stream_id,
                    ErrorCode::Protocol,
                    "Trailing HEADERS must not carry pseudo-headers.",
                );
            }
            if !fin.is_fin() {
                return self.stream_error(
                    stream_id,
                    ErrorCode::Protocol,
                    "Trailing HEADERS without the END_STREAM flag.",
                );
            }
            if matches!(fsm.body_remaining, Some(rem) if rem > 0) {
                return self.stream_error(
                    stream_id,
                    ErrorCode::Protocol,
                    "The stream ended before content-length was reached.",
                );
            }
            fsm.remote = HalfState::HalfClosed;
            let event = Event::Trailers { stream_id, headers };
            self.collect(stream_id);
            return FrameResult::Event(event);
        }

        let Some(status) = status else {
            return self.stream_error(
                stream_id,
                ErrorCode::Protocol,
                "Response HEADERS without a :status pseudo-header.",
            );
        };

        if status < 200 {
            if fin.is_fin() {
                return self.stream_error(
                    stream_id,
                    ErrorCode::Protocol,
                    "Informational responses must not end the stream.",
                );
            }
            fsm.remote = HalfState::Open;
            return FrameResult::Event(Event::Headers {
                stream_id,
                fin: Fin::NoFin,
                status,
                headers,
                body_len: None,
            });
        }

        fsm.final_response_seen = true;
        fsm.remote = if fin.is_fin() {
            HalfState::HalfClosed
        } else {
            HalfState::Open
        };
        let body_len = if fsm.method == "HEAD" {
            Some(0)
        } else {
            content_length(&headers)
        };
        if !fin.is_fin() {
            fsm.body_remaining = body_len;
        }
        let event = Event::Headers {
            stream_id,
            fin,
            status,
            headers,
            body_len,
        };
        if fin.is_fin() {
            self.collect(stream_id);
        }
        FrameResult::Event(event)
    }

    fn push_block(&mut self, stream_id: u32, promised_id: u32, block: &[u8]) -> FrameResult {
        let fields = match self.decode_block(block) {
            Ok(fields) => fields,
            Err(err) => return FrameResult::Error(err),
        };
        // The promised id is reserved even when the promise is unusable.
        self.last_remote_stream_id = promised_id;

        let Some(parent) = self.streams.get(&stream_id) else {
            return self.unknown_stream(stream_id, "PUSH_PROMISE frame on an idle stream.");
        };
        if parent.remote.is_terminal() {
            return self.stream_error(
                promised_id,
                ErrorCode::StreamClosed,
                "PUSH_PROMISE frame on a closed stream.",
            );
        }
        let (pseudo, headers) = match split_request_pseudo(&fields) {
            Ok(split) => split,
            Err(text) => return self.stream_error(promised_id, ErrorCode::Protocol, text),
        };

        let mut fsm = StreamFsm::new(
            pseudo.method.clone(),
            i64::from(self.local_settings.initial_window_size),
            i64::from(self.remote_settings.initial_window_size),
        );
        // The client never sends on a pushed stream.
        fsm.local = HalfState::HalfClosed;
        self.streams.insert(promised_id, fsm);

        FrameResult::Event(Event::PushPromise {
            stream_id,
            promised_id,
            pseudo,
            headers,
        })
    }

    fn data_frame(&mut self, stream_id: u32, payload: Vec<u8>, fin: Fin) -> FrameResult {
        let size = payload.len();
        if !self.conn_recv_window.consume(size) {
            return FrameResult::Error(ProtoError::Connection {
                reason: ErrorCode::FlowControl,
                text: "The connection receive window was exceeded.",
            });
        }
        let Some(fsm) = self.streams.get_mut(&stream_id) else {
            return self.unknown_stream(stream_id, "DATA frame on an idle stream.");
        };
        match fsm.remote {
            HalfState::Open => {}
            HalfState::Idle => {
                return FrameResult::Error(ProtoError::Connection {
                    reason: ErrorCode::Protocol,
                    text: "DATA frame received before HEADERS.",
                });
            }
            HalfState::HalfClosed | HalfState::Closed => {
                return self.stream_error(
                    stream_id,
                    ErrorCode::StreamClosed,
                    "DATA frame on a closed stream.",
                );
            }
        }
        if !fsm.recv_window.consume(size) {
            return self.stream_error(
                stream_id,
                ErrorCode::FlowControl,
                "The stream receive window was exceeded.",
            );
        }
        if let Some(remaining) = fsm.body_remaining {
            if (size as u64) > remaining {
                return self.stream_error(
                    stream_id,
                    ErrorCode::Protocol,
                    "DATA exceeds the response content-length.",
                );
            }
            let remaining = remaining - size as u64;
            if fin.is_fin() && remaining > 0 {
                return self.stream_error(
                    stream_id,
                    ErrorCode::Protocol,
                    "The stream ended before content-length was reached.",
                );
            }
            fsm.body_remaining = Some(remaining);
        }
        if fin.is_fin() {
            fsm.remote = HalfState::HalfClosed;
            self.collect(stream_id);
        }
        FrameResult::Event(Event::Data {
            stream_id,
            fin,
            payload,
        })
    }

    /// Record a stream error, forgetting the stream. The engine sends the
    /// RST_STREAM and reports to the application.
    fn stream_error(
        &mut self,
        stream_id: u32,
        reason: ErrorCode,
        text: &'static str,
    ) -> FrameResult {
        self.streams.remove(&stream_id);
        FrameResult::Error(ProtoError::Stream {
            stream_id,
            reason,
            text,
        })
    }

    /// Drop a stream once both directions are terminal and nothing is
    /// parked behind flow control.
    fn collect(&mut self, stream_id: u32) {
        if self
            .streams
            .get(&stream_id)
            .is_some_and(StreamFsm::is_finished)
        {
            self.streams.remove(&stream_id);
        }
    }

    // ── Outbound ───────────────────────────────────────────────────────

    /// Allocate the next client-initiated stream id.
    pub fn init_stream(&mut self, method: &str) -> u32 {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        self.streams.insert(
            stream_id,
            StreamFsm::new(
                method.to_owned(),
                i64::from(self.local_settings.initial_window_size),
                i64::from(self.remote_settings.initial_window_size),
            ),
        );
        stream_id
    }

    /// HPACK-encode the request head. Returns the END_STREAM bit the engine
    /// must set on the HEADERS frame, and the header block.
    pub fn prepare_headers(
        &mut self,
        stream_id: u32,
        fin: Fin,
        pseudo: &RequestPseudo,
        headers: &[HeaderField],
    ) -> (Fin, Vec<u8>) {
        let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(4 + headers.len());
        fields.push((b":method".as_slice(), pseudo.method.as_bytes()));
        fields.push((b":scheme".as_slice(), pseudo.scheme.as_bytes()));
        fields.push((b":authority".as_slice(), pseudo.authority.as_bytes()));
        fields.push((b":path".as_slice(), pseudo.path.as_bytes()));
        for field in headers {
            fields.push((&field.name, &field.value));
        }
        let block = self.encoder.encode(fields);
        if let Some(fsm) = self.streams.get_mut(&stream_id) {
            fsm.local = if fin.is_fin() {
                HalfState::HalfClosed
            } else {
                HalfState::Open
            };
        }
        (fin, block)
    }

    /// HPACK-encode trailers. The stream half-closes locally: the engine
    /// sends the returned block with END_STREAM set.
    pub fn prepare_trailers(&mut self, stream_id: u32, trailers: &[HeaderField]) -> Vec<u8> {
        let fields: Vec<(&[u8], &[u8])> = trailers
            .iter()
            .map(|field| (field.name.as_slice(), field.value.as_slice()))
            .collect();
        let block = self.encoder.encode(fields);
        if let Some(fsm) = self.streams.get_mut(&stream_id) {
            fsm.local = HalfState::HalfClosed;
        }
        self.collect(stream_id);
        block
    }

    /// Send body data within the current flow control allowance, parking
    /// whatever does not fit inside the machine.
    pub fn send_or_queue_data(&mut self, stream_id: u32, fin: Fin, payload: Vec<u8>) -> DataResult {
        let Some(fsm) = self.streams.get_mut(&stream_id) else {
            return DataResult::Queued;
        };
        fsm.parked.push_back(Parked {
            fin,
            payload,
            offset: 0,
        });
        match self.release_stream(stream_id) {
            Some(out) => DataResult::Send(vec![out]),
            None => DataResult::Queued,
        }
    }

    /// Credit the connection receive window after the engine emitted a
    /// connection WINDOW_UPDATE.
    pub fn update_connection_window(&mut self, credit: u32) {
        let _ = self.conn_recv_window.credit(credit);
    }

    /// Credit a stream receive window after the engine emitted a stream
    /// WINDOW_UPDATE.
    pub fn update_stream_window(&mut self, stream_id: u32, credit: u32) {
        if let Some(fsm) = self.streams.get_mut(&stream_id) {
            let _ = fsm.recv_window.credit(credit);
        }
    }

    /// Locally reset a stream. The engine sends the RST_STREAM frame.
    pub fn reset_stream(&mut self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    /// Emit as much parked data as the windows allow for one stream.
    fn release_stream(&mut self, stream_id: u32) -> Option<SendOut> {
        let max_frame = self.remote_settings.max_frame_size as usize;
        let fsm = self.streams.get_mut(&stream_id)?;
        let mut frames = Vec::new();
        let mut fin_sent = false;
        loop {
            let Some(parked) = fsm.parked.front_mut() else {
                break;
            };
            let remaining = parked.payload.len() - parked.offset;
            if remaining == 0 {
                // Zero-length DATA has no flow control cost.
                let fin = parked.fin.is_fin();
                frames.push(Frame::Data {
                    stream_id,
                    payload: Vec::new(),
                    end_stream: fin,
                });
                fin_sent |= fin;
                fsm.parked.pop_front();
                continue;
            }
            let window = self
                .conn_send_window
                .available()
                .min(fsm.send_window.available());
            if window == 0 {
                break;
            }
            let take = remaining.min(window).min(max_frame);
            let end = parked.offset + take;
            let chunk = parked.payload[parked.offset..end].to_vec();
            parked.offset = end;
            self.conn_send_window.consume(take);
            fsm.send_window.consume(take);
            let last = end == parked.payload.len();
            let fin = last && parked.fin.is_fin();
            frames.push(Frame::Data {
                stream_id,
                payload: chunk,
                end_stream: fin,
            });
            fin_sent |= fin;
            if last {
                fsm.parked.pop_front();
            }
        }
        if fin_sent {
            fsm.local = HalfState::HalfClosed;
        }
        self.collect(stream_id);
        if frames.is_empty() {
            None
        } else {
            Some(SendOut {
                stream_id,
                fin: if fin_sent { Fin::Fin } else { Fin::NoFin },
                frames,
            })
        }
    }

    /// Release parked data across all streams, lowest id first.
    fn release_all(&mut self) -> Vec<SendOut> {
        let blocked: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, fsm)| !fsm.parked.is_empty())
            .map(|(id, _)| *id)
            .collect();
        let mut released = Vec::new();
        for stream_id in blocked {
            if self.conn_send_window.available() == 0 {
                break;
            }
            if let Some(out) = self.release_stream(stream_id) {
                released.push(out);
            }
        }
        released
    }
}

fn content_length(headers: &[HeaderField]) -> Option<u64> {
    headers
        .iter()
        .find(|field| field.name_is(b"content-length"))
        .and_then(|field| std::str::from_utf8(&field.value).ok())
        .and_then(|value| value.parse().ok())
}

/// Split response pseudo-headers from regular fields. Only `:status` is
/// legal in a response, pseudo-headers must precede regular fields, and
/// `:status` must be a valid code.
fn split_response_pseudo(
    fields: &[HeaderField],
) -> Result<(Option<u16>, Vec<HeaderField>), &'static str> {
    let mut status = None;
    let mut headers = Vec::with_capacity(fields.len());
    for field in fields {
        if field.name.starts_with(b":") {
            if !headers.is_empty() {
                return Err("Pseudo-headers must precede regular headers.");
            }
            if field.name != b":status" {
                return Err("Invalid pseudo-header in a response.");
            }
            if status.is_some() {
                return Err("Duplicate :status pseudo-header.");
            }
            let parsed = std::str::from_utf8(&field.value)
                .ok()
                .filter(|value| value.len() == 3)
                .and_then(|value| value.parse::<u16>().ok());
            match parsed {
                Some(code) => status = Some(code),
                None => return Err("The :status pseudo-header is invalid."),
            }
        } else {
            headers.push(field.clone());
        }
    }
    Ok((status, headers))
}

/// Split request pseudo-headers out of a promised request's fields.
fn split_request_pseudo(
    fields: &[HeaderField],
) -> Result<(RequestPseudo, Vec<HeaderField>), &'static str> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = Vec::with_capacity(fields.len());
    for field in fields {
        if field.name.starts_with(b":") {
            if !headers.is_empty() {
                return Err("Pseudo-headers must precede regular headers.");
            }
            let value = match std::str::from_utf8(&field.value) {
                Ok(value) => value.to_owned(),
                Err(_) => return Err("Invalid pseudo-header value."),
            };
            let slot = match field.name.as_slice() {
                b":method" => &mut method,
                b":scheme" => &mut scheme,
                b":authority" => &mut authority,
                b":path" => &mut path,
                _ => return Err("Invalid pseudo-header in a promised request."),
            };
            if slot.is_some() {
                return Err("Duplicate pseudo-header in a promised request.");
            }
            *slot = Some(value);
        } else {
            headers.push(field.clone());
        }
    }
    match (method, scheme, authority, path) {
        (Some(method), Some(scheme), Some(authority), Some(path)) => Ok((
            RequestPseudo {
                method,
                scheme,
                authority,
                path,
            },
            headers,
        )),
        _ => Err("A promised request is missing pseudo-headers."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_settings() -> Frame {
        Frame::Settings {
            ack: false,
            settings: Settings::default(),
        }
    }

    fn connected_machine() -> Machine {
        let (_, mut machine) = Machine::new(Settings::client_default());
        assert_eq!(machine.frame(server_settings()), FrameResult::Consumed);
        machine
    }

    fn response_block(encoder: &mut Encoder<'static>, status: &str) -> Vec<u8> {
        encoder.encode(vec![(b":status".as_slice(), status.as_bytes())])
    }

    #[test]
    fn preface_starts_with_magic_and_settings() {
        let (preface, _) = Machine::new(Settings::client_default());
        assert!(preface.starts_with(CLIENT_PREFACE));
        let rest = &preface[CLIENT_PREFACE.len()..];
        match crate::frame::parse(rest, 16_384) {
            crate::frame::Parsed::Frame {
                frame: Frame::Settings { ack: false, .. },
                ..
            } => {}
            other => panic!("expected SETTINGS after the magic, got {other:?}"),
        }
    }

    #[test]
    fn first_frame_must_be_settings() {
        let (_, mut machine) = Machine::new(Settings::client_default());
        let result = machine.frame(Frame::Ping {
            ack: false,
            payload: [0; 8],
        });
        assert!(matches!(
            result,
            FrameResult::Error(ProtoError::Connection { .. })
        ));
    }

    #[test]
    fn stream_ids_are_odd_and_increasing() {
        let mut machine = connected_machine();
        assert_eq!(machine.init_stream("GET"), 1);
        assert_eq!(machine.init_stream("GET"), 3);
        assert_eq!(machine.init_stream("POST"), 5);
    }

    #[test]
    fn response_headers_event() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        let (fin, _block) = machine.prepare_headers(stream_id, Fin::Fin, &pseudo, &[]);
        assert_eq!(fin, Fin::Fin);
        assert_eq!(machine.stream_local_state(stream_id), Some(HalfState::HalfClosed));
        assert_eq!(machine.stream_remote_state(stream_id), Some(HalfState::Idle));

        let mut encoder = Encoder::new();
        let block = response_block(&mut encoder, "200");
        let result = machine.frame(Frame::Headers {
            stream_id,
            fragment: block,
            end_stream: false,
            end_headers: true,
        });
        match result {
            FrameResult::Event(Event::Headers {
                stream_id: id,
                fin,
                status,
                ..
            }) => {
                assert_eq!(id, stream_id);
                assert_eq!(fin, Fin::NoFin);
                assert_eq!(status, 200);
            }
            other => panic!("expected a headers event, got {other:?}"),
        }
        assert_eq!(machine.stream_remote_state(stream_id), Some(HalfState::Open));
    }

    #[test]
    fn informational_then_final_response() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("PUT");
        let pseudo = RequestPseudo {
            method: "PUT".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::NoFin, &pseudo, &[]);

        let mut encoder = Encoder::new();
        let block = response_block(&mut encoder, "100");
        match machine.frame(Frame::Headers {
            stream_id,
            fragment: block,
            end_stream: false,
            end_headers: true,
        }) {
            FrameResult::Event(Event::Headers { status: 100, .. }) => {}
            other => panic!("expected a 100 event, got {other:?}"),
        }

        let block = response_block(&mut encoder, "204");
        match machine.frame(Frame::Headers {
            stream_id,
            fragment: block,
            end_stream: true,
            end_headers: true,
        }) {
            FrameResult::Event(Event::Headers {
                status: 204,
                fin: Fin::Fin,
                ..
            }) => {}
            other => panic!("expected a 204 event, got {other:?}"),
        }
    }

    #[test]
    fn informational_with_end_stream_is_a_stream_error() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::Fin, &pseudo, &[]);
        let mut encoder = Encoder::new();
        let block = response_block(&mut encoder, "100");
        let result = machine.frame(Frame::Headers {
            stream_id,
            fragment: block,
            end_stream: true,
            end_headers: true,
        });
        assert!(matches!(
            result,
            FrameResult::Error(ProtoError::Stream { .. })
        ));
    }

    #[test]
    fn trailers_event_after_final_response() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::Fin, &pseudo, &[]);
        let mut encoder = Encoder::new();
        let block = response_block(&mut encoder, "200");
        machine.frame(Frame::Headers {
            stream_id,
            fragment: block,
            end_stream: false,
            end_headers: true,
        });
        let trailer_block =
            encoder.encode(vec![(b"grpc-status".as_slice(), b"0".as_slice())]);
        match machine.frame(Frame::Headers {
            stream_id,
            fragment: trailer_block,
            end_stream: true,
            end_headers: true,
        }) {
            FrameResult::Event(Event::Trailers { headers, .. }) => {
                assert_eq!(headers[0].name, b"grpc-status");
            }
            other => panic!("expected a trailers event, got {other:?}"),
        }
    }

    #[test]
    fn continuation_aggregates_header_fragments() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::NoFin, &pseudo, &[]);
        let mut encoder = Encoder::new();
        let block = response_block(&mut encoder, "200");
        let (first, rest) = block.split_at(1);
        assert_eq!(
            machine.frame(Frame::Headers {
                stream_id,
                fragment: first.to_vec(),
                end_stream: false,
                end_headers: false,
            }),
            FrameResult::Consumed
        );
        match machine.frame(Frame::Continuation {
            stream_id,
            fragment: rest.to_vec(),
            end_headers: true,
        }) {
            FrameResult::Event(Event::Headers { status: 200, .. }) => {}
            other => panic!("expected a headers event, got {other:?}"),
        }
    }

    #[test]
    fn interleaved_frame_during_continuation_is_fatal() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::NoFin, &pseudo, &[]);
        machine.frame(Frame::Headers {
            stream_id,
            fragment: vec![0x88],
            end_stream: false,
            end_headers: false,
        });
        let result = machine.frame(Frame::Ping {
            ack: false,
            payload: [0; 8],
        });
        assert!(matches!(
            result,
            FrameResult::Error(ProtoError::Connection { .. })
        ));
    }

    #[test]
    fn data_before_headers_is_fatal() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::Fin, &pseudo, &[]);
        let result = machine.frame(Frame::Data {
            stream_id,
            payload: b"x".to_vec(),
            end_stream: false,
        });
        assert!(matches!(
            result,
            FrameResult::Error(ProtoError::Connection { .. })
        ));
    }

    #[test]
    fn content_length_mismatch_is_a_stream_error() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::Fin, &pseudo, &[]);
        let mut encoder = Encoder::new();
        let block = encoder.encode(vec![
            (b":status".as_slice(), b"200".as_slice()),
            (b"content-length".as_slice(), b"10".as_slice()),
        ]);
        machine.frame(Frame::Headers {
            stream_id,
            fragment: block,
            end_stream: false,
            end_headers: true,
        });
        let result = machine.frame(Frame::Data {
            stream_id,
            payload: b"short".to_vec(),
            end_stream: true,
        });
        assert!(matches!(
            result,
            FrameResult::Error(ProtoError::Stream { .. })
        ));
    }

    #[test]
    fn flow_control_parks_and_releases_data() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("POST");
        let pseudo = RequestPseudo {
            method: "POST".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/upload".into(),
        };
        machine.prepare_headers(stream_id, Fin::NoFin, &pseudo, &[]);

        // 100_000 bytes against 65_535 of window: a partial send.
        let payload = vec![0u8; 100_000];
        let sent = match machine.send_or_queue_data(stream_id, Fin::Fin, payload) {
            DataResult::Send(outs) => outs,
            DataResult::Queued => panic!("expected a partial send"),
        };
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].fin, Fin::NoFin);
        let sent_bytes: usize = sent[0]
            .frames
            .iter()
            .map(|frame| match frame {
                Frame::Data { payload, .. } => payload.len(),
                other => panic!("expected DATA, got {other:?}"),
            })
            .sum();
        assert_eq!(sent_bytes, 65_535);
        assert_eq!(machine.stream_local_state(stream_id), Some(HalfState::Open));

        // Crediting only the stream window releases nothing: the
        // connection window is exhausted too.
        assert_eq!(
            machine.frame(Frame::WindowUpdate {
                stream_id,
                increment: 65_535,
            }),
            FrameResult::Consumed
        );

        // Crediting the connection window releases the rest with fin.
        let released = match machine.frame(Frame::WindowUpdate {
            stream_id: 0,
            increment: 65_535,
        }) {
            FrameResult::Send(outs) => outs,
            other => panic!("expected released data, got {other:?}"),
        };
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].fin, Fin::Fin);
        let released_bytes: usize = released[0]
            .frames
            .iter()
            .map(|frame| match frame {
                Frame::Data { payload, .. } => payload.len(),
                other => panic!("expected DATA, got {other:?}"),
            })
            .sum();
        assert_eq!(released_bytes, 100_000 - 65_535);
        match released[0].frames.last() {
            Some(Frame::Data { end_stream, .. }) => assert!(end_stream),
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn data_frames_respect_max_frame_size() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("POST");
        let pseudo = RequestPseudo {
            method: "POST".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::NoFin, &pseudo, &[]);
        let sent = match machine.send_or_queue_data(stream_id, Fin::Fin, vec![0u8; 40_000]) {
            DataResult::Send(outs) => outs,
            DataResult::Queued => panic!("expected a send"),
        };
        for frame in &sent[0].frames {
            match frame {
                Frame::Data { payload, .. } => assert!(payload.len() <= 16_384),
                other => panic!("expected DATA, got {other:?}"),
            }
        }
        assert_eq!(sent[0].fin, Fin::Fin);
    }

    #[test]
    fn empty_fin_data_is_always_sendable() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("POST");
        let pseudo = RequestPseudo {
            method: "POST".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::NoFin, &pseudo, &[]);
        // Exhaust both windows.
        match machine.send_or_queue_data(stream_id, Fin::NoFin, vec![0u8; 65_535]) {
            DataResult::Send(_) => {}
            DataResult::Queued => panic!("expected a send"),
        }
        let sent = match machine.send_or_queue_data(stream_id, Fin::Fin, Vec::new()) {
            DataResult::Send(outs) => outs,
            DataResult::Queued => panic!("zero-length fin must not be parked"),
        };
        assert_eq!(sent[0].fin, Fin::Fin);
        assert_eq!(machine.stream_local_state(stream_id), Some(HalfState::HalfClosed));
    }

    #[test]
    fn push_promise_reserves_a_remote_stream() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::Fin, &pseudo, &[]);
        let mut encoder = Encoder::new();
        let block = encoder.encode(vec![
            (b":method".as_slice(), b"GET".as_slice()),
            (b":scheme".as_slice(), b"https".as_slice()),
            (b":authority".as_slice(), b"example.com".as_slice()),
            (b":path".as_slice(), b"/a.css".as_slice()),
        ]);
        match machine.frame(Frame::PushPromise {
            stream_id,
            promised_id: 2,
            fragment: block,
            end_headers: true,
        }) {
            FrameResult::Event(Event::PushPromise {
                promised_id,
                pseudo,
                ..
            }) => {
                assert_eq!(promised_id, 2);
                assert_eq!(pseudo.uri(), "https://example.com/a.css");
            }
            other => panic!("expected a push event, got {other:?}"),
        }
        assert_eq!(machine.last_remote_stream_id(), 2);
        assert_eq!(machine.stream_local_state(2), Some(HalfState::HalfClosed));
        assert_eq!(machine.stream_remote_state(2), Some(HalfState::Idle));
    }

    #[test]
    fn push_promise_with_odd_id_is_fatal() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::Fin, &pseudo, &[]);
        let result = machine.frame(Frame::PushPromise {
            stream_id,
            promised_id: 7,
            fragment: vec![0x82],
            end_headers: true,
        });
        assert!(matches!(
            result,
            FrameResult::Error(ProtoError::Connection { .. })
        ));
    }

    #[test]
    fn goaway_event_passthrough() {
        let mut machine = connected_machine();
        match machine.frame(Frame::GoAway {
            last_stream_id: 3,
            error_code: ErrorCode::NoError,
            debug_data: Vec::new(),
        }) {
            FrameResult::Event(Event::GoAway {
                last_stream_id: 3,
                reason: ErrorCode::NoError,
                ..
            }) => {}
            other => panic!("expected a goaway event, got {other:?}"),
        }
    }

    #[test]
    fn late_frames_on_finished_streams_are_dropped() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("GET");
        let pseudo = RequestPseudo {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::Fin, &pseudo, &[]);
        machine.reset_stream(stream_id);
        let result = machine.frame(Frame::Data {
            stream_id,
            payload: b"late".to_vec(),
            end_stream: true,
        });
        assert_eq!(result, FrameResult::Consumed);
    }

    #[test]
    fn frames_on_never_opened_streams_are_fatal() {
        let mut machine = connected_machine();
        let result = machine.frame(Frame::Data {
            stream_id: 99,
            payload: b"x".to_vec(),
            end_stream: false,
        });
        assert!(matches!(
            result,
            FrameResult::Error(ProtoError::Connection { .. })
        ));
    }

    #[test]
    fn settings_delta_adjusts_open_stream_send_windows() {
        let mut machine = connected_machine();
        let stream_id = machine.init_stream("POST");
        let pseudo = RequestPseudo {
            method: "POST".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/".into(),
        };
        machine.prepare_headers(stream_id, Fin::NoFin, &pseudo, &[]);
        // Shrink the initial window to 100: parked data beyond it stays put.
        let small = Settings {
            initial_window_size: 100,
            ..Settings::default()
        };
        assert_eq!(
            machine.frame(Frame::Settings {
                ack: false,
                settings: small,
            }),
            FrameResult::Consumed
        );
        let sent = match machine.send_or_queue_data(stream_id, Fin::Fin, vec![0u8; 500]) {
            DataResult::Send(outs) => outs,
            DataResult::Queued => panic!("expected a partial send"),
        };
        let sent_bytes: usize = sent[0]
            .frames
            .iter()
            .map(|frame| match frame {
                Frame::Data { payload, .. } => payload.len(),
                other => panic!("expected DATA, got {other:?}"),
            })
            .sum();
        assert_eq!(sent_bytes, 100);
    }
}
