//! The HTTP/2 connection engine.
//!
//! `Engine` is the stateful shell around the sans-IO machine: it owns the
//! transport, the protocol machine, and the stream table. The coordinator
//! feeds it inbound byte chunks and application commands; the engine
//! advances the machine, writes frames to the transport, delivers messages
//! to each stream's reply target, and reports to the instrumentation
//! handler threaded through every entry point.
//!
//! The engine is a single-threaded cooperative actor: nothing here locks,
//! and no two operations on one engine may run concurrently. Parallelism
//! lives one level up, across connections.

use bytes::{Bytes, BytesMut};
use wireline_h2::frame::{self, Frame, Parsed};
use wireline_h2::machine::{DataResult, Event, FrameResult, Machine, SendOut};
use wireline_h2::{ErrorCode, Fin, HalfState, HeaderField, ProtoError, RequestPseudo};

use crate::config::Http2Options;
use crate::error::{EngineError, ErrorCause};
use crate::event::{
    EventHandler, RequestHeaders, RequestStart, ResponseHeaders, ResponseStart, ResponseTrailers,
    StreamEnd, Terminate,
};
use crate::message::{OwnerMessage, ReplyTo, StreamMessage, StreamRef};
use crate::streams::{Stream, StreamTable};
use crate::transport::Transport;

/// Headers that only make sense hop-by-hop; never forwarded on HTTP/2.
const STRIPPED_HEADERS: &[&[u8]] = &[
    b"host",
    b"connection",
    b"keep-alive",
    b"proxy-connection",
    b"transfer-encoding",
    b"upgrade",
];

/// What the coordinator should do with the connection after an engine
/// call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Keep feeding the engine.
    Continue,
    /// Tear down the transport; the engine is done.
    Close,
}

/// Introspection result for one stream.
#[derive(Debug)]
pub struct StreamInfo {
    pub stream_ref: StreamRef,
    pub reply_to: ReplyTo,
    pub running: bool,
}

/// Protocol acks owed to the peer once the machine accepts a frame.
enum Ack {
    Settings,
    Ping([u8; 8]),
}

/// A single HTTP/2 connection engine.
pub struct Engine<T: Transport> {
    owner: ReplyTo<OwnerMessage>,
    transport: T,
    opts: Http2Options,
    /// Residual unparsed bytes carried between inbound chunks.
    buffer: BytesMut,
    machine: Machine,
    streams: StreamTable,
    /// Refs that were still live when the engine went down.
    down: Vec<StreamRef>,
}

impl<T: Transport> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("opts", &self.opts)
            .field("streams", &self.streams)
            .field("down", &self.down)
            .finish()
    }
}

impl<T: Transport> Engine<T> {
    /// Create the engine over a connected transport and emit the
    /// connection preface plus initial SETTINGS.
    pub fn new(
        owner: ReplyTo<OwnerMessage>,
        mut transport: T,
        opts: Http2Options,
    ) -> Result<Self, EngineError> {
        opts.validate()?;
        let (preface, machine) = Machine::new(wireline_h2::Settings::client_default());
        transport.send(&preface)?;
        Ok(Self {
            owner,
            transport,
            opts,
            buffer: BytesMut::new(),
            machine,
            streams: StreamTable::new(),
            down: Vec::new(),
        })
    }

    pub fn opts(&self) -> &Http2Options {
        &self.opts
    }

    // ── Ingress ────────────────────────────────────────────────────────

    /// Feed a chunk of transport bytes. Parsing is chunking-agnostic:
    /// any split of the inbound byte stream produces the same events.
    pub fn handle<E: EventHandler>(
        &mut self,
        data: &[u8],
        events: &mut E,
    ) -> Result<Control, EngineError> {
        self.buffer.extend_from_slice(data);
        loop {
            let max_frame_size = self.machine.local_settings().max_frame_size;
            match frame::parse(&self.buffer, max_frame_size) {
                Parsed::More => return Ok(Control::Continue),
                Parsed::Ignored { consumed } => {
                    let _ = self.buffer.split_to(consumed);
                    if let Err(err) = self.machine.ignored_frame() {
                        return self.connection_error(err, events);
                    }
                }
                Parsed::StreamError {
                    stream_id,
                    reason,
                    text,
                    consumed,
                } => {
                    let _ = self.buffer.split_to(consumed);
                    // A discarded frame still interacts with CONTINUATION
                    // bookkeeping.
                    if let Err(err) = self.machine.ignored_frame() {
                        return self.connection_error(err, events);
                    }
                    self.machine.reset_stream(stream_id);
                    self.stream_error(stream_id, reason, text)?;
                }
                Parsed::ConnectionError { reason, text } => {
                    return self.connection_error(ProtoError::Connection { reason, text }, events);
                }
                Parsed::Frame { frame, consumed } => {
                    let _ = self.buffer.split_to(consumed);
                    if self.ingest(frame, events)? == Control::Close {
                        return Ok(Control::Close);
                    }
                }
            }
        }
    }

    fn ingest<E: EventHandler>(
        &mut self,
        frame: Frame,
        events: &mut E,
    ) -> Result<Control, EngineError> {
        // The very first HEADERS of a stream marks the server starting its
        // response; the handler hears about it before the machine moves.
        if let Frame::Headers { stream_id, .. } = &frame
            && self.machine.stream_remote_state(*stream_id) == Some(HalfState::Idle)
            && let Some(stream) = self.streams.by_id(*stream_id)
        {
            events.response_start(&ResponseStart {
                stream: stream.stream_ref,
            });
        }

        let ack = match &frame {
            Frame::Settings { ack: false, .. } => Some(Ack::Settings),
            Frame::Ping {
                ack: false,
                payload,
            } => Some(Ack::Ping(*payload)),
            _ => None,
        };

        let result = self.machine.frame(frame);
        if !matches!(result, FrameResult::Error(_))
            && let Some(ack) = ack
        {
            self.send_ack(ack)?;
        }
        match result {
            FrameResult::Consumed => Ok(Control::Continue),
            FrameResult::Event(event) => self.dispatch(event, events),
            FrameResult::Send(released) => {
                self.write_released(released, events)?;
                Ok(Control::Continue)
            }
            FrameResult::Error(ProtoError::Stream {
                stream_id,
                reason,
                text,
            }) => {
                self.stream_error(stream_id, reason, text)?;
                Ok(Control::Continue)
            }
            FrameResult::Error(err @ ProtoError::Connection { .. }) => {
                self.connection_error(err, events)
            }
        }
    }

    fn dispatch<E: EventHandler>(
        &mut self,
        event: Event,
        events: &mut E,
    ) -> Result<Control, EngineError> {
        match event {
            Event::Data {
                stream_id,
                fin,
                payload,
            } => {
                let Some(stream) = self.streams.by_id_mut(stream_id) else {
                    return Ok(Control::Continue);
                };
                let stream_ref = stream.stream_ref;
                let reply_to = stream.reply_to.clone();
                let mut handler = stream.handler.take();
                let size = payload.len() as u32;
                let payload = Bytes::from(payload);
                match handler.as_mut() {
                    Some(handler) => handler.data(stream_ref, fin, payload, &reply_to),
                    None => reply_to.deliver(StreamMessage::Data {
                        stream: stream_ref,
                        fin,
                        payload,
                    }),
                }
                if size > 0 {
                    // Credit the connection for every frame, the stream
                    // only when more data may follow.
                    let mut buf = Vec::new();
                    Frame::WindowUpdate {
                        stream_id: 0,
                        increment: size,
                    }
                    .encode(&mut buf);
                    self.machine.update_connection_window(size);
                    if !fin.is_fin() {
                        Frame::WindowUpdate {
                            stream_id,
                            increment: size,
                        }
                        .encode(&mut buf);
                        self.machine.update_stream_window(stream_id, size);
                    }
                    self.transport.send(&buf)?;
                }
                if fin.is_fin() {
                    events.response_end(&StreamEnd { stream: stream_ref });
                    self.end_of_life(stream_id);
                } else if let Some(stream) = self.streams.by_id_mut(stream_id) {
                    stream.handler = handler;
                }
                Ok(Control::Continue)
            }
            Event::Headers {
                stream_id,
                fin,
                status,
                headers,
                body_len: _,
            } => {
                let Some(stream) = self.streams.by_id_mut(stream_id) else {
                    return Ok(Control::Continue);
                };
                let stream_ref = stream.stream_ref;
                let reply_to = stream.reply_to.clone();
                if status < 200 {
                    reply_to.deliver(StreamMessage::Inform {
                        stream: stream_ref,
                        status,
                        headers: headers.clone(),
                    });
                    events.response_inform(&ResponseHeaders {
                        stream: stream_ref,
                        status,
                        headers,
                    });
                    return Ok(Control::Continue);
                }
                reply_to.deliver(StreamMessage::Response {
                    stream: stream_ref,
                    fin,
                    status,
                    headers: headers.clone(),
                });
                events.response_headers(&ResponseHeaders {
                    stream: stream_ref,
                    status,
                    headers,
                });
                if fin.is_fin() {
                    events.response_end(&StreamEnd { stream: stream_ref });
                    self.end_of_life(stream_id);
                } else {
                    let handler = self.opts.content_handlers.build();
                    if let Some(stream) = self.streams.by_id_mut(stream_id) {
                        stream.handler = Some(handler);
                    }
                }
                Ok(Control::Continue)
            }
            Event::Trailers { stream_id, headers } => {
                let Some(stream) = self.streams.by_id_mut(stream_id) else {
                    return Ok(Control::Continue);
                };
                let stream_ref = stream.stream_ref;
                let reply_to = stream.reply_to.clone();
                stream.handler = None;
                reply_to.deliver(StreamMessage::Trailers {
                    stream: stream_ref,
                    headers: headers.clone(),
                });
                events.response_trailers(&ResponseTrailers {
                    stream: stream_ref,
                    headers,
                });
                events.response_end(&StreamEnd { stream: stream_ref });
                self.end_of_life(stream_id);
                Ok(Control::Continue)
            }
            Event::RstStream { stream_id, reason } => {
                tracing::debug!(stream_id, ?reason, "stream reset by the server");
                if let Some(stream) = self.streams.remove(stream_id) {
                    stream.reply_to.deliver(StreamMessage::Error {
                        stream: stream.stream_ref,
                        cause: ErrorCause::Stream {
                            reason,
                            text: "Stream reset by server.",
                        },
                    });
                }
                Ok(Control::Continue)
            }
            Event::PushPromise {
                stream_id,
                promised_id,
                pseudo,
                headers,
            } => {
                let Some(parent) = self.streams.by_id(stream_id) else {
                    // The parent is already gone; refuse the promise.
                    self.machine.reset_stream(promised_id);
                    let buf = Frame::RstStream {
                        stream_id: promised_id,
                        error_code: ErrorCode::Cancel,
                    }
                    .encode_to_vec();
                    self.transport.send(&buf)?;
                    return Ok(Control::Continue);
                };
                let parent_ref = parent.stream_ref;
                let reply_to = parent.reply_to.clone();
                let promised_ref = StreamRef::new();
                self.streams.insert(Stream {
                    id: promised_id,
                    stream_ref: promised_ref,
                    reply_to: reply_to.clone(),
                    handler: None,
                });
                reply_to.deliver(StreamMessage::Push {
                    parent: parent_ref,
                    promised: promised_ref,
                    method: pseudo.method.clone(),
                    uri: pseudo.uri(),
                    headers,
                });
                Ok(Control::Continue)
            }
            Event::GoAway {
                last_stream_id,
                reason,
                ..
            } => {
                tracing::debug!(last_stream_id, ?reason, "server is going away");
                self.terminate(ErrorCause::GoingAway, events)
            }
        }
    }

    // ── Egress ─────────────────────────────────────────────────────────

    /// Open a stream and send the request head; the body follows through
    /// [`Engine::data`].
    pub fn headers<E: EventHandler>(
        &mut self,
        stream_ref: StreamRef,
        reply_to: ReplyTo,
        method: &str,
        host: &str,
        port: u16,
        path: &str,
        headers: Vec<HeaderField>,
        events: &mut E,
    ) -> Result<(), EngineError> {
        self.begin_stream(
            stream_ref, reply_to, method, host, port, path, headers, events,
        )?;
        Ok(())
    }

    /// Send a complete request: head plus body, with `content-length`
    /// filled in unless the caller already set one.
    pub fn request<E: EventHandler>(
        &mut self,
        stream_ref: StreamRef,
        reply_to: ReplyTo,
        method: &str,
        host: &str,
        port: u16,
        path: &str,
        mut headers: Vec<HeaderField>,
        body: &[u8],
        events: &mut E,
    ) -> Result<(), EngineError> {
        if !headers.iter().any(|h| h.name_is(b"content-length")) {
            headers.push(HeaderField::new("content-length", body.len().to_string()));
        }
        let stream_id = self.begin_stream(
            stream_ref, reply_to, method, host, port, path, headers, events,
        )?;
        match self.machine.send_or_queue_data(stream_id, Fin::Fin, body.to_vec()) {
            DataResult::Queued => Ok(()),
            DataResult::Send(released) => self.write_released(released, events),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn begin_stream<E: EventHandler>(
        &mut self,
        stream_ref: StreamRef,
        reply_to: ReplyTo,
        method: &str,
        host: &str,
        port: u16,
        path: &str,
        headers: Vec<HeaderField>,
        events: &mut E,
    ) -> Result<u32, EngineError> {
        let scheme = self.transport.kind().scheme();
        let authority = request_authority(&headers, host, port, scheme);
        let headers = strip_headers(headers);
        let pseudo = RequestPseudo {
            method: method.to_owned(),
            scheme: scheme.to_owned(),
            authority,
            path: path.to_owned(),
        };
        let stream_id = self.machine.init_stream(method);
        events.request_start(&RequestStart {
            stream: stream_ref,
            method: pseudo.method.clone(),
            authority: pseudo.authority.clone(),
            path: pseudo.path.clone(),
        });
        let (fin, fragment) = self
            .machine
            .prepare_headers(stream_id, Fin::NoFin, &pseudo, &headers);
        let buf = Frame::Headers {
            stream_id,
            fragment,
            end_stream: fin.is_fin(),
            end_headers: true,
        }
        .encode_to_vec();
        self.transport.send(&buf)?;
        events.request_headers(&RequestHeaders {
            stream: stream_ref,
            method: pseudo.method,
            authority: pseudo.authority,
            path: pseudo.path,
            headers,
        });
        self.streams.insert(Stream {
            id: stream_id,
            stream_ref,
            reply_to,
            handler: None,
        });
        Ok(stream_id)
    }

    /// Send request body data on an open stream.
    pub fn data<E: EventHandler>(
        &mut self,
        stream_ref: StreamRef,
        reply_to: &ReplyTo,
        fin: Fin,
        payload: &[u8],
        events: &mut E,
    ) -> Result<(), EngineError> {
        let Some(stream) = self.streams.by_ref(stream_ref) else {
            reply_to.deliver(StreamMessage::Error {
                stream: stream_ref,
                cause: ErrorCause::BadState("The stream cannot be found."),
            });
            return Ok(());
        };
        let stream_id = stream.id;
        let open = |state: Option<HalfState>| {
            matches!(state, Some(HalfState::Idle | HalfState::Open))
        };
        if !open(self.machine.stream_local_state(stream_id))
            || !open(self.machine.stream_remote_state(stream_id))
        {
            reply_to.deliver(StreamMessage::Error {
                stream: stream_ref,
                cause: ErrorCause::BadState("The stream has already been closed."),
            });
            return Ok(());
        }
        match self
            .machine
            .send_or_queue_data(stream_id, fin, payload.to_vec())
        {
            DataResult::Queued => Ok(()),
            DataResult::Send(released) => self.write_released(released, events),
        }
    }

    /// Send trailing headers, ending the request body.
    pub fn trailers<E: EventHandler>(
        &mut self,
        stream_ref: StreamRef,
        reply_to: &ReplyTo,
        trailers: Vec<HeaderField>,
        events: &mut E,
    ) -> Result<(), EngineError> {
        let Some(stream) = self.streams.by_ref(stream_ref) else {
            reply_to.deliver(StreamMessage::Error {
                stream: stream_ref,
                cause: ErrorCause::BadState("The stream cannot be found."),
            });
            return Ok(());
        };
        let stream_id = stream.id;
        if self.machine.stream_local_state(stream_id) != Some(HalfState::Open) {
            reply_to.deliver(StreamMessage::Error {
                stream: stream_ref,
                cause: ErrorCause::BadState("The stream has already been closed."),
            });
            return Ok(());
        }
        let fragment = self.machine.prepare_trailers(stream_id, &trailers);
        let buf = Frame::Headers {
            stream_id,
            fragment,
            end_stream: true,
            end_headers: true,
        }
        .encode_to_vec();
        self.transport.send(&buf)?;
        events.request_end(&StreamEnd { stream: stream_ref });
        self.end_of_life(stream_id);
        Ok(())
    }

    /// Abort a stream. Idempotent: an unknown ref reports `BadState` to the
    /// caller and nothing else happens. After this, no further message or
    /// event mentions the ref.
    pub fn cancel(
        &mut self,
        stream_ref: StreamRef,
        reply_to: &ReplyTo,
    ) -> Result<(), EngineError> {
        let Some(stream) = self.streams.by_ref(stream_ref) else {
            reply_to.deliver(StreamMessage::Error {
                stream: stream_ref,
                cause: ErrorCause::BadState("The stream cannot be found."),
            });
            return Ok(());
        };
        let stream_id = stream.id;
        tracing::debug!(stream_id, "cancelling stream");
        self.machine.reset_stream(stream_id);
        let buf = Frame::RstStream {
            stream_id,
            error_code: ErrorCode::Cancel,
        }
        .encode_to_vec();
        self.transport.send(&buf)?;
        self.streams.remove(stream_id);
        Ok(())
    }

    /// Probe connection liveness with a PING.
    pub fn keepalive(&mut self) -> Result<(), EngineError> {
        tracing::trace!("keepalive ping");
        let buf = Frame::Ping {
            ack: false,
            payload: [0; 8],
        }
        .encode_to_vec();
        self.transport.send(&buf)?;
        Ok(())
    }

    // ── Shutdown ───────────────────────────────────────────────────────

    /// The transport is gone: fail every live stream with a `Closed`
    /// cause, in stream table order.
    pub fn close<E: EventHandler>(&mut self, events: &mut E) {
        let refs = self.fail_all(ErrorCause::Closed);
        events.disconnect();
        self.owner.deliver(OwnerMessage::Down {
            cause: ErrorCause::Closed,
            streams: refs.clone(),
        });
        self.down = refs;
    }

    /// Stop the connection: send GOAWAY, fail every live stream with
    /// `cause`, and tell the coordinator to drop the transport.
    pub fn terminate<E: EventHandler>(
        &mut self,
        cause: ErrorCause,
        events: &mut E,
    ) -> Result<Control, EngineError> {
        let reason = match &cause {
            ErrorCause::Connection { reason, .. } => *reason,
            _ => ErrorCode::NoError,
        };
        tracing::debug!(?reason, "terminating connection");
        let buf = Frame::GoAway {
            last_stream_id: self.machine.last_remote_stream_id(),
            error_code: reason,
            debug_data: Vec::new(),
        }
        .encode_to_vec();
        // The streams must hear about the shutdown even when the transport
        // already refuses writes.
        let _ = self.transport.send(&buf);
        let refs = self.fail_all(cause.clone());
        events.terminate(&Terminate { reason });
        self.owner.deliver(OwnerMessage::Down {
            cause,
            streams: refs.clone(),
        });
        self.down = refs;
        Ok(Control::Close)
    }

    fn connection_error<E: EventHandler>(
        &mut self,
        err: ProtoError,
        events: &mut E,
    ) -> Result<Control, EngineError> {
        let cause = match err {
            ProtoError::Connection { reason, text } | ProtoError::Stream { reason, text, .. } => {
                ErrorCause::Connection { reason, text }
            }
        };
        self.terminate(cause, events)
    }

    fn stream_error(
        &mut self,
        stream_id: u32,
        reason: ErrorCode,
        text: &'static str,
    ) -> Result<(), EngineError> {
        tracing::debug!(stream_id, ?reason, text, "stream error");
        let buf = Frame::RstStream {
            stream_id,
            error_code: reason,
        }
        .encode_to_vec();
        self.transport.send(&buf)?;
        if let Some(stream) = self.streams.remove(stream_id) {
            stream.reply_to.deliver(StreamMessage::Error {
                stream: stream.stream_ref,
                cause: ErrorCause::Stream { reason, text },
            });
        }
        Ok(())
    }

    /// Fail every live stream in table order, exactly once each.
    fn fail_all(&mut self, cause: ErrorCause) -> Vec<StreamRef> {
        let mut refs = Vec::with_capacity(self.streams.len());
        for stream in self.streams.drain() {
            refs.push(stream.stream_ref);
            stream.reply_to.deliver(StreamMessage::Error {
                stream: stream.stream_ref,
                cause: cause.clone(),
            });
        }
        refs
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn send_ack(&mut self, ack: Ack) -> Result<(), EngineError> {
        let frame = match ack {
            Ack::Settings => Frame::Settings {
                ack: true,
                settings: wireline_h2::Settings::default(),
            },
            Ack::Ping(payload) => Frame::Ping { ack: true, payload },
        };
        self.transport.send(&frame.encode_to_vec())?;
        Ok(())
    }

    /// Serialize DATA runs the machine released, raising `request_end`
    /// for streams whose local side just finished.
    fn write_released<E: EventHandler>(
        &mut self,
        released: Vec<SendOut>,
        events: &mut E,
    ) -> Result<(), EngineError> {
        let mut buf = Vec::new();
        for out in &released {
            for frame in &out.frames {
                frame.encode(&mut buf);
            }
        }
        self.transport.send(&buf)?;
        for out in released {
            if out.fin.is_fin() {
                if let Some(stream) = self.streams.by_id(out.stream_id) {
                    events.request_end(&StreamEnd {
                        stream: stream.stream_ref,
                    });
                }
                self.end_of_life(out.stream_id);
            }
        }
        Ok(())
    }

    /// Drop a stream from the table once both directions are done. Runs
    /// strictly after the terminal messages and events went out.
    fn end_of_life(&mut self, stream_id: u32) {
        let terminal = |state: Option<HalfState>| state.is_none_or(HalfState::is_terminal);
        if terminal(self.machine.stream_local_state(stream_id))
            && terminal(self.machine.stream_remote_state(stream_id))
        {
            self.streams.remove(stream_id);
        }
    }

    // ── Introspection ──────────────────────────────────────────────────

    /// Look up a live stream by ref.
    pub fn stream_info(&self, stream_ref: StreamRef) -> Option<StreamInfo> {
        self.streams.by_ref(stream_ref).map(|stream| StreamInfo {
            stream_ref: stream.stream_ref,
            reply_to: stream.reply_to.clone(),
            running: self.machine.stream_local_state(stream.id).is_some()
                || self.machine.stream_remote_state(stream.id).is_some(),
        })
    }

    /// Refs of the streams that were still live when the engine went down.
    pub fn down(&self) -> &[StreamRef] {
        &self.down
    }
}

/// The `:authority` for a request: an explicit `host` header wins,
/// otherwise host and port with the scheme's default port elided.
fn request_authority(headers: &[HeaderField], host: &str, port: u16, scheme: &str) -> String {
    if let Some(field) = headers.iter().find(|h| h.name_is(b"host")) {
        return String::from_utf8_lossy(&field.value).into_owned();
    }
    let default_port = if scheme == "https" { 443 } else { 80 };
    if port == default_port {
        host.to_owned()
    } else {
        format!("{host}:{port}")
    }
}

/// Drop headers that must not appear in an HTTP/2 request.
fn strip_headers(headers: Vec<HeaderField>) -> Vec<HeaderField> {
    headers
        .into_iter()
        .filter(|field| !STRIPPED_HEADERS.iter().any(|&name| field.name_is(name)))
        .collect()
}
