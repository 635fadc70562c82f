//! Shared test fixtures: an in-memory transport, a recording event
//! handler, and a scripted server peer speaking raw frames.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use wireline_h2::frame::{self, Parsed};
use wireline_h2::{Frame, Settings};
use wireline_http::event::{
    RequestHeaders, RequestStart, ResponseHeaders, ResponseStart, ResponseTrailers, StreamEnd,
    Terminate,
};
use wireline_http::{
    Control, Engine, EventHandler, Http2Options, OwnerMessage, ReplyTo, Transport, TransportKind,
};

/// Transport that records every write for later inspection.
#[derive(Clone)]
pub struct MockTransport {
    sent: Rc<RefCell<Vec<u8>>>,
    kind: TransportKind,
}

impl MockTransport {
    pub fn tls() -> Self {
        Self {
            sent: Rc::new(RefCell::new(Vec::new())),
            kind: TransportKind::Tls,
        }
    }

    pub fn tcp() -> Self {
        Self {
            sent: Rc::new(RefCell::new(Vec::new())),
            kind: TransportKind::Tcp,
        }
    }

    /// Drain everything written since the last call.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.sent.borrow_mut())
    }
}

impl Transport for MockTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sent.borrow_mut().extend_from_slice(bytes);
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

/// Event handler that records one line per callback.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    pub log: Vec<String>,
}

impl EventHandler for RecordingEvents {
    fn request_start(&mut self, event: &RequestStart) {
        self.log.push(format!(
            "request_start {} {} {}",
            event.method, event.authority, event.path
        ));
    }

    fn request_headers(&mut self, event: &RequestHeaders) {
        self.log.push(format!("request_headers {}", event.method));
    }

    fn request_end(&mut self, _event: &StreamEnd) {
        self.log.push("request_end".into());
    }

    fn response_start(&mut self, _event: &ResponseStart) {
        self.log.push("response_start".into());
    }

    fn response_inform(&mut self, event: &ResponseHeaders) {
        self.log.push(format!("response_inform {}", event.status));
    }

    fn response_headers(&mut self, event: &ResponseHeaders) {
        self.log.push(format!("response_headers {}", event.status));
    }

    fn response_trailers(&mut self, _event: &ResponseTrailers) {
        self.log.push("response_trailers".into());
    }

    fn response_end(&mut self, _event: &StreamEnd) {
        self.log.push("response_end".into());
    }

    fn disconnect(&mut self) {
        self.log.push("disconnect".into());
    }

    fn terminate(&mut self, event: &Terminate) {
        self.log.push(format!("terminate {:?}", event.reason));
    }
}

impl RecordingEvents {
    /// Position of the first log entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.log.iter().position(|entry| entry.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.log
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }
}

/// Scripted server half of the connection: builds raw inbound bytes.
pub struct TestServer {
    encoder: hpack::Encoder<'static>,
}

impl TestServer {
    pub fn new() -> Self {
        Self {
            encoder: hpack::Encoder::new(),
        }
    }

    pub fn settings(&self) -> Vec<u8> {
        Frame::Settings {
            ack: false,
            settings: Settings::default(),
        }
        .encode_to_vec()
    }

    pub fn headers(
        &mut self,
        stream_id: u32,
        status: &str,
        extra: &[(&[u8], &[u8])],
        end_stream: bool,
    ) -> Vec<u8> {
        let mut fields: Vec<(&[u8], &[u8])> = vec![(b":status".as_slice(), status.as_bytes())];
        fields.extend_from_slice(extra);
        let fragment = self.encoder.encode(fields);
        Frame::Headers {
            stream_id,
            fragment,
            end_stream,
            end_headers: true,
        }
        .encode_to_vec()
    }

    pub fn trailers(&mut self, stream_id: u32, fields: &[(&[u8], &[u8])]) -> Vec<u8> {
        let fragment = self.encoder.encode(fields.iter().copied());
        Frame::Headers {
            stream_id,
            fragment,
            end_stream: true,
            end_headers: true,
        }
        .encode_to_vec()
    }

    pub fn data(stream_id: u32, payload: &[u8], end_stream: bool) -> Vec<u8> {
        Frame::Data {
            stream_id,
            payload: payload.to_vec(),
            end_stream,
        }
        .encode_to_vec()
    }

    pub fn push_promise(
        &mut self,
        stream_id: u32,
        promised_id: u32,
        method: &str,
        scheme: &str,
        authority: &str,
        path: &str,
    ) -> Vec<u8> {
        let fragment = self.encoder.encode(vec![
            (b":method".as_slice(), method.as_bytes()),
            (b":scheme".as_slice(), scheme.as_bytes()),
            (b":authority".as_slice(), authority.as_bytes()),
            (b":path".as_slice(), path.as_bytes()),
        ]);
        Frame::PushPromise {
            stream_id,
            promised_id,
            fragment,
            end_headers: true,
        }
        .encode_to_vec()
    }

    pub fn rst(stream_id: u32, error_code: wireline_h2::ErrorCode) -> Vec<u8> {
        Frame::RstStream {
            stream_id,
            error_code,
        }
        .encode_to_vec()
    }

    pub fn goaway(last_stream_id: u32, error_code: wireline_h2::ErrorCode) -> Vec<u8> {
        Frame::GoAway {
            last_stream_id,
            error_code,
            debug_data: Vec::new(),
        }
        .encode_to_vec()
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Vec<u8> {
        Frame::WindowUpdate {
            stream_id,
            increment,
        }
        .encode_to_vec()
    }
}

/// Parse a run of outbound frames (no preface magic).
pub fn parse_frames(mut bytes: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        match frame::parse(bytes, 16_777_215) {
            Parsed::Frame { frame, consumed } => {
                frames.push(frame);
                bytes = &bytes[consumed..];
            }
            other => panic!("unparseable outbound bytes: {other:?}"),
        }
    }
    frames
}

/// A connected engine: preface written and drained, server SETTINGS
/// exchanged and the ack drained.
pub fn connected_engine(
    transport: MockTransport,
) -> (
    Engine<MockTransport>,
    std::sync::mpsc::Receiver<OwnerMessage>,
) {
    let (owner, owner_rx) = ReplyTo::channel();
    let mut engine =
        Engine::new(owner, transport.clone(), Http2Options::default()).expect("engine options");
    let preface = transport.take();
    assert!(preface.starts_with(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"));

    let server = TestServer::new();
    let mut events = RecordingEvents::default();
    assert_eq!(
        engine.handle(&server.settings(), &mut events).unwrap(),
        Control::Continue
    );
    // The engine acknowledges the server settings.
    let ack = transport.take();
    match parse_frames(&ack).as_slice() {
        [Frame::Settings { ack: true, .. }] => {}
        other => panic!("expected a SETTINGS ack, got {other:?}"),
    }
    (engine, owner_rx)
}
