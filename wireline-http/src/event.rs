//! Instrumentation events.
//!
//! The engine reports every protocol transition to an [`EventHandler`]
//! threaded through its entry points. Handlers run inline and must not
//! block. Every method has a no-op default so implementations pick only
//! what they care about; [`NoopEvents`] is the always-available default.
//!
//! Connection setup events (`init`, `connect_start`, `connect_end`) are
//! invoked by the coordinator that establishes the transport; the engine
//! itself raises the request/response events plus `disconnect` and
//! `terminate`. Slots for DNS, TLS, protocol-change, push, cancellation
//! and WebSocket frames are intentionally not modelled yet.

use wireline_h2::{ErrorCode, HeaderField};

use crate::message::StreamRef;

/// A request is being initiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestStart {
    pub stream: StreamRef,
    pub method: String,
    pub authority: String,
    pub path: String,
}

/// The request head went out on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeaders {
    pub stream: StreamRef,
    pub method: String,
    pub authority: String,
    pub path: String,
    pub headers: Vec<HeaderField>,
}

/// The server started responding on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseStart {
    pub stream: StreamRef,
}

/// A response head (informational or final) arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeaders {
    pub stream: StreamRef,
    pub status: u16,
    pub headers: Vec<HeaderField>,
}

/// Trailing headers arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTrailers {
    pub stream: StreamRef,
    pub headers: Vec<HeaderField>,
}

/// One side of a stream reached its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEnd {
    pub stream: StreamRef,
}

/// The engine is going down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminate {
    pub reason: ErrorCode,
}

/// Telemetry sink threaded through the engine's entry points.
pub trait EventHandler {
    fn init(&mut self) {}
    fn connect_start(&mut self) {}
    fn connect_end(&mut self) {}

    fn request_start(&mut self, _event: &RequestStart) {}
    fn request_headers(&mut self, _event: &RequestHeaders) {}
    fn request_end(&mut self, _event: &StreamEnd) {}

    fn response_start(&mut self, _event: &ResponseStart) {}
    fn response_inform(&mut self, _event: &ResponseHeaders) {}
    fn response_headers(&mut self, _event: &ResponseHeaders) {}
    fn response_trailers(&mut self, _event: &ResponseTrailers) {}
    fn response_end(&mut self, _event: &StreamEnd) {}

    fn disconnect(&mut self) {}
    fn terminate(&mut self, _event: &Terminate) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl EventHandler for NoopEvents {}
