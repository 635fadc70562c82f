//! HTTP/2 client connection engine.
//!
//! This crate drives a single HTTP/2 connection over a byte transport,
//! multiplexing concurrent request/response streams on it. It is the
//! stateful shell around the sans-IO protocol layer in `wireline-h2`: the
//! coordinator that owns the socket feeds inbound chunks to
//! [`Engine::handle`] and routes application commands to the egress
//! methods; the engine does the rest.
//!
//! # Architecture
//!
//! ```text
//!           bytes in                       commands
//!              |                    (headers/request/data/cancel)
//!        +-----v----------------------------v-----+
//!        | Engine                                  |
//!        |   buffer -> frame::parse -> Machine     |
//!        |   stream table (id <-> ref)             |
//!        |   content handlers, event handler       |
//!        +-----+----------------------------+-----+
//!              |                            |
//!         bytes out                  StreamMessage to
//!        (Transport::send)           each reply target
//! ```
//!
//! Responses reach each stream's [`ReplyTo`] as typed [`StreamMessage`]s;
//! protocol transitions are mirrored to an [`EventHandler`] for telemetry.
//! A stream fails in exactly one way, exactly once: a stream error, a
//! connection error, or a lost transport.
//!
//! # Example
//!
//! ```rust,ignore
//! use wireline_http::{Engine, Http2Options, NoopEvents, ReplyTo, StreamRef};
//!
//! let (owner, _owner_rx) = ReplyTo::channel();
//! let mut engine = Engine::new(owner, transport, Http2Options::default())?;
//! let mut events = NoopEvents;
//!
//! let stream = StreamRef::new();
//! let (reply_to, rx) = ReplyTo::channel();
//! engine.headers(stream, reply_to, "GET", "example.com", 443, "/", vec![], &mut events)?;
//!
//! // Feed transport reads as they arrive.
//! engine.handle(&chunk, &mut events)?;
//!
//! while let Ok(message) = rx.try_recv() {
//!     // StreamMessage::Response, Data, Trailers, ...
//! }
//! ```

pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod event;
pub mod message;
pub mod streams;
pub mod transport;

pub use config::{Http2Options, Keepalive, OptionError};
pub use content::{ContentHandler, ContentHandlers};
pub use engine::{Control, Engine, StreamInfo};
pub use error::{EngineError, ErrorCause};
pub use event::{EventHandler, NoopEvents};
pub use message::{OwnerMessage, ReplyTo, StreamMessage, StreamRef};
pub use transport::{Transport, TransportKind};
