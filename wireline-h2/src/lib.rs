//! Sans-IO HTTP/2 client protocol layer.
//!
//! This crate provides the pure protocol half of an HTTP/2 client: a frame
//! codec and a protocol machine. Neither performs any I/O -- the engine
//! that owns the transport feeds decoded frames in and serializes whatever
//! the machine hands back.
//!
//! # Architecture
//!
//! ```text
//!   TCP + TLS bytes
//!        |
//!   +----v-----------+
//!   | frame::parse   |  bytes -> Frame | Ignored | errors | More
//!   +----+-----------+
//!        |
//!   +----v-----------+
//!   | Machine        |  Frame -> Event | Send | error
//!   |                |  send requests -> header blocks, DATA frames
//!   +----------------+
//! ```
//!
//! The machine owns the HPACK tables, the SETTINGS of both peers, the flow
//! control windows, and every stream's half-states. Outbound DATA that
//! exceeds the current windows is parked inside the machine and released
//! as `Send` results when WINDOW_UPDATE credits arrive, so a send request
//! either writes or parks atomically.

pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod headers;
pub mod machine;
pub mod settings;

pub use error::{ErrorCode, ProtoError};
pub use frame::{Frame, Parsed};
pub use headers::{HeaderField, RequestPseudo};
pub use machine::{DataResult, Event, Fin, FrameResult, HalfState, Machine, SendOut};
pub use settings::Settings;
