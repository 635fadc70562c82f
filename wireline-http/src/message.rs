//! Application-facing messages and the handles they travel through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;

use bytes::Bytes;
use wireline_h2::{Fin, HeaderField};

use crate::error::ErrorCause;

static NEXT_REF: AtomicU64 = AtomicU64::new(1);

/// Opaque application-visible stream handle. Callers mint refs for the
/// streams they open; the engine mints refs for server-pushed streams.
/// Refs are unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamRef(u64);

impl StreamRef {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_REF.fetch_add(1, Ordering::Relaxed))
    }
}

/// Messages delivered to a stream's reply target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// An informational (1xx) response.
    Inform {
        stream: StreamRef,
        status: u16,
        headers: Vec<HeaderField>,
    },
    /// The final response head.
    Response {
        stream: StreamRef,
        fin: Fin,
        status: u16,
        headers: Vec<HeaderField>,
    },
    /// A chunk of response body, as shaped by the content handler.
    Data {
        stream: StreamRef,
        fin: Fin,
        payload: Bytes,
    },
    /// Trailing headers.
    Trailers {
        stream: StreamRef,
        headers: Vec<HeaderField>,
    },
    /// The server promised a pushed stream. Responses for it arrive under
    /// `promised` at the same reply target as the parent.
    Push {
        parent: StreamRef,
        promised: StreamRef,
        method: String,
        uri: String,
        headers: Vec<HeaderField>,
    },
    /// The stream's single terminal failure.
    Error {
        stream: StreamRef,
        cause: ErrorCause,
    },
}

/// Messages delivered to the engine's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerMessage {
    /// The engine went down; `streams` are the refs that were still live.
    Down {
        cause: ErrorCause,
        streams: Vec<StreamRef>,
    },
}

/// Fire-and-forget delivery handle. Sends never block and a vanished
/// receiver is not an error, so the engine can always deliver without
/// caring who is listening.
pub struct ReplyTo<M = StreamMessage> {
    tx: mpsc::Sender<M>,
}

impl<M> ReplyTo<M> {
    /// A handle plus the receiving end the consumer reads from.
    pub fn channel() -> (Self, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn deliver(&self, message: M) {
        let _ = self.tx.send(message);
    }
}

impl<M> Clone for ReplyTo<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> std::fmt::Debug for ReplyTo<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReplyTo")
    }
}
