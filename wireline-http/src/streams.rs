//! The engine's stream table.
//!
//! Rows are keyed by both the wire stream id and the application-visible
//! ref. Insertion order is preserved so shutdown messaging is
//! deterministic.

use crate::content::ContentHandler;
use crate::message::{ReplyTo, StreamRef};

/// One active request or pushed stream.
pub struct Stream {
    pub id: u32,
    pub stream_ref: StreamRef,
    pub reply_to: ReplyTo,
    /// Body pipeline state; present between final response headers and
    /// end-of-stream.
    pub handler: Option<Box<dyn ContentHandler>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("stream_ref", &self.stream_ref)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Ordered collection of active streams.
#[derive(Debug, Default)]
pub struct StreamTable {
    rows: Vec<Stream>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn insert(&mut self, stream: Stream) {
        self.rows.push(stream);
    }

    pub fn by_id(&self, id: u32) -> Option<&Stream> {
        self.rows.iter().find(|s| s.id == id)
    }

    pub fn by_id_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.rows.iter_mut().find(|s| s.id == id)
    }

    pub fn by_ref(&self, stream_ref: StreamRef) -> Option<&Stream> {
        self.rows.iter().find(|s| s.stream_ref == stream_ref)
    }

    pub fn remove(&mut self, id: u32) -> Option<Stream> {
        let index = self.rows.iter().position(|s| s.id == id)?;
        Some(self.rows.remove(index))
    }

    /// Streams in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.rows.iter()
    }

    /// Empty the table, yielding rows in insertion order.
    pub fn drain(&mut self) -> impl Iterator<Item = Stream> + '_ {
        self.rows.drain(..)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
