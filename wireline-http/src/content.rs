//! Response body handler pipeline.
//!
//! Once final response headers arrive on a stream, the engine builds a
//! handler from the configured factory and routes every DATA payload
//! through it. Handlers decide what reaches the reply target; the default
//! passes payloads through untouched.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use wireline_h2::Fin;

use crate::message::{ReplyTo, StreamMessage, StreamRef};

/// Per-stream response body state.
pub trait ContentHandler: Send {
    /// Feed one body chunk, delivering whatever the application should see
    /// to `reply_to`.
    fn data(&mut self, stream: StreamRef, fin: Fin, payload: Bytes, reply_to: &ReplyTo);
}

/// Factory describing how to build the per-stream pipeline.
#[derive(Clone)]
pub struct ContentHandlers {
    build: Arc<dyn Fn() -> Box<dyn ContentHandler> + Send + Sync>,
}

impl ContentHandlers {
    pub fn new(build: impl Fn() -> Box<dyn ContentHandler> + Send + Sync + 'static) -> Self {
        Self {
            build: Arc::new(build),
        }
    }

    pub(crate) fn build(&self) -> Box<dyn ContentHandler> {
        (self.build)()
    }
}

impl Default for ContentHandlers {
    fn default() -> Self {
        Self::new(|| Box::new(PassThrough))
    }
}

impl fmt::Debug for ContentHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentHandlers")
    }
}

/// The default pipeline: deliver body chunks verbatim.
pub struct PassThrough;

impl ContentHandler for PassThrough {
    fn data(&mut self, stream: StreamRef, fin: Fin, payload: Bytes, reply_to: &ReplyTo) {
        reply_to.deliver(StreamMessage::Data {
            stream,
            fin,
            payload,
        });
    }
}
