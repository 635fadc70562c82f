//! Engine configuration.

use crate::content::ContentHandlers;

/// Keepalive PING cadence. The engine does not own a clock; its
/// coordinator reads this value and calls `Engine::keepalive` on schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keepalive {
    /// Never ping.
    Infinity,
    /// Ping every `n` milliseconds; must be positive.
    Millis(u64),
}

/// Options accepted by the engine.
#[derive(Debug, Clone)]
pub struct Http2Options {
    pub keepalive: Keepalive,
    /// How to build the response body pipeline for each stream.
    pub content_handlers: ContentHandlers,
}

impl Default for Http2Options {
    fn default() -> Self {
        Self {
            keepalive: Keepalive::Infinity,
            content_handlers: ContentHandlers::default(),
        }
    }
}

impl Http2Options {
    /// Reject option values the engine cannot honor.
    pub fn validate(&self) -> Result<(), OptionError> {
        if self.keepalive == Keepalive::Millis(0) {
            return Err(OptionError::Http2("keepalive"));
        }
        Ok(())
    }
}

/// An option rejected at engine creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OptionError {
    #[error("invalid http2 option: {0}")]
    Http2(&'static str),
}
