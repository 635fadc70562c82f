//! The byte transport capability owned by the engine.

use std::io::{self, Write};
use std::net::TcpStream;

/// Which flavor of byte pipe carries the connection. The engine only
/// depends on this to pick the request scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    /// TLS tunnelled through a CONNECT proxy.
    TlsProxy,
}

impl TransportKind {
    pub fn scheme(self) -> &'static str {
        match self {
            TransportKind::Tcp => "http",
            TransportKind::Tls | TransportKind::TlsProxy => "https",
        }
    }
}

/// A connected byte sink. Reads are not part of the capability: inbound
/// chunks are delivered to the engine by its coordinator.
pub trait Transport {
    /// Write exactly `bytes`; partial writes are the implementation's
    /// problem, never the engine's.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn kind(&self) -> TransportKind;
}

impl Transport for TcpStream {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}
