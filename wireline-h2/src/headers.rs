//! Header field types shared by the machine and its callers.

/// A single header name-value pair. Names are kept as raw bytes; HTTP/2
/// requires them to be lowercase on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name_is(&self, name: &[u8]) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Request pseudo-headers (RFC 9113 Section 8.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPseudo {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
}

impl RequestPseudo {
    /// The absolute URI form `scheme "://" authority path`.
    pub fn uri(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority, self.path)
    }
}
