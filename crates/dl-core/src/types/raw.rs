//! Raw upstream message as received from the feed transport.

/// One frame from the upstream feed, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    /// A text frame (JSON for every supported upstream).
    Text(String),
    /// A binary frame.
    Binary(Vec<u8>),
}

impl RawMessage {
    /// Borrow the payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Binary(b) => std::str::from_utf8(b).ok(),
        }
    }

    /// Payload size in bytes, for diagnostics.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for RawMessage {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for RawMessage {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}
