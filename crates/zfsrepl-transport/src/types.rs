//! Shared value types for command execution

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ExecError;

/// Text encoding used to decode command output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Strict UTF-8, invalid bytes are an error
    #[default]
    Utf8,
    /// UTF-8 with invalid sequences replaced by U+FFFD
    Utf8Lossy,
}

impl Encoding {
    /// Decode raw output bytes
    ///
    /// # Errors
    /// Returns `ExecError::Decode` for invalid input under [`Encoding::Utf8`]
    pub fn decode(self, bytes: Vec<u8>) -> Result<String, ExecError> {
        match self {
            Encoding::Utf8 => {
                String::from_utf8(bytes).map_err(|e| ExecError::Decode(e.to_string()))
            }
            Encoding::Utf8Lossy => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }
}

/// Options for a single command execution
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Encoding of the command's output
    pub encoding: Encoding,
    /// Stream stdout line-by-line into this channel instead of returning it.
    /// The channel is closed once the output is exhausted.
    pub stdout: Option<mpsc::UnboundedSender<String>>,
}

impl ExecOptions {
    /// Default options: strict UTF-8, output returned by `wait`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set output encoding
    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Stream stdout into `sink`
    #[must_use]
    pub fn with_stdout(mut self, sink: mpsc::UnboundedSender<String>) -> Self {
        self.stdout = Some(sink);
        self
    }
}

/// Entry returned by `Shell::ls`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// File name (no directory part)
    pub name: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
}

impl DirEntry {
    /// Create a new entry
    pub fn new(name: impl Into<String>, is_dir: bool) -> Self {
        Self {
            name: name.into(),
            is_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_decode_rejects_invalid_utf8() {
        let result = Encoding::Utf8.decode(vec![b'o', b'k', 0xff]);
        assert!(matches!(result, Err(ExecError::Decode(_))));
    }

    #[test]
    fn test_lossy_decode_replaces_invalid_utf8() {
        let text = Encoding::Utf8Lossy.decode(vec![b'o', b'k', 0xff]).unwrap();
        assert_eq!(text, "ok\u{fffd}");
    }
}
