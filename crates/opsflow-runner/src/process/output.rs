//! Reassembly of fragmented interpreter output.

/// Ordered logical output chunks of one invocation.
///
/// A chunk is complete once it ends with a line terminator. Incoming data is
/// appended to the last chunk while that chunk is still incomplete, and
/// starts a new chunk otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBuffer {
    chunks: Vec<String>,
}

fn is_complete(chunk: &str) -> bool {
    chunk.ends_with('\n')
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw data from the stream.
    pub fn push(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        match self.chunks.last_mut() {
            Some(last) if !is_complete(last) => last.push_str(data),
            _ => self.chunks.push(data.to_string()),
        }
    }

    /// Append `chunk` as a new logical chunk regardless of the last one.
    pub(crate) fn push_chunk(&mut self, chunk: String) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub(crate) fn pop_last(&mut self) -> Option<String> {
        self.chunks.pop()
    }

    /// `true` while the last chunk is still waiting for its line terminator.
    pub fn is_fragment_pending(&self) -> bool {
        self.chunks.last().is_some_and(|c| !is_complete(c))
    }

    pub fn last(&self) -> Option<&str> {
        self.chunks.last().map(String::as_str)
    }

    /// The most recent chunk that ends with a line terminator.
    pub fn last_complete(&self) -> Option<&str> {
        self.chunks
            .iter()
            .rev()
            .find(|c| is_complete(c))
            .map(String::as_str)
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

/// Incremental UTF-8 decoding across read boundaries.
///
/// A multi-byte character split between two reads is held back until the
/// rest arrives. Invalid bytes are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let out = text.to_string();
                self.pending.clear();
                out
            }
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                out
            }
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }
}
