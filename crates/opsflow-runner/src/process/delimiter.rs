//! End-of-invocation sentinel detection.
//!
//! Every submitted command is followed by a sentinel line `<token>:<code>`
//! printed by the interpreter once the script finishes. The shape of a valid
//! sentinel is a configurable regex because token length bounds are a choice
//! of whoever generates the tokens, not a protocol guarantee. Only tokens the
//! handle actually issued are treated as sentinels, so ordinary output that
//! happens to look like one passes through.

use std::collections::HashSet;

use regex::Regex;

/// Default sentinel shape: an alphanumeric token with an optional exit code.
pub const DEFAULT_DELIMITER_PATTERN: &str = r"^(?P<token>[A-Za-z0-9]{8,64})(?::(?P<code>-?\d+))?$";

/// How far in front of a token a pattern's fixed prefix may start.
const MAX_SENTINEL_PREFIX: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DelimiterError {
    #[error("Invalid delimiter pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Delimiter pattern must define a named `token` group")]
    MissingTokenGroup,
}

/// Result of scanning one complete output chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// The chunk with every sentinel removed.
    pub text: String,
    /// Set when the sentinel for the current invocation was found; carries
    /// its exit code if the interpreter reported one.
    pub finished: Option<Option<i32>>,
}

#[derive(Debug, Clone)]
pub struct BulkDelimiter {
    pattern: Regex,
}

impl Default for BulkDelimiter {
    fn default() -> Self {
        #[allow(clippy::unwrap_used)]
        Self::new(DEFAULT_DELIMITER_PATTERN).unwrap()
    }
}

impl BulkDelimiter {
    /// Build from a pattern that must match the whole sentinel and expose a
    /// `token` group (and optionally a `code` group).
    pub fn new(pattern: &str) -> Result<Self, DelimiterError> {
        let pattern = Regex::new(pattern)?;
        if !pattern.capture_names().flatten().any(|n| n == "token") {
            return Err(DelimiterError::MissingTokenGroup);
        }
        Ok(Self { pattern })
    }

    /// A fresh token for one invocation.
    pub fn new_token() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Remove sentinel lines for any issued token from `chunk`.
    ///
    /// A sentinel glued onto the end of a data line (output that lacked a
    /// trailing newline) is split off and the data is kept.
    pub fn extract(&self, chunk: &str, current: &str, issued: &HashSet<String>) -> Extraction {
        let mut text = String::with_capacity(chunk.len());
        let mut finished = None;

        for line in chunk.split_inclusive('\n') {
            let body = line.trim_end_matches(['\r', '\n']);
            let terminator = &line[body.len()..];

            match self.find_sentinel(body, issued) {
                Some((prefix, token, code)) => {
                    if !prefix.is_empty() {
                        text.push_str(prefix);
                        text.push_str(terminator);
                    }
                    if token == current {
                        finished = Some(code);
                    }
                }
                None => text.push_str(line),
            }
        }

        Extraction { text, finished }
    }

    fn find_sentinel<'a>(
        &self,
        body: &'a str,
        issued: &'a HashSet<String>,
    ) -> Option<(&'a str, &'a str, Option<i32>)> {
        issued.iter().find_map(|token| {
            let idx = body.rfind(token.as_str())?;
            // The pattern may put a fixed prefix in front of the token.
            let window = idx.saturating_sub(MAX_SENTINEL_PREFIX);
            (window..=idx)
                .filter(|start| body.is_char_boundary(*start))
                .find_map(|start| {
                    let caps = self.pattern.captures(&body[start..])?;
                    if caps.get(0)?.start() != 0 || caps.name("token")?.as_str() != token.as_str() {
                        return None;
                    }
                    let code = caps.name("code").and_then(|m| m.as_str().parse().ok());
                    Some((&body[..start], token.as_str(), code))
                })
        })
    }
}
