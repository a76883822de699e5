//! Text helpers shared by the runner: ANSI stripping, secret masking and
//! base64 encoding for script transport.

use std::sync::LazyLock;

use regex::Regex;

/// Replacement written in place of every known secret.
pub const SECRET_MASK: &str = "********";

// CSI sequences (colors, cursor movement), OSC sequences (window titles,
// hyperlinks) terminated by BEL or ST, and lone two-byte escapes.
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

/// Remove terminal escape sequences so output can be stored and logged as
/// plain text.
pub fn strip_ansi(text: &str) -> String {
    if !text.contains('\x1b') {
        return text.to_string();
    }
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Replace every occurrence of each secret with [`SECRET_MASK`].
///
/// Longer secrets are replaced first so a secret that contains another one
/// is masked as a whole. Empty secrets are ignored.
pub fn redact<S: AsRef<str>>(text: &str, secrets: &[S]) -> String {
    let mut ordered: Vec<&str> = secrets
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.is_empty())
        .collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let mut out = text.to_string();
    for secret in ordered {
        if out.contains(secret) {
            out = out.replace(secret, SECRET_MASK);
        }
    }
    out
}

/// Standard base64 encoding with padding.
pub fn base64_encode(data: &[u8]) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut result = String::with_capacity(data.len().div_ceil(3) * 4);

    for chunk in data.chunks(3) {
        let b0 = u32::from(chunk[0]);
        let b1 = u32::from(chunk.get(1).copied().unwrap_or(0));
        let b2 = u32::from(chunk.get(2).copied().unwrap_or(0));
        let n = (b0 << 16) | (b1 << 8) | b2;

        result.push(CHARS[(n >> 18 & 0x3F) as usize] as char);
        result.push(CHARS[(n >> 12 & 0x3F) as usize] as char);
        if chunk.len() > 1 {
            result.push(CHARS[(n >> 6 & 0x3F) as usize] as char);
        } else {
            result.push('=');
        }
        if chunk.len() > 2 {
            result.push(CHARS[(n & 0x3F) as usize] as char);
        } else {
            result.push('=');
        }
    }

    result
}
