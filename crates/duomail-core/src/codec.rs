//! URL-safe base64 as used by the Gmail wire format: `-`/`_` alphabet, padding stripped on
//! encode and restored on decode.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::{DecodeError, Engine};

pub fn encode_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes URL-safe base64, tolerating missing padding, embedded whitespace and the standard
/// `+`/`/` alphabet that some senders leak through.
pub fn decode_base64url(input: &str) -> Result<Vec<u8>, DecodeError> {
    let mut normalized: String = input
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    while normalized.ends_with('=') {
        normalized.pop();
    }
    let remainder = normalized.len() % 4;
    if remainder != 0 {
        normalized.extend(std::iter::repeat_n('=', 4 - remainder));
    }

    URL_SAFE.decode(normalized.as_bytes())
}
