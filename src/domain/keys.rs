//! Lookup key normalization and hashing.
//!
//! Raw keys arrive as paths or full URLs in many spellings. [`normalize`] reduces them to a
//! canonical [`LookupKey`]; the index stores a fixed-width [`KeyHash`] of that key because
//! the keys themselves may exceed any practical index length.

use std::borrow::Cow;
use std::fmt;

use percent_encoding::percent_decode_str;
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use super::error::ValidationError;

/// Longest raw or normalized key accepted, in bytes.
pub const MAX_KEY_BYTES: usize = 2048;
/// Length of the human-readable key prefix kept next to each index entry.
pub const KEY_PREFIX_CHARS: usize = 191;

const HASH_BYTES: usize = 16;

/// A normalized lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LookupKey(String);

impl LookupKey {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        normalize(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn hash(&self) -> KeyHash {
        KeyHash::of(&self.0)
    }

    /// The key truncated to [`KEY_PREFIX_CHARS`] characters, for diagnostics.
    pub fn prefix(&self) -> String {
        truncate_chars(&self.0, KEY_PREFIX_CHARS)
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 128-bit digest of a lookup key, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct KeyHash(String);

impl KeyHash {
    pub fn of(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        Self(hex::encode(&digest[..HASH_BYTES]))
    }

    /// Accept a stored hash, rejecting anything that is not 32 lowercase hex digits.
    pub fn from_hex(value: &str) -> Option<Self> {
        let valid = value.len() == HASH_BYTES * 2
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalize a raw path or URL.
///
/// Query strings and fragments are dropped, percent-encoding is decoded once, the result
/// is lowercased and leading slashes are trimmed. Characters that would be reinterpreted
/// on a second pass are escaped again so that `normalize` is a fixpoint.
pub fn normalize(raw: &str) -> Result<LookupKey, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    if trimmed.len() > MAX_KEY_BYTES {
        return Err(ValidationError::TooLong { max: MAX_KEY_BYTES });
    }
    if trimmed.chars().any(char::is_control) {
        return Err(ValidationError::ControlCharacter);
    }

    let path = extract_path(trimmed)?;
    let decoded = percent_decode_str(&path).decode_utf8_lossy();
    if decoded.chars().any(char::is_control) {
        return Err(ValidationError::ControlCharacter);
    }

    let lowered = decoded.to_lowercase();
    let stripped = lowered
        .trim_start_matches(|c: char| c == '/' || c.is_whitespace())
        .trim_end();
    let key = escape_reserved(stripped);

    if key.is_empty() {
        return Err(ValidationError::Empty);
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(ValidationError::TooLong { max: MAX_KEY_BYTES });
    }

    Ok(LookupKey(key))
}

fn extract_path(input: &str) -> Result<Cow<'_, str>, ValidationError> {
    let absolute = if input.starts_with("//") {
        Some(Cow::Owned(format!("http:{input}")))
    } else if has_scheme(input) {
        Some(Cow::Borrowed(input))
    } else {
        None
    };

    match absolute {
        Some(candidate) => {
            let url = Url::parse(&candidate)
                .map_err(|err| ValidationError::unparseable(err.to_string()))?;
            Ok(Cow::Owned(url.path().to_string()))
        }
        None => {
            let end = input.find(['?', '#']).unwrap_or(input.len());
            Ok(Cow::Borrowed(&input[..end]))
        }
    }
}

fn has_scheme(input: &str) -> bool {
    let Some(idx) = input.find("://") else {
        return false;
    };
    let scheme = &input[..idx];
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

fn escape_reserved(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '?' => out.push_str("%3f"),
            '#' => out.push_str("%23"),
            ':' => out.push_str("%3a"),
            other => out.push(other),
        }
    }
    out
}

fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "/uploads/2024/a.jpg",
        "uploads/2024/A.JPG?ver=3#top",
        "https://example.com/Uploads/2024/a.jpg?x=1",
        "//cdn.example.com/uploads/a%20b.png",
        "/a%3Fb/c",
        "/a%2541",
        "%%41b",
        "/%2F%2Fdouble",
        "http://x.com/https://y.com/a",
        "  /spaced/ name%20 ",
        "/caf%C3%A9.jpg",
        "/bad%FFutf8.jpg",
        "/100%",
        "/İstanbul.PNG",
    ];

    #[test]
    fn normalization_is_idempotent() {
        for raw in SAMPLES {
            let once = normalize(raw).expect("sample normalizes");
            let twice = normalize(once.as_str()).expect("normalized key re-normalizes");
            assert_eq!(once, twice, "not a fixpoint for {raw:?}");
        }
    }

    #[test]
    fn strips_query_fragment_and_leading_slashes() {
        let key = normalize("///Uploads/2024/A.jpg?size=large#frag").unwrap();
        assert_eq!(key.as_str(), "uploads/2024/a.jpg");
    }

    #[test]
    fn urls_reduce_to_their_path() {
        let key = normalize("https://Example.com/uploads/2024/a.jpg?ver=2").unwrap();
        assert_eq!(key.as_str(), "uploads/2024/a.jpg");

        let relative = normalize("//cdn.example.com/uploads/2024/a.jpg").unwrap();
        assert_eq!(relative, key);
    }

    #[test]
    fn decodes_percent_encoding_once() {
        assert_eq!(normalize("/a%20b.png").unwrap().as_str(), "a b.png");
        assert_eq!(normalize("/a%2541").unwrap().as_str(), "a%2541");
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(normalize(""), Err(ValidationError::Empty));
        assert_eq!(normalize("   "), Err(ValidationError::Empty));
        assert_eq!(normalize("/?only=query"), Err(ValidationError::Empty));
        assert_eq!(normalize("/a\u{0}b"), Err(ValidationError::ControlCharacter));
        assert_eq!(normalize("/a%00b"), Err(ValidationError::ControlCharacter));
        assert!(matches!(
            normalize("http://exa mple.com/a"),
            Err(ValidationError::Unparseable { .. })
        ));
        let long = format!("/{}", "a".repeat(MAX_KEY_BYTES + 1));
        assert!(matches!(
            normalize(&long),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn equivalent_spellings_share_a_hash() {
        let a = normalize("/Uploads/a.jpg").unwrap();
        let b = normalize("uploads/a.jpg?resize=1").unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().as_str().len(), 32);
        assert!(KeyHash::from_hex(a.hash().as_str()).is_some());
        assert!(KeyHash::from_hex("XYZ").is_none());
    }

    #[test]
    fn prefix_is_bounded_by_characters() {
        let raw = format!("/{}", "é".repeat(300));
        let key = normalize(&raw).unwrap();
        assert_eq!(key.prefix().chars().count(), KEY_PREFIX_CHARS);
    }
}
