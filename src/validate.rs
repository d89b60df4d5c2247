//! Admission validation for keys, values, and database filenames.

use std::path::Path;

use unicode_normalization::{UnicodeNormalization, is_nfc};

use crate::error::{DatabaseError, Result};
use crate::value::Value;

/// Maximum key length in code points.
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum database filename length.
pub const MAX_FILENAME_LENGTH: usize = 255;

const FORBIDDEN_KEY_CHARS: &[char] = &['"', '\'', ';', '\\', '/'];
const FORBIDDEN_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Which persistence backend a database filename selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `.json`: ordered in-memory document file.
    JsonFile,
    /// `.db` / `.sqlite`: relational table file.
    Sqlite,
}

/// Enforce the key admission rules: non-empty, NFC-normalized, at most 256
/// code points, and free of quotes, semicolons, slashes, control characters,
/// and Unicode non-characters.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(DatabaseError::InvalidKey(
            "key must not be empty".to_string(),
        ));
    }
    let length = key.chars().count();
    if length > MAX_KEY_LENGTH {
        return Err(DatabaseError::InvalidKey(format!(
            "key length {length} exceeds maximum of {MAX_KEY_LENGTH} code points"
        )));
    }
    if !is_nfc(key) {
        // Keys must arrive pre-composed so byte-wise backend lookups agree
        // with caller-side equality.
        let composed: String = key.nfc().collect();
        return Err(DatabaseError::InvalidKey(format!(
            "key is not in NFC normalized form (expected '{composed}')"
        )));
    }
    for ch in key.chars() {
        if FORBIDDEN_KEY_CHARS.contains(&ch) {
            return Err(DatabaseError::InvalidKey(format!(
                "key contains forbidden character '{ch}'"
            )));
        }
        let cp = ch as u32;
        if cp <= 0x1F || cp == 0x7F {
            return Err(DatabaseError::InvalidKey(
                "key contains a control character".to_string(),
            ));
        }
        if (0xFDD0..=0xFDEF).contains(&cp) || (cp & 0xFFFF) >= 0xFFFE {
            return Err(DatabaseError::InvalidKey(
                "key contains a Unicode non-character".to_string(),
            ));
        }
    }
    Ok(())
}

/// Enforce the value admission rules. With an owned [`Value`] tree the only
/// rejectable shape is an explicitly absent value.
pub fn validate_value(value: &Value) -> Result<()> {
    if value.is_undefined() {
        return Err(DatabaseError::InvalidValue(
            "cannot store an undefined value".to_string(),
        ));
    }
    Ok(())
}

/// Validate a database path and resolve which backend its extension selects.
pub fn resolve_backend(path: &Path) -> Result<BackendKind> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DatabaseError::InvalidValue("invalid database filename".to_string()))?;
    if name.is_empty() {
        return Err(DatabaseError::InvalidValue(
            "database filename must not be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_FILENAME_LENGTH {
        return Err(DatabaseError::InvalidValue(format!(
            "database filename exceeds {MAX_FILENAME_LENGTH} characters"
        )));
    }
    for ch in name.chars() {
        if ch.is_control() || FORBIDDEN_FILENAME_CHARS.contains(&ch) {
            return Err(DatabaseError::InvalidValue(format!(
                "database filename contains forbidden character '{}'",
                ch.escape_default()
            )));
        }
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(BackendKind::JsonFile),
        Some("db" | "sqlite") => Ok(BackendKind::Sqlite),
        other => Err(DatabaseError::InvalidValue(format!(
            "unsupported database extension {:?}; expected .json, .db, or .sqlite",
            other.unwrap_or("")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_keys() {
        let longest = "x".repeat(256);
        for key in ["user:1", "a", "emoji-😀", "dotted.path.key", longest.as_str()] {
            assert!(validate_key(key).is_ok(), "rejected {key:?}");
        }
    }

    #[test]
    fn rejects_empty_and_oversized_keys() {
        assert!(matches!(validate_key(""), Err(DatabaseError::InvalidKey(_))));
        assert!(validate_key(&"x".repeat(257)).is_err());
    }

    #[test]
    fn rejects_forbidden_characters() {
        for key in ["a\"b", "a'b", "a;b", "a\\b", "a/b", "a\0b", "a\tb", "a\u{7f}b"] {
            assert!(validate_key(key).is_err(), "accepted {key:?}");
        }
    }

    #[test]
    fn rejects_unicode_noncharacters() {
        assert!(validate_key("a\u{FDD0}").is_err());
        assert!(validate_key("a\u{FFFE}").is_err());
        assert!(validate_key("a\u{1FFFF}").is_err());
    }

    #[test]
    fn rejects_decomposed_keys() {
        // U+0065 U+0301 is the decomposed form of 'é'.
        assert!(validate_key("caf\u{0065}\u{0301}").is_err());
        assert!(validate_key("caf\u{00e9}").is_ok());
    }

    #[test]
    fn rejects_undefined_values() {
        assert!(validate_value(&Value::Undefined).is_err());
        assert!(validate_value(&Value::Null).is_ok());
        assert!(validate_value(&Value::from(0)).is_ok());
    }

    #[test]
    fn extension_selects_backend() {
        assert_eq!(
            resolve_backend(Path::new("data.json")).unwrap(),
            BackendKind::JsonFile
        );
        assert_eq!(
            resolve_backend(Path::new("data.db")).unwrap(),
            BackendKind::Sqlite
        );
        assert_eq!(
            resolve_backend(Path::new("data.sqlite")).unwrap(),
            BackendKind::Sqlite
        );
        assert!(resolve_backend(Path::new("data.txt")).is_err());
        assert!(resolve_backend(Path::new("data")).is_err());
    }

    #[test]
    fn filename_character_rules() {
        assert!(resolve_backend(Path::new("da<ta.json")).is_err());
        assert!(resolve_backend(Path::new("da|ta.json")).is_err());
    }
}
