//! Request bodies for the manufacturing endpoints.

pub mod assembly;
pub mod blueprint;
pub mod eol;
pub mod lot;

use once_cell::sync::Lazy;
use regex::Regex;
use validator::ValidationError;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,64}$").expect("identifier pattern compiles"));

/// Caller-chosen ids and physical identities share one character set
pub(crate) fn validate_identifier(value: &str) -> Result<(), ValidationError> {
    if IDENTIFIER_RE.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("identifier"))
    }
}

fn validate_reason(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::new("blank_reason"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_charset() {
        assert!(validate_identifier("L1-A_2.x").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("has space").is_err());
        assert!(validate_identifier(&"x".repeat(65)).is_err());
    }
}
