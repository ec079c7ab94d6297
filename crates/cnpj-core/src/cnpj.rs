//! Canonicalization of CNPJ identifiers.

use std::fmt;

use crate::error::Error;

/// A canonicalized, 14-digit CNPJ.
///
/// Construction always strips non-digit characters (`.`, `/`, `-`, spaces)
/// before validating length, so `"11.222.333/0001-81"` and
/// `"11222333000181"` produce the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Cnpj(String);

impl Cnpj {
    /// Parses and canonicalizes `raw`, rejecting anything that does not
    /// resolve to exactly 14 digits.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.len() != 14 {
            return Err(Error::InvalidCnpj {
                input: raw.to_string(),
            });
        }
        Ok(Self(digits))
    }

    /// Returns the canonical 14-digit string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cnpj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Cnpj {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_formatting_characters() {
        let c = Cnpj::parse("11.222.333/0001-81").unwrap();
        assert_eq!(c.as_str(), "11222333000181");
    }

    #[test]
    fn accepts_already_canonical() {
        let c = Cnpj::parse("11222333000181").unwrap();
        assert_eq!(c.as_str(), "11222333000181");
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Cnpj::parse("1122233300018").is_err());
        assert!(Cnpj::parse("112223330001811").is_err());
    }

    #[test]
    fn rejects_non_numeric_after_strip() {
        // Letters are stripped like any other non-digit, so this resolves
        // to 13 digits and is rejected on length, not on content.
        let result = Cnpj::parse("1122233300018X");
        assert!(result.is_err());
    }

    #[test]
    fn preserves_leading_zeros() {
        let c = Cnpj::parse("00222333000181").unwrap();
        assert_eq!(c.as_str(), "00222333000181");
    }
}
