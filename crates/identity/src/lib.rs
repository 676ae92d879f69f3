//! Device identities: a free-form prefix followed by a five digit sequence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const SEQUENCE_DIGITS: usize = 5;
pub const MAX_SEQUENCE: u32 = 99_999;
pub const MIN_PREFIX_LEN: usize = 2;
pub const FIRMWARE_SUFFIX: &str = ".bin";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("prefix length should be larger than 1")]
    PrefixTooShort,
    #[error("device sequence {0:?} is not a number")]
    SequenceNotNumeric(String),
    #[error("device sequence length should be 5, got {0}")]
    SequenceLength(usize),
    #[error("firmware path {0:?} is invalid (expected a .bin file)")]
    FirmwarePath(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("device sequence exhausted after {prefix}{MAX_SEQUENCE}")]
    Exhausted { prefix: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(try_from = "RawIdentity")]
pub struct DeviceIdentity {
    prefix: String,
    sequence: u32,
}

#[derive(Deserialize)]
struct RawIdentity {
    prefix: String,
    sequence: u32,
}

impl TryFrom<RawIdentity> for DeviceIdentity {
    type Error = ValidationError;

    fn try_from(raw: RawIdentity) -> Result<Self, Self::Error> {
        let text = format!("{:0width$}", raw.sequence, width = SEQUENCE_DIGITS);
        Self::parse(&raw.prefix, &text)
    }
}

impl DeviceIdentity {
    /// Builds an identity from operator input, applying the same checks as [`validate`].
    pub fn parse(prefix: &str, sequence_text: &str) -> Result<Self, ValidationError> {
        let sequence = validate(prefix, sequence_text)?;
        Ok(Self {
            prefix: prefix.to_string(),
            sequence,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Zero padded sequence as the operator sees it, e.g. `00042`.
    pub fn sequence_text(&self) -> String {
        format!("{:0width$}", self.sequence, width = SEQUENCE_DIGITS)
    }

    /// The identity that follows this one. Fails closed at the end of the five digit range.
    pub fn next(&self) -> Result<Self, IdentityError> {
        if self.sequence >= MAX_SEQUENCE {
            return Err(IdentityError::Exhausted {
                prefix: self.prefix.clone(),
            });
        }
        Ok(Self {
            prefix: self.prefix.clone(),
            sequence: self.sequence + 1,
        })
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.sequence_text())
    }
}

/// Checks operator input and returns the parsed sequence number.
pub fn validate(prefix: &str, sequence_text: &str) -> Result<u32, ValidationError> {
    if prefix.chars().count() < MIN_PREFIX_LEN {
        return Err(ValidationError::PrefixTooShort);
    }
    if sequence_text.is_empty() || !sequence_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::SequenceNotNumeric(sequence_text.to_string()));
    }
    if sequence_text.len() != SEQUENCE_DIGITS {
        return Err(ValidationError::SequenceLength(sequence_text.len()));
    }
    sequence_text
        .parse::<u32>()
        .map_err(|_| ValidationError::SequenceNotNumeric(sequence_text.to_string()))
}

pub fn validate_firmware_path(path: &Path) -> Result<(), ValidationError> {
    let text = path.to_string_lossy();
    if text.chars().count() < 2 || !text.ends_with(FIRMWARE_SUFFIX) {
        return Err(ValidationError::FirmwarePath(text.into_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializing_applies_the_same_checks() {
        let id: DeviceIdentity =
            serde_json::from_str(r#"{"prefix": "DEV", "sequence": 42}"#).unwrap();
        assert_eq!(id.to_string(), "DEV00042");
        assert_eq!(serde_json::from_str::<DeviceIdentity>(&serde_json::to_string(&id).unwrap()).unwrap(), id);

        assert!(serde_json::from_str::<DeviceIdentity>(r#"{"prefix": "DEV", "sequence": 200000}"#).is_err());
        assert!(serde_json::from_str::<DeviceIdentity>(r#"{"prefix": "D", "sequence": 1}"#).is_err());
    }

    #[test]
    fn next_increments_and_pads() {
        let id = DeviceIdentity::parse("DEV", "00001").unwrap();
        assert_eq!(id.next().unwrap().to_string(), "DEV00002");
    }

    #[test]
    fn renders_five_digits_across_range() {
        for (text, expected) in [
            ("00000", "AB00000"),
            ("00999", "AB00999"),
            ("12345", "AB12345"),
            ("99999", "AB99999"),
        ] {
            let id = DeviceIdentity::parse("AB", text).unwrap();
            assert_eq!(id.to_string(), expected);
            assert_eq!(id.sequence_text().len(), SEQUENCE_DIGITS);
        }
    }

    #[test]
    fn carries_across_digit_boundaries() {
        let id = DeviceIdentity::parse("DEV", "09999").unwrap();
        assert_eq!(id.next().unwrap().to_string(), "DEV10000");
    }

    #[test]
    fn exhausts_at_upper_bound() {
        let id = DeviceIdentity::parse("DEV", "99999").unwrap();
        assert_eq!(
            id.next(),
            Err(IdentityError::Exhausted {
                prefix: "DEV".to_string()
            })
        );
    }

    #[test]
    fn rejects_short_prefix() {
        assert_eq!(validate("D", "00001"), Err(ValidationError::PrefixTooShort));
        assert_eq!(validate("", "00001"), Err(ValidationError::PrefixTooShort));
    }

    #[test]
    fn rejects_non_numeric_sequence() {
        assert!(matches!(
            validate("DEV", "00a01"),
            Err(ValidationError::SequenceNotNumeric(_))
        ));
        assert!(matches!(
            validate("DEV", "-0001"),
            Err(ValidationError::SequenceNotNumeric(_))
        ));
        assert!(matches!(
            validate("DEV", ""),
            Err(ValidationError::SequenceNotNumeric(_))
        ));
    }

    #[test]
    fn rejects_wrong_sequence_length() {
        assert_eq!(validate("DEV", "0001"), Err(ValidationError::SequenceLength(4)));
        assert_eq!(validate("DEV", "000001"), Err(ValidationError::SequenceLength(6)));
    }

    #[test]
    fn accepts_leading_zeros() {
        assert_eq!(validate("DEV", "00042"), Ok(42));
    }

    #[test]
    fn firmware_path_requires_bin_suffix() {
        assert!(validate_firmware_path(Path::new("build/app.bin")).is_ok());
        assert!(validate_firmware_path(Path::new("build/app.elf")).is_err());
        assert!(validate_firmware_path(Path::new("")).is_err());
    }
}
