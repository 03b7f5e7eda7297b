//! # groupscale-naming
//!
//! Names for node groups and their members.
//!
//! ## Design Principles
//!
//! - A group name is used verbatim as a label value, so it follows label-value
//!   rules and is validated once at the edge
//! - Member names are system-generated from the group name plus a unique suffix
//! - Generation is behind a trait so callers can inject deterministic names
//!
//! ## Name Format
//!
//! Generated member names use `{group}-{suffix}`:
//! - `pool-a-4817229356651738115` (random, the default)
//! - `pool-a-0`, `pool-a-1` (sequential, for tests)

mod error;
mod generator;

pub use error::NameError;
pub use generator::{NameGenerator, RandomSuffix, SequentialNames};

use std::fmt;
use std::str::FromStr;

/// Maximum length of a label value.
pub const MAX_NAME_LEN: usize = 63;

/// A validated node-group name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupName(String);

impl GroupName {
    /// Parses and validates a group name.
    pub fn parse(s: &str) -> Result<Self, NameError> {
        if s.is_empty() {
            return Err(NameError::Empty);
        }

        let len = s.chars().count();
        if len > MAX_NAME_LEN {
            return Err(NameError::TooLong {
                len,
                max: MAX_NAME_LEN,
            });
        }

        for (position, c) in s.chars().enumerate() {
            if !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
                return Err(NameError::InvalidCharacter { found: c, position });
            }
        }

        let first = s.chars().next();
        let last = s.chars().last();
        let alnum = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
        if !alnum(first) || !alnum(last) {
            return Err(NameError::InvalidBoundary);
        }

        Ok(Self(s.to_string()))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the name and returns the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GroupName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for GroupName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for GroupName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for GroupName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_names() {
        for name in ["pool-a", "a", "default_pool", "gpu.large-2", "A1"] {
            assert!(GroupName::parse(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_empty_name() {
        let err = GroupName::parse("").unwrap_err();
        assert!(err.is_empty());
    }

    #[test]
    fn test_too_long() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            GroupName::parse(&name),
            Err(NameError::TooLong {
                len: MAX_NAME_LEN + 1,
                max: MAX_NAME_LEN
            })
        );
        assert!(GroupName::parse(&"a".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_invalid_character() {
        assert_eq!(
            GroupName::parse("pool a"),
            Err(NameError::InvalidCharacter {
                found: ' ',
                position: 4
            })
        );
        assert!(GroupName::parse("pool/a").is_err());
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(GroupName::parse("-pool"), Err(NameError::InvalidBoundary));
        assert_eq!(GroupName::parse("pool."), Err(NameError::InvalidBoundary));
    }

    #[test]
    fn test_serde() {
        let name = GroupName::parse("pool-a").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"pool-a\"");

        let bad: Result<GroupName, _> = serde_json::from_str("\"-bad\"");
        assert!(bad.is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_names_display_unchanged(s in "[a-z0-9]([a-z0-9._-]{0,61}[a-z0-9])?") {
            let name = GroupName::parse(&s).unwrap();
            prop_assert_eq!(name.to_string(), s);
        }
    }
}
