//! Container ID validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LotseError, LotseResult};

/// A validated container ID.
///
/// Container IDs must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, hyphens, and underscores
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length of a container ID.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new container ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> LotseResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the container ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate a container ID string.
    fn validate(id: &str) -> LotseResult<()> {
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(LotseError::InvalidId { id: id.to_string() });
        }

        let first_char = id.chars().next().unwrap();
        if !first_char.is_ascii_alphanumeric() {
            return Err(LotseError::InvalidId { id: id.to_string() });
        }

        for c in id.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
                return Err(LotseError::InvalidId { id: id.to_string() });
            }
        }

        Ok(())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = LotseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_container_ids() {
        assert!(ContainerId::new("abc123").is_ok());
        assert!(ContainerId::new("my-container").is_ok());
        assert!(ContainerId::new("my_container").is_ok());
        assert!(ContainerId::new("Container-123_test").is_ok());
    }

    #[test]
    fn invalid_container_ids() {
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("-invalid").is_err());
        assert!(ContainerId::new("_invalid").is_err());
        assert!(ContainerId::new("invalid!").is_err());
        assert!(ContainerId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn parse_round_trip() {
        let id: ContainerId = "web-frontend_1".parse().unwrap();
        assert_eq!(id.as_str(), "web-frontend_1");
        assert_eq!(id.to_string(), "web-frontend_1");
    }

    proptest! {
        #[test]
        fn accepted_ids_survive_serde(id in "[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}") {
            let parsed = ContainerId::new(id.clone()).unwrap();
            let json = serde_json::to_string(&parsed).unwrap();
            let back: ContainerId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(parsed, back);
        }
    }
}
