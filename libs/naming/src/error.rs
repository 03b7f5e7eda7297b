//! Error types for name parsing and validation.

use thiserror::Error;

/// Errors that can occur when validating a node-group name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name is longer than a label value may be.
    #[error("name too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },

    /// The name contains a character outside `[A-Za-z0-9._-]`.
    #[error("invalid character {found:?} at position {position}")]
    InvalidCharacter { found: char, position: usize },

    /// The name does not start and end with an alphanumeric character.
    #[error("name must start and end with an alphanumeric character")]
    InvalidBoundary,
}

impl NameError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, NameError::Empty)
    }
}
