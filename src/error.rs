//! Error types for the grounding pipeline.
//!
//! Three kinds of failure flow through the core:
//!
//! - **User-grounded errors** (`UngroundedPattern`, `NotInvertible`): the input
//!   program asks for something the analysis cannot ground. Surfaced to the
//!   caller, which wraps them in its compilation-error envelope.
//! - **Invariant violations** (`Internal`, `TypeMismatch`,
//!   `PatternMustBeIdentifier`): bugs in the caller or in the core. Never
//!   recovered from.
//! - **Recoverable heuristic failures**: the inverter returns `None` and the
//!   caller tries the next strategy. These never become a `GroundError`.

use thiserror::Error;

/// Errors surfaced by the grounding core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GroundError {
    /// A used pattern could not be given a finite generator
    #[error("unbounded variable '{pattern}' is not grounded by any predicate: {reason}")]
    UngroundedPattern { pattern: String, reason: String },

    /// Pattern-flattening hit a non-identifier in a position that must be an id
    #[error("pattern must be an identifier, found '{found}' in {position}")]
    PatternMustBeIdentifier { found: String, position: String },

    /// Transitive-closure analysis hit a non-invertible base case
    #[error("expression is not invertible: {0}")]
    NotInvertible(String),

    /// A generator or scan expression does not match its pattern's type
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Internal invariant violated (a bug, not a user error)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for grounding operations
pub type GroundResult<T> = Result<T, GroundError>;
