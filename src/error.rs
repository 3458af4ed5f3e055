//! Error surface for grammar compilation and matching.
//!
//! Every fallible entry point returns [`Error`]; callers can branch on the
//! kind. Internal invariants use `debug_assert!` and are never reachable
//! from well-formed input.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Syntax error in an EBNF grammar, regex, JSON schema, or structural
    /// tag. `line`/`column` are 1-based for text sources and 0 when the
    /// source has no meaningful text position (e.g. a JSON document).
    #[error("parse error at line {line}, column {column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    /// Semantic rule violation: undefined rule, duplicate rule, inverted
    /// range, prefix-colliding triggers, and the like.
    #[error("validation error: {0}")]
    Validation(String),

    /// FSM determinization or intersection exceeded the configured state
    /// budget. Retry with a larger budget.
    #[error("FSM state budget exceeded ({budget} states)")]
    BudgetExceeded { budget: usize },

    /// Invalid matcher operation: rollback out of range, token id out of
    /// range, or an operation on a terminated matcher without reset.
    #[error("matcher error: {0}")]
    Matcher(String),

    /// Malformed serialized grammar or FSM blob.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub(crate) fn parse_at(line: usize, column: usize, message: impl Into<String>) -> Self {
        Error::Parse {
            line,
            column,
            message: message.into(),
        }
    }

    /// A parse error with no text position.
    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Error::Parse {
            line: 0,
            column: 0,
            message: message.into(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub(crate) fn matcher(message: impl Into<String>) -> Self {
        Error::Matcher(message.into())
    }

    pub(crate) fn serialization(message: impl Into<String>) -> Self {
        Error::Serialization(message.into())
    }
}
