//! Error kinds for the middle end.
//!
//! Builder-time errors carry source locations and abort compilation;
//! verifier errors are internal compiler errors and carry the dump of the
//! IR that failed verification. There is no partial-output mode: every
//! error propagates synchronously to the driver.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MidendError {
    /// Reported by the parser collaborator; passed through unchanged.
    #[error("error: {0}")]
    Source(String),

    /// Type mismatch while building IR from the AST.
    #[error("type error at {line}:{col}: {message}")]
    Type { message: String, line: u32, col: u32 },

    /// Structural invariant violation caught by the verifier. Always a
    /// compiler bug, never a user error.
    #[error("internal compiler error: IR verification failed: {message}")]
    Verifier { message: String, ir_dump: String },

    /// The source language permits a construct this crate does not build.
    #[error("internal compiler error: unsupported construct: {0}")]
    Unsupported(String),

    /// A configured pass name did not resolve.
    #[error("unknown pass: {0}")]
    UnknownPass(String),
}

impl MidendError {
    pub fn type_error(message: impl Into<String>, line: u32, col: u32) -> Self {
        MidendError::Type { message: message.into(), line, col }
    }
}

pub type Result<T> = std::result::Result<T, MidendError>;
