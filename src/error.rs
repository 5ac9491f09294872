//! Error types for the metajit specialization engine

use std::fmt;
use thiserror::Error;

use crate::bytecode::Location;

/// Faults a running program can raise
///
/// These are program-level errors: every executor (the interpreter, the
/// fallback interpreter and compiled units) raises the same kind at the same
/// point in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// Operand of the wrong type for an operation
    TypeError,
    /// Integer division or remainder by zero
    DivisionByZero,
    /// Field index outside a tuple
    IndexError,
    /// Nested calls exceeded the configured depth
    StackOverflow,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErrorKind::TypeError => write!(f, "TypeError"),
            RuntimeErrorKind::DivisionByZero => write!(f, "DivisionByZero"),
            RuntimeErrorKind::IndexError => write!(f, "IndexError"),
            RuntimeErrorKind::StackOverflow => write!(f, "StackOverflow"),
        }
    }
}

/// Main error type for metajit
#[derive(Error, Debug)]
pub enum Error {
    /// A fault raised by the running program
    #[error("{kind}: {message}")]
    Runtime {
        kind: RuntimeErrorKind,
        message: String,
    },

    /// A malformed program or an invalid resume request
    #[error("ProgramError: {0}")]
    Program(String),

    /// Two specialized arms could not be merged even though their split was
    /// classified as simple
    #[error("MergeIncompatible: {0}")]
    MergeIncompatible(String),

    /// The fallback interpreter met an instruction it cannot execute
    #[error("FallbackGap: {message} at {location}")]
    FallbackGap { location: Location, message: String },

    /// Invalid engine configuration
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON decoding error
    #[error("JsonError: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a TypeError
    pub fn type_error(message: impl Into<String>) -> Self {
        Error::Runtime {
            kind: RuntimeErrorKind::TypeError,
            message: message.into(),
        }
    }

    /// Create a DivisionByZero error
    pub fn division_by_zero() -> Self {
        Error::Runtime {
            kind: RuntimeErrorKind::DivisionByZero,
            message: "integer division by zero".to_string(),
        }
    }

    /// Create an IndexError
    pub fn index_error(message: impl Into<String>) -> Self {
        Error::Runtime {
            kind: RuntimeErrorKind::IndexError,
            message: message.into(),
        }
    }

    /// Create a StackOverflow error
    pub fn stack_overflow(depth: usize) -> Self {
        Error::Runtime {
            kind: RuntimeErrorKind::StackOverflow,
            message: format!("call depth exceeded {}", depth),
        }
    }

    /// Create a program error
    pub fn program(message: impl Into<String>) -> Self {
        Error::Program(message.into())
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Kind of a runtime fault, if this is one
    pub fn runtime_kind(&self) -> Option<RuntimeErrorKind> {
        match self {
            Error::Runtime { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Internal-consistency failures that must shut specialization down
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::MergeIncompatible(_) | Error::FallbackGap { .. })
    }
}

/// Result type alias for metajit operations
pub type Result<T> = std::result::Result<T, Error>;
