//! Error kinds and the result type threaded through lexer, parser, code
//! generator, and VM.

use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

/// A `{line, column}` pair pointing at a source location, carried by every
/// error and by bytecode debug entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct CodeLoc {
    pub line: u32,
    pub column: u32,
}

impl CodeLoc {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// The eight error kinds from the language's error model.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Raised by the lexer or parser; parsing continues after synchronization.
    Syntax,
    /// Raised by the code generator (bad jump target, invalid assignment
    /// target, `break`/`continue` outside a loop, oversized jump).
    Compile,
    /// An operation was applied to incompatible operands.
    Type,
    /// Wrong argument count to a callable.
    Arity,
    /// Integer division or modulo by zero.
    DivisionByZero,
    /// Out-of-bounds array/string index, or an unknown property on a
    /// nullish receiver.
    Index,
    /// Read of an undefined global or an uninitialized local.
    Reference,
    /// Miscellaneous domain errors (bad range step, etc.).
    Value,
}

/// A single diagnostic: kind, message, and the location it occurred at.
///
/// The location is absent for errors synthesized before any token has been
/// consumed (e.g. an empty source file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlateError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<CodeLoc>,
}

impl SlateError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), location: None }
    }

    #[must_use]
    pub fn at(kind: ErrorKind, message: impl Into<String>, location: CodeLoc) -> Self {
        Self { kind, message: message.into(), location: Some(location) }
    }

    #[must_use]
    pub fn with_location(mut self, location: CodeLoc) -> Self {
        self.location = Some(location);
        self
    }
}

impl fmt::Display for SlateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(loc) => write!(f, "{} at {loc}: {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for SlateError {}

/// Result alias used throughout the lexer, parser, code generator, and VM.
pub type RunResult<T> = Result<T, SlateError>;

/// Shorthand constructors, one per error kind, used at call sites so errors
/// read as `err::type_error("...")` rather than repeating `SlateError::new`.
pub mod err {
    use super::{ErrorKind, SlateError};

    #[must_use]
    pub fn syntax(msg: impl Into<String>) -> SlateError {
        SlateError::new(ErrorKind::Syntax, msg)
    }

    #[must_use]
    pub fn compile(msg: impl Into<String>) -> SlateError {
        SlateError::new(ErrorKind::Compile, msg)
    }

    #[must_use]
    pub fn type_error(msg: impl Into<String>) -> SlateError {
        SlateError::new(ErrorKind::Type, msg)
    }

    #[must_use]
    pub fn arity(msg: impl Into<String>) -> SlateError {
        SlateError::new(ErrorKind::Arity, msg)
    }

    #[must_use]
    pub fn division_by_zero(msg: impl Into<String>) -> SlateError {
        SlateError::new(ErrorKind::DivisionByZero, msg)
    }

    #[must_use]
    pub fn index(msg: impl Into<String>) -> SlateError {
        SlateError::new(ErrorKind::Index, msg)
    }

    #[must_use]
    pub fn reference(msg: impl Into<String>) -> SlateError {
        SlateError::new(ErrorKind::Reference, msg)
    }

    #[must_use]
    pub fn value(msg: impl Into<String>) -> SlateError {
        SlateError::new(ErrorKind::Value, msg)
    }
}
