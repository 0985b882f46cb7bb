//! Error types for the PIM compiler

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
///
/// Every variant is terminal for the current compilation: the pipeline never
/// emits a partial instruction stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Lexer error at position {position}: {message}")]
    LexerError { position: usize, message: String },

    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Invalid kernel: {message}")]
    InvalidKernel { message: String },

    #[error("Unresolved index in access to `{operand}`: {reason}")]
    UnresolvedIndex { operand: String, reason: String },

    #[error("Memory regions of `{first}` and `{second}` overlap")]
    Overlap { first: String, second: String },

    #[error("Invalid memory layout: {message}")]
    InvalidLayout { message: String },

    #[error("Access to `{operand}` out of bounds: {message}")]
    AccessOutOfBounds { operand: String, message: String },

    #[error("PIM address space exhausted: need {required} bytes, {available} available")]
    CapacityExceeded { required: u64, available: u64 },

    #[error("Unsupported operator `{operator}` in kernel body")]
    UnsupportedOperator { operator: String },

    #[error("Unsupported expression: {message}")]
    UnsupportedExpression { message: String },

    #[error("Unbound operand `{name}`: no memory region is mapped for it")]
    UnboundOperand { name: String },

    #[error("Register pressure: {message}")]
    RegisterPressure { message: String },

    #[error("Value does not fit the instruction encoding: {message}")]
    EncodingRange { message: String },

    #[error("Invalid architecture configuration: {message}")]
    Config { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },
}

impl CompileError {
    pub fn lexer(position: usize, msg: impl Into<String>) -> Self {
        CompileError::LexerError { position, message: msg.into() }
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        CompileError::ParseError { message: msg.into() }
    }

    pub fn invalid_kernel(msg: impl Into<String>) -> Self {
        CompileError::InvalidKernel { message: msg.into() }
    }

    pub fn unresolved(operand: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::UnresolvedIndex {
            operand: operand.into(),
            reason: reason.into(),
        }
    }

    pub fn out_of_bounds(operand: impl Into<String>, msg: impl Into<String>) -> Self {
        CompileError::AccessOutOfBounds {
            operand: operand.into(),
            message: msg.into(),
        }
    }

    pub fn unsupported_op(operator: impl Into<String>) -> Self {
        CompileError::UnsupportedOperator { operator: operator.into() }
    }

    pub fn unsupported_expr(msg: impl Into<String>) -> Self {
        CompileError::UnsupportedExpression { message: msg.into() }
    }

    pub fn unbound(name: impl Into<String>) -> Self {
        CompileError::UnboundOperand { name: name.into() }
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        CompileError::EncodingRange { message: msg.into() }
    }

    pub fn invalid_layout(msg: impl Into<String>) -> Self {
        CompileError::InvalidLayout { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CompileError::Config { message: msg.into() }
    }

    /// Short name of the error kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            CompileError::LexerError { .. } => "LexerError",
            CompileError::ParseError { .. } => "ParseError",
            CompileError::InvalidKernel { .. } => "InvalidKernel",
            CompileError::UnresolvedIndex { .. } => "UnresolvedIndexError",
            CompileError::Overlap { .. } => "OverlapError",
            CompileError::InvalidLayout { .. } => "InvalidLayout",
            CompileError::AccessOutOfBounds { .. } => "AccessOutOfBounds",
            CompileError::CapacityExceeded { .. } => "CapacityExceeded",
            CompileError::UnsupportedOperator { .. } => "UnsupportedOperatorError",
            CompileError::UnsupportedExpression { .. } => "UnsupportedExpression",
            CompileError::UnboundOperand { .. } => "UnboundOperandError",
            CompileError::RegisterPressure { .. } => "RegisterPressure",
            CompileError::EncodingRange { .. } => "EncodingRange",
            CompileError::Config { .. } => "ConfigError",
            CompileError::Io { .. } => "IoError",
        }
    }
}

impl From<std::io::Error> for CompileError {
    fn from(err: std::io::Error) -> Self {
        CompileError::Io { message: err.to_string() }
    }
}
