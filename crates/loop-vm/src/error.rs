//! Runtime error kinds. Every variant is also a distinct process exit code
//! (§7), in the declaration order below — `None` maps conceptually to a
//! clean run and is never itself constructed as an error value; `loop-cli`
//! emits exit code `0` for `Ok(())` and `exit_code()` for `Err(e)`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("unknown opcode 0x{opcode:02x}")]
    UnknownOpcode { opcode: u8 },

    #[error("stack overflow")]
    StackOverflow,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("variable '{name}' is already defined")]
    VariableRedefinition { name: String },

    #[error("undefined reference '{name}'")]
    UndefinedReference { name: String },

    #[error("value of type {got} is not callable")]
    NonCallable { got: &'static str },

    #[error("expected {expected} arguments, got {got}")]
    WrongArgumentsCount { expected: usize, got: usize },

    #[error("I/O error: {message}")]
    IOError { message: String },

    #[error("expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("division by zero")]
    ZeroDivision,

    #[error("invalid module JSON: {message}")]
    InvalidJSON { message: String },

    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error("index out of range")]
    OutOfRange,

    #[error("circular import of module '{path}'")]
    CircularImport { path: String },

    #[error("unhandled exception")]
    UnhandledException,
}

impl VmError {
    /// The process exit code for this error, per the declaration order of
    /// the original `Error` enum (`None = 0`, ..., `UnhandledException`
    /// last). `VmError` itself has no `None` variant — a clean run is
    /// `Ok(())`, mapped to exit code `0` at the CLI boundary — so every
    /// discriminant here starts one past it.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let discriminant = match self {
            VmError::OutOfMemory => 1,
            VmError::UnknownOpcode { .. } => 2,
            VmError::StackOverflow => 3,
            VmError::StackUnderflow => 4,
            VmError::VariableRedefinition { .. } => 5,
            VmError::UndefinedReference { .. } => 6,
            VmError::NonCallable { .. } => 7,
            VmError::WrongArgumentsCount { .. } => 8,
            VmError::IOError { .. } => 9,
            VmError::TypeMismatch { .. } => 10,
            VmError::ZeroDivision => 11,
            VmError::InvalidJSON { .. } => 12,
            VmError::FileNotFound { .. } => 13,
            VmError::OutOfRange => 14,
            VmError::CircularImport { .. } => 15,
            VmError::UnhandledException => 16,
        };
        discriminant
    }

    /// Whether this error is classified fatal (§7): surfaced immediately,
    /// never caught by a `Throw` handler. All other variants are
    /// user-visible runtime errors that unwind the dispatch loop the same
    /// way but are conceptually "ordinary" failures.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::OutOfMemory | VmError::UnknownOpcode { .. })
    }
}
