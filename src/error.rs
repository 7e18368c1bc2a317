//! Error types for the jitprof instrumentation subsystem

use std::fmt;
use thiserror::Error;

use crate::ir::{BlockId, ValueId};

/// Which instrumentation stage raised a contract violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Before the optimizer transforms the function
    PreOptimization,
    /// After the optimizer has transformed the function
    PostOptimization,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::PreOptimization => write!(f, "pre-optimization"),
            Stage::PostOptimization => write!(f, "post-optimization"),
        }
    }
}

/// Main error type for jitprof
#[derive(Error, Debug)]
pub enum Error {
    /// An annotation attached to a function does not have the agreed shape
    #[error("MalformedAnnotation: `{key}` on `{function}`: {reason}")]
    MalformedAnnotation {
        function: String,
        key: String,
        reason: String,
    },

    /// The branch-slot sequence no longer matches the function's block count
    #[error("ShapeMismatch: `{function}` has {slots} branch slots but {blocks} blocks ({stage})")]
    ShapeMismatch {
        function: String,
        slots: usize,
        blocks: usize,
        stage: Stage,
    },

    /// Structurally invalid IR
    #[error("InvalidIr: {0}")]
    InvalidIr(String),

    /// A call referenced a symbol the extern table cannot resolve
    #[error("ExecError: unknown symbol `{0}`")]
    UnknownSymbol(String),

    /// A call referenced an address the extern table cannot resolve
    #[error("ExecError: unknown callee address {0:#x}")]
    UnknownAddress(u64),

    /// A value was read before being defined on the executed path
    #[error("ExecError: {value} used before definition in {block}")]
    UndefinedValue { value: ValueId, block: BlockId },

    /// Integer division or remainder by zero
    #[error("ExecError: division by zero")]
    DivisionByZero,

    /// The executor ran past its step budget
    #[error("ExecError: step limit of {0} exceeded")]
    StepLimitExceeded(u64),

    /// Wrong number of function or block arguments
    #[error("ExecError: {target} expects {expected} arguments, got {actual}")]
    ArityMismatch {
        target: String,
        expected: usize,
        actual: usize,
    },

    /// Invalid profiler configuration
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// JSON encoding/decoding error
    #[error("JsonError: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a malformed-annotation error
    pub fn malformed(
        function: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::MalformedAnnotation {
            function: function.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-IR error
    pub fn invalid_ir(message: impl Into<String>) -> Self {
        Error::InvalidIr(message.into())
    }

    /// Whether this error is a contract violation that must stop the pipeline
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::MalformedAnnotation { .. } | Error::ShapeMismatch { .. } | Error::InvalidIr(_)
        )
    }
}

/// Result type for jitprof operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_display() {
        let err = Error::malformed("foo", "jitprof.flags", "expected 4 entries, got 3");
        assert_eq!(
            err.to_string(),
            "MalformedAnnotation: `jitprof.flags` on `foo`: expected 4 entries, got 3"
        );
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = Error::ShapeMismatch {
            function: "bar".into(),
            slots: 3,
            blocks: 5,
            stage: Stage::PreOptimization,
        };
        assert!(err.to_string().contains("3 branch slots but 5 blocks"));
        assert!(err.to_string().contains("pre-optimization"));
    }

    #[test]
    fn test_exec_errors_are_not_contract_violations() {
        assert!(!Error::DivisionByZero.is_contract_violation());
        assert!(!Error::UnknownSymbol("x".into()).is_contract_violation());
    }
}
