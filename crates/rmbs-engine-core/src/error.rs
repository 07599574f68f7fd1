use thiserror::Error;

/// Subkinds of failure inside the expression engine (spec §4.2, §7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("unknown identifier '{0}'")]
    NameError(String),

    #[error("type error in '{context}': {reason}")]
    TypeError { context: String, reason: String },

    #[error("division by zero in '{context}'")]
    DivisionByZero { context: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("syntax error at position {pos}: {reason}")]
    SyntaxError { pos: usize, reason: String },
}

/// Top-level error surface of the engine (spec §7).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("schema violation at {path}: {reason}")]
    SchemaViolation { path: String, reason: String },

    #[error("logic integrity violation: {0}")]
    LogicIntegrity(String),

    #[error("evaluation error in '{expression}': {source}")]
    Evaluation {
        expression: String,
        #[source]
        source: EvalError,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::SchemaViolation {
            path: "<root>".into(),
            reason: e.to_string(),
        }
    }
}

impl From<EvalError> for EngineError {
    fn from(e: EvalError) -> Self {
        EngineError::Evaluation {
            expression: String::new(),
            source: e,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
