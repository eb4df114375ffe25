//! Error types for the shared-function call pipeline.
//!
//! Every failure inside an engine-loop task is captured as a [`RuntimeError`]
//! and translated into a terminal [`FunctionCallState`] by the dispatcher;
//! task bodies never panic across the engine boundary.

use std::fmt;

use deno_core::error::JsError;
use thiserror::Error;

use crate::runtime::rpc::{
    FunctionCallState, ParamTag, ABORT_CONTRACT_VIOLATION, ABORT_ENGINE_ERROR, ABORT_TYPE_ERROR,
};

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Details captured from a JavaScript exception.
#[derive(Debug, Clone, Default)]
pub struct JsExceptionDetails {
    /// The `message` property of the thrown value, when present.
    pub message: Option<String>,
    /// The formatted exception line (e.g. `Uncaught Error: boom`).
    pub exception_message: String,
    /// The stack trace, when present.
    pub stack: Option<String>,
}

impl JsExceptionDetails {
    pub fn from_js_error(err: JsError) -> Self {
        Self {
            message: err.message.clone(),
            exception_message: err.exception_message.clone(),
            stack: err.stack.clone(),
        }
    }

    /// One-line summary suitable for a terminal state.
    pub fn summary(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| self.exception_message.clone())
    }
}

impl fmt::Display for JsExceptionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// User code threw or its promise rejected.
    #[error("javascript exception: {0}")]
    Javascript(JsExceptionDetails),

    /// A parameter's declared tag does not match the signature.
    #[error("parameter {index} has type `{actual}`, expected `{expected}`")]
    TypeMismatch {
        index: usize,
        expected: ParamTag,
        actual: ParamTag,
    },

    /// A parameter tag outside the supported vocabulary.
    #[error("unsupported parameter type `{tag}`")]
    UnsupportedType { tag: String },

    /// A parameter value whose shape does not match its own tag.
    #[error("parameter {index} value does not match its `{tag}` tag")]
    ValueShape { index: usize, tag: ParamTag },

    /// Parameter count differs from the signature length.
    #[error("expected {expected} parameters, got {actual}")]
    ParameterCount { expected: usize, actual: usize },

    /// Script compilation, context or value creation failed inside the engine.
    #[error("engine error: {context}")]
    Engine { context: String },

    /// The proxy wrapper broke its contract.
    #[error("contract violation: {context}")]
    ContractViolation { context: String },

    /// The engine is shutting down; submission was refused.
    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error("internal error: {context}")]
    Internal { context: String },
}

impl RuntimeError {
    pub fn internal(context: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
        }
    }

    pub fn engine(context: impl Into<String>) -> Self {
        Self::Engine {
            context: context.into(),
        }
    }

    pub fn contract(context: impl Into<String>) -> Self {
        Self::ContractViolation {
            context: context.into(),
        }
    }

    pub fn javascript(details: JsExceptionDetails) -> Self {
        Self::Javascript(details)
    }

    /// Map a pipeline failure to the terminal state delivered to the caller.
    ///
    /// Input errors are recovered locally and never reach the engine; user
    /// exceptions carry the stringified message; everything else is an abort.
    pub fn terminal_state(&self) -> FunctionCallState {
        match self {
            RuntimeError::Javascript(details) => FunctionCallState::exception(details.summary()),
            RuntimeError::TypeMismatch { .. }
            | RuntimeError::UnsupportedType { .. }
            | RuntimeError::ValueShape { .. }
            | RuntimeError::ParameterCount { .. } => FunctionCallState::aborted(ABORT_TYPE_ERROR),
            RuntimeError::ContractViolation { .. } => {
                FunctionCallState::aborted(ABORT_CONTRACT_VIOLATION)
            }
            RuntimeError::Engine { .. }
            | RuntimeError::ShuttingDown
            | RuntimeError::Internal { .. } => FunctionCallState::aborted(ABORT_ENGINE_ERROR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::js_value::JSValue;

    #[test]
    fn test_input_errors_abort_with_type_error() {
        let err = RuntimeError::TypeMismatch {
            index: 1,
            expected: ParamTag::String,
            actual: ParamTag::Number,
        };
        assert_eq!(
            err.terminal_state(),
            FunctionCallState::aborted(ABORT_TYPE_ERROR)
        );

        let err = RuntimeError::ParameterCount {
            expected: 2,
            actual: 0,
        };
        assert_eq!(
            err.terminal_state(),
            FunctionCallState::aborted(ABORT_TYPE_ERROR)
        );
    }

    #[test]
    fn test_javascript_errors_surface_the_message() {
        let err = RuntimeError::javascript(JsExceptionDetails {
            message: Some("boom".to_string()),
            exception_message: "Uncaught Error: boom".to_string(),
            stack: None,
        });
        assert_eq!(err.terminal_state(), FunctionCallState::exception("boom"));
    }

    #[test]
    fn test_engine_and_scheduler_errors_abort() {
        assert_eq!(
            RuntimeError::engine("compile failed").terminal_state(),
            FunctionCallState::aborted(ABORT_ENGINE_ERROR)
        );
        assert_eq!(
            RuntimeError::ShuttingDown.terminal_state(),
            FunctionCallState::aborted(ABORT_ENGINE_ERROR)
        );
        assert_eq!(
            RuntimeError::contract("non-promise").terminal_state(),
            FunctionCallState::aborted(ABORT_CONTRACT_VIOLATION)
        );
    }

    #[test]
    fn test_summary_prefers_the_message() {
        let details = JsExceptionDetails {
            message: Some("nope".to_string()),
            exception_message: "Uncaught nope".to_string(),
            stack: None,
        };
        assert_eq!(details.summary(), "nope");

        let details = JsExceptionDetails {
            message: None,
            exception_message: "Uncaught nope".to_string(),
            stack: None,
        };
        assert_eq!(details.summary(), "Uncaught nope");
    }

    #[test]
    fn test_exception_state_is_not_ok() {
        let state = RuntimeError::javascript(JsExceptionDetails::default()).terminal_state();
        assert!(!state.is_ok());
        assert_ne!(state, FunctionCallState::ok(JSValue::Null));
    }
}
