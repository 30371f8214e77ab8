//! Error types for the QuickJS executor.

use conduit_bridge::ScriptError;

/// Errors raised outside of script execution.
#[derive(Debug, thiserror::Error)]
pub enum JsError {
    #[error("Failed to create runtime: {0}")]
    RuntimeCreation(String),

    #[error("Runtime is not open")]
    NotOpen,

    #[error("Source is not valid UTF-8: {0}")]
    InvalidSource(String),

    #[error("Type conversion error: {0}")]
    Conversion(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] rquickjs::Error),
}

pub type JsResult<T> = Result<T, JsError>;

impl From<JsError> for ScriptError {
    fn from(error: JsError) -> Self {
        ScriptError::new(error.to_string())
    }
}
