//! Error types for the bridge.
//!
//! Protocol and resolution errors degrade a single batch or call. Lifecycle
//! errors stop a bridge generation from loading. Fatal errors end a generation
//! and are always surfaced to the host.

/// A malformed call batch. The whole batch is dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Batch is not an array")]
    NotAnArray,

    #[error("Batch has {0} sections, expected at least 3")]
    TooShort(usize),

    #[error("Batch section {0} is not an array")]
    SectionNotArray(usize),

    #[error("Invalid id in section {section} at index {index}")]
    InvalidId { section: usize, index: usize },

    #[error("Parameters for call {0} are not an array")]
    InvalidParams(usize),

    #[error(
        "Batch sections differ in length: {modules} module ids, {methods} method ids, {params} parameter lists"
    )]
    LengthMismatch {
        modules: usize,
        methods: usize,
        params: usize,
    },

    #[error("Failed to parse batch: {0}")]
    Parse(String),
}

/// An unknown module or method. Only the affected call is skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolutionError {
    #[error("Unknown module id: {0}")]
    UnknownModuleId(usize),

    #[error("Unknown method id {method_id} on module {module}")]
    UnknownMethodId { module: String, method_id: usize },

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Invalid call target '{0}', expected 'Module.method'")]
    InvalidTarget(String),
}

/// Errors that stop a bridge generation from loading or being used.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("Failed to load source: {0}")]
    SourceLoad(String),

    #[error("Failed to open script runtime: {0}")]
    RuntimeOpen(String),

    #[error("Failed to inject module configuration: {0}")]
    ConfigurationInjection(String),

    #[error("Failed to execute source: {0}")]
    SourceExecution(String),

    #[error("Failed to flush script queue: {0}")]
    QueueFlush(String),

    #[error("Failed to spawn execution context '{0}'")]
    ContextSpawn(String),

    #[error("Execution context '{0}' is closed")]
    ContextClosed(String),

    #[error("Bridge is not valid")]
    Invalidated,
}

/// Why a call into the script side could not be enqueued.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// A bridge-generation-ending condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FatalError {
    #[error("Exception thrown while invoking {method} on target {module} with params {params}: {message}")]
    Invocation {
        module: String,
        method: String,
        params: String,
        message: String,
    },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Unhandled script exception: {message}")]
    Script {
        message: String,
        stack: Option<String>,
    },
}

impl FatalError {
    /// Stack trace attached to the error, if the error came with one.
    pub fn stack(&self) -> Option<&str> {
        match self {
            FatalError::Script { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

/// Error returned by a native method.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModuleError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid argument {index} for {method}: {reason}")]
    InvalidArgument {
        method: String,
        index: usize,
        reason: String,
    },

    /// Already a fatal bridge error; passed through without wrapping.
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl ModuleError {
    pub fn failed(message: impl Into<String>) -> Self {
        ModuleError::Failed(message.into())
    }
}
