//! Script Executor Contract
//!
//! The scripting engine and the source loader are collaborators of the bridge.
//! The bridge only relies on the narrow interfaces defined here.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::codec::ConfigStyle;
use crate::error::LifecycleError;

/// Global the module configuration is injected under.
pub const CONFIG_GLOBAL: &str = "__conduitConfig";

/// An error raised by the scripting engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Receives a queue the engine flushed in the middle of executing script.
pub type FlushSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Looks up the full configuration entry of one module by name. Engines given
/// the minimal configuration use it to discover a module on first access.
pub type ModuleConfigProvider = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;

/// The scripting engine.
///
/// Every method is called on the script-affinity context, one at a time.
/// Methods returning `Option<Value>` hand back the flushed call queue in the
/// wire batch shape; `None` means there was nothing to flush.
pub trait ScriptExecutor: Send + Sync + 'static {
    /// Declared type name; also the module name of the executor.
    fn type_name(&self) -> &str;

    /// Create the runtime.
    fn open_runtime(&self) -> Result<(), ScriptError>;

    /// Install the sink for immediate flushes.
    fn set_flush_sink(&self, _sink: FlushSink) {}

    /// Install the lookup for lazily discovered modules.
    fn set_module_config_provider(&self, _provider: ModuleConfigProvider) {}

    /// Expose a JSON document to scripts under a global name.
    fn inject_configuration(&self, global: &str, json: &str) -> Result<(), ScriptError>;

    /// Evaluate loaded source.
    fn execute_source(&self, source: &Source) -> Result<(), ScriptError>;

    /// Collect the calls queued by the script side.
    fn flush_queue(&self) -> Result<Option<Value>, ScriptError>;

    /// Call `module.method(args)` on the script side and collect the queue.
    fn call_function(
        &self,
        module: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Option<Value>, ScriptError>;

    /// Invoke a script callback by id and collect the queue.
    fn invoke_callback(&self, callback_id: u64, args: &[Value]) -> Result<Option<Value>, ScriptError>;

    /// Shape of the module configuration this engine expects.
    fn config_style(&self) -> ConfigStyle {
        ConfigStyle::Full
    }

    /// Tear the runtime down.
    fn invalidate(&self);

    fn is_valid(&self) -> bool;
}

// ─────────────────────────────────────────────────────────────────────────────
// Source Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Loaded script source.
#[derive(Debug, Clone)]
pub struct Source {
    pub url: String,
    pub bytes: Arc<[u8]>,
}

impl Source {
    pub fn new(url: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            url: url.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The source as UTF-8 text.
    pub fn text(&self) -> Result<&str, LifecycleError> {
        std::str::from_utf8(&self.bytes)
            .map_err(|e| LifecycleError::SourceLoad(format!("{}: {}", self.url, e)))
    }
}

/// Progress of a source load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub done: usize,
    pub total: Option<usize>,
}

/// Receives load progress.
pub type ProgressFn = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Loads script source bytes.
#[async_trait]
pub trait SourceLoader: Send + Sync + 'static {
    async fn load(&self, url: &str, progress: ProgressFn) -> Result<Source, LifecycleError>;
}

/// Serves source held in memory.
#[derive(Debug, Clone)]
pub struct StaticSourceLoader {
    bytes: Arc<[u8]>,
}

impl StaticSourceLoader {
    pub fn new(source: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: source.into().into(),
        }
    }
}

#[async_trait]
impl SourceLoader for StaticSourceLoader {
    async fn load(&self, url: &str, progress: ProgressFn) -> Result<Source, LifecycleError> {
        progress(LoadProgress {
            done: self.bytes.len(),
            total: Some(self.bytes.len()),
        });
        Ok(Source::new(url, Arc::clone(&self.bytes)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Diagnostics
// ─────────────────────────────────────────────────────────────────────────────

/// Shows errors to a developer, e.g. an error overlay.
pub trait DiagnosticSurface: Send + Sync + 'static {
    fn show_error(&self, message: &str, stack: &str);
}
