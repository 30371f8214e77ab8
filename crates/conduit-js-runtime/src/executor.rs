//! QuickJS Executor
//!
//! Runs the script side of the bridge in a QuickJS runtime. Values cross the
//! engine boundary as JSON text, and the script-side queue is implemented by
//! the prelude evaluated when the runtime opens.

use std::sync::Arc;

use conduit_bridge::executor::{FlushSink, ModuleConfigProvider};
use conduit_bridge::{ConfigStyle, ScriptError, ScriptExecutor, Source};
use parking_lot::Mutex;
use rquickjs::context::EvalOptions;
use rquickjs::convert::Coerced;
use rquickjs::{Context, Ctx, Exception, FromJs, Function, Object, Runtime, Value as JsValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JsError;
use crate::globals::register_globals;

/// Global holding the script side of the bridge.
pub const BATCHED_BRIDGE_GLOBAL: &str = "__conduitBatchedBridge";

const PRELUDE: &str = include_str!("prelude.js");

/// Limits applied to each runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickJsConfig {
    /// Heap limit in bytes
    pub memory_limit: Option<usize>,
    /// Stack limit in bytes
    pub max_stack_size: Option<usize>,
    /// Allocation volume that triggers a collection
    pub gc_threshold: Option<usize>,
}

struct Engine {
    runtime: Runtime,
    context: Context,
}

impl Engine {
    fn open(
        config: &QuickJsConfig,
        sink: Arc<Mutex<Option<FlushSink>>>,
        module_config: Arc<Mutex<Option<ModuleConfigProvider>>>,
    ) -> Result<Self, ScriptError> {
        let runtime = Runtime::new().map_err(|e| JsError::RuntimeCreation(e.to_string()))?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = config.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        if let Some(threshold) = config.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }
        let context = Context::full(&runtime).map_err(|e| JsError::RuntimeCreation(e.to_string()))?;

        let engine = Self { runtime, context };
        engine.with(|ctx| {
            register_globals(&ctx, sink, module_config).map_err(|e| script_error(&ctx, e))?;
            ctx.eval::<(), _>(PRELUDE).map_err(|e| script_error(&ctx, e))
        })?;
        Ok(engine)
    }

    fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Ctx<'_>) -> R,
    {
        self.context.with(f)
    }

    /// Call a function on the bridge global.
    fn call_bridge<A>(&self, name: &str, args: A) -> Result<(), ScriptError>
    where
        A: for<'js> rquickjs::function::IntoArgs<'js>,
    {
        self.with(|ctx| {
            let function = bridge_function(&ctx, name)?;
            function.call::<_, ()>(args).map_err(|e| script_error(&ctx, e))
        })
    }

    /// Run queued promise jobs, so reactions to callbacks enqueue their calls.
    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => tracing::warn!("Pending script job threw"),
            }
        }
    }

    fn flushed_queue(&self) -> Result<Option<Value>, ScriptError> {
        self.drain_jobs();
        let text = self.with(|ctx| {
            let function = bridge_function(&ctx, "flushedQueue")?;
            function
                .call::<_, Option<String>>(())
                .map_err(|e| script_error(&ctx, e))
        })?;
        match text {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| JsError::Conversion(e.to_string()).into()),
            None => Ok(None),
        }
    }
}

fn bridge_function<'js>(ctx: &Ctx<'js>, name: &str) -> Result<Function<'js>, ScriptError> {
    let bridge: Object = ctx
        .globals()
        .get(BATCHED_BRIDGE_GLOBAL)
        .map_err(|e| script_error(ctx, e))?;
    bridge.get(name).map_err(|e| script_error(ctx, e))
}

fn parse_json<'js>(ctx: &Ctx<'js>, json: &str) -> rquickjs::Result<JsValue<'js>> {
    let parse: Function = ctx.globals().get::<_, Object>("JSON")?.get("parse")?;
    parse.call((json,))
}

/// Convert an engine error, taking the thrown value if there is one.
fn script_error(ctx: &Ctx<'_>, error: rquickjs::Error) -> ScriptError {
    if !matches!(error, rquickjs::Error::Exception) {
        return ScriptError::new(error.to_string());
    }
    exception_to_error(ctx, ctx.catch())
}

fn exception_to_error<'js>(ctx: &Ctx<'js>, thrown: JsValue<'js>) -> ScriptError {
    if let Ok(object) = thrown.clone().try_into_object() {
        if let Some(exception) = Exception::from_object(object) {
            let message = exception
                .message()
                .unwrap_or_else(|| "Unknown script exception".to_string());
            let error = ScriptError::new(message);
            return match exception.stack().filter(|s| !s.is_empty()) {
                Some(stack) => error.with_stack(stack),
                None => error,
            };
        }
    }

    match Coerced::<String>::from_js(ctx, thrown) {
        Ok(message) => ScriptError::new(message.0),
        Err(e) => ScriptError::new(format!("Unprintable script exception: {}", e)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

/// A [`ScriptExecutor`] backed by QuickJS.
pub struct QuickJsExecutor {
    config: QuickJsConfig,
    engine: Mutex<Option<Engine>>,
    sink: Arc<Mutex<Option<FlushSink>>>,
    module_config: Arc<Mutex<Option<ModuleConfigProvider>>>,
}

impl QuickJsExecutor {
    pub fn new(config: QuickJsConfig) -> Self {
        Self {
            config,
            engine: Mutex::new(None),
            sink: Arc::new(Mutex::new(None)),
            module_config: Arc::new(Mutex::new(None)),
        }
    }

    fn with_engine<R>(&self, f: impl FnOnce(&Engine) -> Result<R, ScriptError>) -> Result<R, ScriptError> {
        let engine = self.engine.lock();
        let engine = engine.as_ref().ok_or(JsError::NotOpen)?;
        f(engine)
    }

    /// Evaluate an expression and return its JSON value. Intended for hosts
    /// and tests that inspect script state.
    pub fn evaluate(&self, expression: &str) -> Result<Value, ScriptError> {
        self.with_engine(|engine| {
            let text = engine.with(|ctx| {
                let wrapped = format!("JSON.stringify(({}))", expression);
                ctx.eval::<Option<String>, _>(wrapped)
                    .map_err(|e| script_error(&ctx, e))
            })?;
            match text {
                Some(text) => serde_json::from_str(&text)
                    .map_err(|e| JsError::Conversion(e.to_string()).into()),
                None => Ok(Value::Null),
            }
        })
    }
}

impl Default for QuickJsExecutor {
    fn default() -> Self {
        Self::new(QuickJsConfig::default())
    }
}

impl ScriptExecutor for QuickJsExecutor {
    fn type_name(&self) -> &str {
        "NativeQuickJsExecutor"
    }

    fn open_runtime(&self) -> Result<(), ScriptError> {
        let mut engine = self.engine.lock();
        if engine.is_some() {
            return Ok(());
        }
        *engine = Some(Engine::open(
            &self.config,
            Arc::clone(&self.sink),
            Arc::clone(&self.module_config),
        )?);
        tracing::debug!(config = ?self.config, "QuickJS runtime opened");
        Ok(())
    }

    fn set_flush_sink(&self, sink: FlushSink) {
        *self.sink.lock() = Some(sink);
    }

    fn set_module_config_provider(&self, provider: ModuleConfigProvider) {
        *self.module_config.lock() = Some(provider);
    }

    fn inject_configuration(&self, global: &str, json: &str) -> Result<(), ScriptError> {
        self.with_engine(|engine| {
            engine.with(|ctx| {
                let value = parse_json(&ctx, json).map_err(|e| script_error(&ctx, e))?;
                ctx.globals()
                    .set(global, value.clone())
                    .map_err(|e| script_error(&ctx, e))?;
                let configure = bridge_function(&ctx, "configure")?;
                configure
                    .call::<_, ()>((value,))
                    .map_err(|e| script_error(&ctx, e))
            })
        })
    }

    fn execute_source(&self, source: &Source) -> Result<(), ScriptError> {
        let text = source
            .text()
            .map_err(|e| JsError::InvalidSource(e.to_string()))?;
        self.with_engine(|engine| {
            engine.with(|ctx| {
                let mut options = EvalOptions::default();
                options.global = true;
                options.strict = false;
                options.backtrace_barrier = true;
                ctx.eval_with_options::<(), _>(text, options)
                    .map_err(|e| script_error(&ctx, e))
            })?;
            engine.drain_jobs();
            tracing::debug!(url = %source.url, bytes = source.len(), "Source executed");
            Ok(())
        })
    }

    fn flush_queue(&self) -> Result<Option<Value>, ScriptError> {
        self.with_engine(Engine::flushed_queue)
    }

    fn call_function(
        &self,
        module: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Option<Value>, ScriptError> {
        let args = Value::Array(args.to_vec()).to_string();
        self.with_engine(|engine| {
            engine.call_bridge("callFunction", (module, method, args.as_str()))?;
            engine.flushed_queue()
        })
    }

    fn invoke_callback(&self, callback_id: u64, args: &[Value]) -> Result<Option<Value>, ScriptError> {
        let args = Value::Array(args.to_vec()).to_string();
        self.with_engine(|engine| {
            engine.call_bridge("invokeCallback", (callback_id as f64, args.as_str()))?;
            engine.flushed_queue()
        })
    }

    fn config_style(&self) -> ConfigStyle {
        ConfigStyle::Full
    }

    fn invalidate(&self) {
        if let Some(engine) = self.engine.lock().take() {
            engine.runtime.run_gc();
            tracing::debug!("QuickJS runtime closed");
        }
        *self.sink.lock() = None;
        *self.module_config.lock() = None;
    }

    fn is_valid(&self) -> bool {
        self.engine.lock().is_some()
    }
}
