//! Test doubles shared by the unit tests of this crate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::Notify;

use crate::bridge::{Bridge, BridgeBuilder, BridgeGeneration};
use crate::codec::ConfigStyle;
use crate::error::{FatalError, LifecycleError, ModuleError};
use crate::executor::{
    DiagnosticSurface, FlushSink, ModuleConfigProvider, ProgressFn, ScriptError, ScriptExecutor,
    Source, SourceLoader, StaticSourceLoader,
};
use crate::frame::FrameTick;
use crate::module::{
    CallContext, ContextAssignment, MethodDescriptor, ModuleClass, NativeModule,
    normalize_module_name,
};
use crate::queue::{ContextKey, run_on};

// ─────────────────────────────────────────────────────────────────────────────
// Mock Executor
// ─────────────────────────────────────────────────────────────────────────────

/// A scripted executor. Batches handed to it are returned from flushes in order.
pub struct MockExecutor {
    valid: AtomicBool,
    style: ConfigStyle,
    fail_open: bool,
    fail_execution: Option<ScriptError>,
    initial_batch: Mutex<Option<Value>>,
    replies: Mutex<VecDeque<Value>>,
    injected: Mutex<Option<(String, String)>>,
    log: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, String, Vec<Value>)>>,
    callbacks: Mutex<Vec<(u64, Vec<Value>)>>,
    sink: Mutex<Option<FlushSink>>,
    module_config: Mutex<Option<ModuleConfigProvider>>,
    invalidations: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            style: ConfigStyle::Full,
            fail_open: false,
            fail_execution: None,
            initial_batch: Mutex::new(None),
            replies: Mutex::new(VecDeque::new()),
            injected: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            module_config: Mutex::new(None),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn with_initial_batch(self, batch: Value) -> Self {
        *self.initial_batch.lock() = Some(batch);
        self
    }

    pub fn with_config_style(mut self, style: ConfigStyle) -> Self {
        self.style = style;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_execution(mut self, error: ScriptError) -> Self {
        self.fail_execution = Some(error);
        self
    }

    /// Queue a batch to return from the next script call or callback.
    pub fn reply_with(&self, batch: Value) {
        self.replies.lock().push_back(batch);
    }

    /// Flush a queue mid-execution, as the engine would.
    pub fn flush_immediate(&self, batch: Value) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink(batch);
        }
    }

    /// Look a module up the way an engine discovering it lazily would.
    pub fn require_module_config(&self, name: &str) -> Option<Value> {
        let provider = self.module_config.lock().clone();
        provider.and_then(|provide| provide(name))
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn injected(&self) -> Option<(String, String)> {
        self.injected.lock().clone()
    }

    pub fn calls(&self) -> Vec<(String, String, Vec<Value>)> {
        self.calls.lock().clone()
    }

    pub fn callbacks(&self) -> Vec<(u64, Vec<Value>)> {
        self.callbacks.lock().clone()
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }
}

impl ScriptExecutor for MockExecutor {
    fn type_name(&self) -> &str {
        "NativeMockExecutor"
    }

    fn open_runtime(&self) -> Result<(), ScriptError> {
        self.record("open");
        if self.fail_open {
            return Err(ScriptError::new("no runtime"));
        }
        self.valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_flush_sink(&self, sink: FlushSink) {
        *self.sink.lock() = Some(sink);
    }

    fn set_module_config_provider(&self, provider: ModuleConfigProvider) {
        *self.module_config.lock() = Some(provider);
    }

    fn inject_configuration(&self, global: &str, json: &str) -> Result<(), ScriptError> {
        self.record("inject");
        *self.injected.lock() = Some((global.to_string(), json.to_string()));
        Ok(())
    }

    fn execute_source(&self, source: &Source) -> Result<(), ScriptError> {
        self.record(format!("execute:{}", source.url));
        match &self.fail_execution {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn flush_queue(&self) -> Result<Option<Value>, ScriptError> {
        self.record("flush");
        Ok(self.initial_batch.lock().take())
    }

    fn call_function(
        &self,
        module: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Option<Value>, ScriptError> {
        self.record(format!("call:{}.{}", module, method));
        if method == "throw" {
            return Err(ScriptError::new("script threw").with_stack("at throw (main.js:1)"));
        }
        self.calls
            .lock()
            .push((module.to_string(), method.to_string(), args.to_vec()));
        Ok(self.replies.lock().pop_front())
    }

    fn invoke_callback(&self, callback_id: u64, args: &[Value]) -> Result<Option<Value>, ScriptError> {
        self.record(format!("callback:{}", callback_id));
        self.callbacks.lock().push((callback_id, args.to_vec()));
        Ok(self.replies.lock().pop_front())
    }

    fn config_style(&self) -> ConfigStyle {
        self.style
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.valid.store(false, Ordering::SeqCst);
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording Module
// ─────────────────────────────────────────────────────────────────────────────

/// One call or hook seen by a [`RecordingModule`].
#[derive(Debug, Clone)]
pub struct Record {
    pub module: String,
    /// Method name, or `@hook` for lifecycle hooks
    pub method: String,
    pub args: Vec<Value>,
    pub thread: Option<String>,
    pub had_promise: bool,
}

/// Shared log of calls across module instances.
#[derive(Clone, Default)]
pub struct Recorder {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Recorder {
    fn push(&self, module: &str, method: &str, args: &[Value], had_promise: bool) {
        self.records.lock().push(Record {
            module: module.to_string(),
            method: method.to_string(),
            args: args.to_vec(),
            thread: std::thread::current().name().map(str::to_string),
            had_promise,
        });
    }

    pub fn calls(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    /// `Module.method` for calls and `Module@hook` for hooks.
    pub fn methods(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| {
                if r.method.starts_with('@') {
                    format!("{}{}", r.module, r.method)
                } else {
                    format!("{}.{}", r.module, r.method)
                }
            })
            .collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.methods().iter().filter(|m| *m == entry).count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` records exist.
    pub async fn wait_for(&self, count: usize) -> bool {
        for _ in 0..200 {
            if self.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

/// A module that records every call and hook.
///
/// A few method names have behavior: `fail` returns an error, `panic` panics,
/// `fatal` returns an already-fatal error, `slow` blocks its context for
/// 200ms after being recorded, `resolve` resolves its promise with the first
/// argument and `echo` invokes the callback in its first argument with the
/// remaining arguments.
pub struct RecordingModule {
    name: String,
    recorder: Recorder,
}

impl RecordingModule {
    pub fn new(recorder: Recorder) -> Self {
        Self::named("Recording", recorder)
    }

    pub fn named(name: &str, recorder: Recorder) -> Self {
        Self {
            name: name.to_string(),
            recorder,
        }
    }

    fn hook(&self, hook: &str) {
        self.recorder.push(&self.name, hook, &[], false);
    }
}

impl NativeModule for RecordingModule {
    fn call(
        &self,
        method: &MethodDescriptor,
        args: &[Value],
        cx: &CallContext,
    ) -> Result<(), ModuleError> {
        self.recorder
            .push(&self.name, &method.js_name, args, cx.promise().is_some());

        match method.js_name.as_str() {
            "fail" => Err(ModuleError::failed("boom")),
            "panic" => panic!("kaboom"),
            "slow" => {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }
            "fatal" => Err(FatalError::Script {
                message: "script failed".into(),
                stack: Some("at fatal (native)".into()),
            }
            .into()),
            "resolve" => {
                if let Some(promise) = cx.promise() {
                    promise
                        .resolve(args.first().cloned().unwrap_or(Value::Null))
                        .map_err(|e| ModuleError::failed(e.to_string()))?;
                }
                Ok(())
            }
            "echo" => {
                let callback = cx.callback(method, args, 0)?;
                callback
                    .invoke(args.get(1..).unwrap_or_default().to_vec())
                    .map_err(|e| ModuleError::failed(e.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn invalidate(&self) {
        self.hook("@invalidate");
    }

    fn batch_did_complete(&self) {
        self.hook("@batchDidComplete");
    }

    fn partial_batch_did_flush(&self) {
        self.hook("@partialBatchDidFlush");
    }

    fn did_update_frame(&self, _tick: FrameTick) {
        self.hook("@frame");
    }
}

/// Exports `{"answer": 42}`.
#[derive(Default)]
pub struct ConstantModule;

impl NativeModule for ConstantModule {
    fn call(&self, _: &MethodDescriptor, _: &[Value], _: &CallContext) -> Result<(), ModuleError> {
        Ok(())
    }

    fn constants(&self) -> Option<Map<String, Value>> {
        let mut constants = Map::new();
        constants.insert("answer".into(), json!(42));
        Some(constants)
    }
}

/// Argument-less methods with the given names.
pub fn method_names(names: &[&str]) -> Vec<MethodDescriptor> {
    names.iter().map(|name| MethodDescriptor::new(*name)).collect()
}

/// A class whose instances record into `recorder`.
pub fn recording_class(
    type_name: &str,
    context: ContextAssignment,
    recorder: &Recorder,
    methods: Vec<MethodDescriptor>,
) -> ModuleClass {
    let recorder = recorder.clone();
    let name = normalize_module_name(type_name);
    methods.into_iter().fold(
        ModuleClass::new(type_name, move || {
            Some(Arc::new(RecordingModule::named(&name, recorder.clone())) as Arc<dyn NativeModule>)
        })
        .on_context(context),
        ModuleClass::method,
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Loaders & Diagnostics
// ─────────────────────────────────────────────────────────────────────────────

/// Always fails.
pub struct FailingLoader;

#[async_trait]
impl SourceLoader for FailingLoader {
    async fn load(&self, url: &str, _progress: ProgressFn) -> Result<Source, LifecycleError> {
        Err(LifecycleError::SourceLoad(format!("{} not found", url)))
    }
}

/// Holds the load back until released.
#[derive(Default)]
pub struct GatedLoader {
    gate: Notify,
}

impl GatedLoader {
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl SourceLoader for GatedLoader {
    async fn load(&self, url: &str, _progress: ProgressFn) -> Result<Source, LifecycleError> {
        self.gate.notified().await;
        Ok(Source::new(url, b"// gated".to_vec()))
    }
}

/// Records what it was asked to show.
#[derive(Default)]
pub struct RecordingDiagnostics {
    pub shown: Mutex<Vec<(String, String)>>,
}

impl DiagnosticSurface for RecordingDiagnostics {
    fn show_error(&self, message: &str, stack: &str) {
        self.shown.lock().push((message.to_string(), stack.to_string()));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// A bridge builder over `executor` with the frame ticker off.
pub fn test_builder(label: &str, executor: &Arc<MockExecutor>) -> BridgeBuilder {
    test_builder_with(label, executor, Arc::new(StaticSourceLoader::new("// bundle")))
}

pub fn test_builder_with(
    label: &str,
    executor: &Arc<MockExecutor>,
    loader: Arc<dyn SourceLoader>,
) -> BridgeBuilder {
    let executor = Arc::clone(executor);
    Bridge::builder(move || Arc::clone(&executor) as Arc<dyn ScriptExecutor>, loader)
        .frame_rate(0)
        .queue_labels(format!("{}.main", label), format!("{}.script", label))
}

/// Poll `condition` for up to two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wait until every context of the generation has drained, twice over so
/// work scheduled by drained work also runs.
pub async fn settle(generation: &BridgeGeneration) {
    for _ in 0..2 {
        let mut keys = vec![ContextKey::Main, ContextKey::Script];
        for descriptor in generation.registry().snapshot() {
            let key = descriptor.context_key();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        for key in keys {
            if let Ok(queue) = generation.contexts().queue_for(&key) {
                let _ = run_on(queue.as_ref(), || ()).await;
            }
        }
    }
}
