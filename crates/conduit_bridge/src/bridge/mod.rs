//! Bridge Host
//!
//! The [`Bridge`] is the long-lived object a host application keeps. It owns
//! the main context and the module declarations, and holds the current
//! [`BridgeGeneration`]. Reloading discards the generation and starts a new
//! one.

mod generation;

pub use generation::{BridgeGeneration, FatalHandler, GenerationParts};

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::codec::ConfigStyle;
use crate::error::{EnqueueError, FatalError, LifecycleError};
use crate::executor::{DiagnosticSurface, ScriptExecutor, SourceLoader};
use crate::invoker::CallInterceptor;
use crate::lifecycle::{BridgeEvent, EventPublisher, InvalidateReason};
use crate::module::{ExecutorFactory, ModuleClass, NativeModule, PreparedModule};
use crate::queue::{SerialQueue, WorkQueue};

/// Supplies pre-built module instances, once per generation.
pub type ModuleProvider = Arc<dyn Fn() -> Vec<PreparedModule> + Send + Sync>;

pub const DEFAULT_BUNDLE_URL: &str = "main.js";
pub const DEFAULT_FRAME_RATE: u32 = 60;
pub const DEFAULT_MAIN_QUEUE: &str = "conduit.main";
pub const DEFAULT_SCRIPT_QUEUE: &str = "conduit.script";

// ─────────────────────────────────────────────────────────────────────────────
// Bridge Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Weak, generation-scoped handle given to native modules.
///
/// Once the generation is gone every operation fails or returns `None`.
#[derive(Clone, Default)]
pub struct BridgeHandle {
    inner: Weak<BridgeGeneration>,
}

impl BridgeHandle {
    pub(crate) fn new(inner: Weak<BridgeGeneration>) -> Self {
        Self { inner }
    }

    /// A handle that belongs to no generation.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> Option<Arc<BridgeGeneration>> {
        self.inner.upgrade()
    }

    pub fn is_valid(&self) -> bool {
        self.generation().is_some_and(|g| g.is_valid())
    }

    pub fn enqueue_call(&self, target: &str, args: Vec<Value>) -> Result<(), EnqueueError> {
        self.generation()
            .ok_or(LifecycleError::Invalidated)?
            .enqueue_call(target, args)
    }

    pub fn enqueue_callback(&self, callback_id: u64, args: Vec<Value>) -> Result<(), LifecycleError> {
        self.generation()
            .ok_or(LifecycleError::Invalidated)?
            .enqueue_callback(callback_id, args)
    }

    /// Look up a sibling module.
    pub fn module_instance(&self, name: &str) -> Option<Arc<dyn NativeModule>> {
        self.generation()?.module_instance(name)
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.generation() {
            Some(generation) => f.debug_tuple("BridgeHandle").field(&generation.id()).finish(),
            None => f.write_str("BridgeHandle(detached)"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge
// ─────────────────────────────────────────────────────────────────────────────

pub struct Bridge {
    main: Arc<dyn WorkQueue>,
    classes: Vec<ModuleClass>,
    module_provider: Option<ModuleProvider>,
    executor_factory: ExecutorFactory,
    loader: Arc<dyn SourceLoader>,
    interceptor: Option<Arc<dyn CallInterceptor>>,
    fatal_handler: Option<FatalHandler>,
    diagnostics: Option<Arc<dyn DiagnosticSurface>>,
    bundle_url: String,
    config_style: Option<ConfigStyle>,
    frame_rate: u32,
    script_label: String,
    events: EventPublisher,
    current: Mutex<Option<Arc<BridgeGeneration>>>,
    /// Serializes start, reload and invalidate
    lifecycle: tokio::sync::Mutex<()>,
}

impl Bridge {
    pub fn builder<F>(executor_factory: F, loader: Arc<dyn SourceLoader>) -> BridgeBuilder
    where
        F: Fn() -> Arc<dyn ScriptExecutor> + Send + Sync + 'static,
    {
        BridgeBuilder::new(executor_factory, loader)
    }

    fn parts(&self) -> GenerationParts {
        GenerationParts {
            bundle_url: self.bundle_url.clone(),
            classes: self.classes.clone(),
            extra_modules: self
                .module_provider
                .as_ref()
                .map(|provide| provide())
                .unwrap_or_default(),
            executor: None,
            executor_factory: Arc::clone(&self.executor_factory),
            loader: Arc::clone(&self.loader),
            interceptor: self.interceptor.clone(),
            fatal_handler: self.fatal_handler.clone(),
            diagnostics: self.diagnostics.clone(),
            config_style: self.config_style,
            frame_rate: self.frame_rate,
            main: Arc::clone(&self.main),
            script_label: self.script_label.clone(),
            events: self.events.clone(),
        }
    }

    /// Start a generation if none exists, and wait for it to load.
    pub async fn start(&self) -> Result<Arc<BridgeGeneration>, LifecycleError> {
        let generation = {
            let _lifecycle = self.lifecycle.lock().await;
            if let Some(current) = self.current() {
                tracing::debug!(generation = %current.id(), "Bridge already started");
                return Ok(current);
            }
            let generation = BridgeGeneration::new(self.parts())?;
            *self.current.lock() = Some(Arc::clone(&generation));
            generation
        };

        generation.start().await?;
        Ok(generation)
    }

    /// Discard the current generation and start a fresh one.
    pub async fn reload(&self) -> Result<Arc<BridgeGeneration>, LifecycleError> {
        let generation = {
            let _lifecycle = self.lifecycle.lock().await;
            let previous = self.current.lock().take();
            if let Some(previous) = previous {
                previous.invalidate(InvalidateReason::Reload).await;
            }
            let generation = BridgeGeneration::new(self.parts())?;
            *self.current.lock() = Some(Arc::clone(&generation));
            generation
        };

        tracing::info!(generation = %generation.id(), "Bridge reloading");
        generation.start().await?;
        Ok(generation)
    }

    /// Tear the current generation down.
    pub async fn invalidate(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.current.lock().take();
        if let Some(current) = current {
            current.invalidate(InvalidateReason::Unmounted).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn current(&self) -> Option<Arc<BridgeGeneration>> {
        self.current.lock().clone()
    }

    pub fn handle(&self) -> BridgeHandle {
        self.current()
            .map(|generation| generation.handle())
            .unwrap_or_default()
    }

    pub fn enqueue_call(&self, target: &str, args: Vec<Value>) -> Result<(), EnqueueError> {
        self.current()
            .ok_or(LifecycleError::Invalidated)?
            .enqueue_call(target, args)
    }

    pub fn enqueue_callback(&self, callback_id: u64, args: Vec<Value>) -> Result<(), LifecycleError> {
        self.current()
            .ok_or(LifecycleError::Invalidated)?
            .enqueue_callback(callback_id, args)
    }

    pub fn is_loading(&self) -> bool {
        self.current().is_some_and(|g| g.is_loading())
    }

    pub fn is_valid(&self) -> bool {
        self.current().is_some_and(|g| g.is_valid())
    }

    pub fn has_errored(&self) -> bool {
        self.current().is_some_and(|g| g.has_errored())
    }

    pub fn module_instance(&self, name: &str) -> Option<Arc<dyn NativeModule>> {
        self.current()?.module_instance(name)
    }

    pub fn module_config_json(&self) -> Option<String> {
        self.current().map(|g| g.module_config_json())
    }

    pub fn last_flow_id(&self) -> Option<i64> {
        self.current()?.last_flow_id()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

pub struct BridgeBuilder {
    classes: Vec<ModuleClass>,
    module_provider: Option<ModuleProvider>,
    executor_factory: ExecutorFactory,
    loader: Arc<dyn SourceLoader>,
    interceptor: Option<Arc<dyn CallInterceptor>>,
    fatal_handler: Option<FatalHandler>,
    diagnostics: Option<Arc<dyn DiagnosticSurface>>,
    bundle_url: String,
    config_style: Option<ConfigStyle>,
    frame_rate: u32,
    main: Option<Arc<dyn WorkQueue>>,
    main_label: String,
    script_label: String,
    event_capacity: usize,
}

impl BridgeBuilder {
    pub fn new<F>(executor_factory: F, loader: Arc<dyn SourceLoader>) -> Self
    where
        F: Fn() -> Arc<dyn ScriptExecutor> + Send + Sync + 'static,
    {
        Self {
            classes: Vec::new(),
            module_provider: None,
            executor_factory: Arc::new(executor_factory),
            loader,
            interceptor: None,
            fatal_handler: None,
            diagnostics: None,
            bundle_url: DEFAULT_BUNDLE_URL.to_string(),
            config_style: None,
            frame_rate: DEFAULT_FRAME_RATE,
            main: None,
            main_label: DEFAULT_MAIN_QUEUE.to_string(),
            script_label: DEFAULT_SCRIPT_QUEUE.to_string(),
            event_capacity: 64,
        }
    }

    pub fn module(mut self, class: ModuleClass) -> Self {
        self.classes.push(class);
        self
    }

    pub fn modules(mut self, classes: impl IntoIterator<Item = ModuleClass>) -> Self {
        self.classes.extend(classes);
        self
    }

    pub fn module_provider<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> Vec<PreparedModule> + Send + Sync + 'static,
    {
        self.module_provider = Some(Arc::new(provider));
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn CallInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn on_fatal<F>(mut self, handler: F) -> Self
    where
        F: Fn(&FatalError) + Send + Sync + 'static,
    {
        self.fatal_handler = Some(Arc::new(handler));
        self
    }

    pub fn diagnostics(mut self, surface: Arc<dyn DiagnosticSurface>) -> Self {
        self.diagnostics = Some(surface);
        self
    }

    pub fn bundle_url(mut self, url: impl Into<String>) -> Self {
        self.bundle_url = url.into();
        self
    }

    pub fn config_style(mut self, style: ConfigStyle) -> Self {
        self.config_style = Some(style);
        self
    }

    /// Frames per second of the frame ticker; zero disables it.
    pub fn frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Use a host-provided main context instead of spawning one.
    pub fn main_queue(mut self, main: Arc<dyn WorkQueue>) -> Self {
        self.main = Some(main);
        self
    }

    pub fn queue_labels(mut self, main: impl Into<String>, script: impl Into<String>) -> Self {
        self.main_label = main.into();
        self.script_label = script.into();
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> Result<Bridge, LifecycleError> {
        let main = match self.main {
            Some(main) => main,
            None => SerialQueue::spawn(self.main_label)? as Arc<dyn WorkQueue>,
        };

        Ok(Bridge {
            main,
            classes: self.classes,
            module_provider: self.module_provider,
            executor_factory: self.executor_factory,
            loader: self.loader,
            interceptor: self.interceptor,
            fatal_handler: self.fatal_handler,
            diagnostics: self.diagnostics,
            bundle_url: self.bundle_url,
            config_style: self.config_style,
            frame_rate: self.frame_rate,
            script_label: self.script_label,
            events: EventPublisher::new(self.event_capacity),
            current: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }
}
