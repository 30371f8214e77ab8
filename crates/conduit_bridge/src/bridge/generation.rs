//! Bridge Generation
//!
//! One lifecycle instance, from setup to invalidation. Every module
//! descriptor, execution context and the script executor belong to exactly
//! one generation; reloading builds a new generation instead of resetting
//! this one.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use super::BridgeHandle;
use crate::codec::{self, Batch, ConfigStyle};
use crate::error::{EnqueueError, FatalError, LifecycleError, ResolutionError};
use crate::executor::{
    CONFIG_GLOBAL, DiagnosticSurface, LoadProgress, ProgressFn, ScriptError, ScriptExecutor,
    Source, SourceLoader,
};
use crate::frame::{FrameTick, FrameTicker};
use crate::invoker::{CallInterceptor, CallInvoker};
use crate::lifecycle::{BridgeEventKind, BridgeState, EventPublisher, InvalidateReason, LifecyclePhase};
use crate::module::{
    ExecutorFactory, ModuleClass, ModuleRegistry, NativeModule, PreparedModule, RegistryInput,
};
use crate::queue::{ContextKey, ContextSet, DispatchGroup, Work, WorkQueue, run_on};
use crate::router::{DispatchRouter, NoInlineGuard};

/// Called with every fatal error of a generation.
pub type FatalHandler = Arc<dyn Fn(&FatalError) + Send + Sync>;

/// Everything a generation is built from.
pub struct GenerationParts {
    pub bundle_url: String,
    pub classes: Vec<ModuleClass>,
    pub extra_modules: Vec<PreparedModule>,
    pub executor: Option<Arc<dyn ScriptExecutor>>,
    pub executor_factory: ExecutorFactory,
    pub loader: Arc<dyn SourceLoader>,
    pub interceptor: Option<Arc<dyn CallInterceptor>>,
    pub fatal_handler: Option<FatalHandler>,
    pub diagnostics: Option<Arc<dyn DiagnosticSurface>>,
    /// Overrides the executor's preferred configuration style
    pub config_style: Option<ConfigStyle>,
    pub frame_rate: u32,
    pub main: Arc<dyn WorkQueue>,
    pub script_label: String,
    pub events: EventPublisher,
}

/// Inputs consumed when the registry is built.
struct Setup {
    classes: Vec<ModuleClass>,
    extra_modules: Vec<PreparedModule>,
    executor: Option<Arc<dyn ScriptExecutor>>,
    executor_factory: ExecutorFactory,
}

pub struct BridgeGeneration {
    id: Uuid,
    bundle_url: String,
    state: Arc<BridgeState>,
    registry: Arc<ModuleRegistry>,
    contexts: Arc<ContextSet>,
    router: Arc<DispatchRouter>,
    executor: Mutex<Option<Arc<dyn ScriptExecutor>>>,
    setup: Mutex<Option<Setup>>,
    loader: Arc<dyn SourceLoader>,
    fatal_handler: Option<FatalHandler>,
    diagnostics: Option<Arc<dyn DiagnosticSurface>>,
    config_style: Option<ConfigStyle>,
    frame_rate: u32,
    ticker: Mutex<Option<FrameTicker>>,
    events: EventPublisher,
}

impl BridgeGeneration {
    /// Create a generation. Nothing runs until [`start`](Self::start).
    pub fn new(parts: GenerationParts) -> Result<Arc<Self>, LifecycleError> {
        let contexts = Arc::new(ContextSet::new(parts.main, &parts.script_label)?);
        let registry = Arc::new(ModuleRegistry::new());
        let state = Arc::new(BridgeState::new());

        Ok(Arc::new_cyclic(move |weak: &Weak<Self>| {
            let invoker = Arc::new(CallInvoker::new(
                Arc::clone(&registry),
                Arc::clone(&state),
                parts.interceptor,
                BridgeHandle::new(weak.clone()),
            ));

            let fatal_target = weak.clone();
            let router = Arc::new(DispatchRouter::new(
                Arc::clone(&contexts),
                Arc::clone(&registry),
                invoker,
                Arc::clone(&state),
                Arc::new(move |error: FatalError| {
                    if let Some(generation) = fatal_target.upgrade() {
                        generation.handle_fatal(error);
                    }
                }),
            ));

            Self {
                id: Uuid::new_v4(),
                bundle_url: parts.bundle_url,
                state,
                registry,
                contexts,
                router,
                executor: Mutex::new(None),
                setup: Mutex::new(Some(Setup {
                    classes: parts.classes,
                    extra_modules: parts.extra_modules,
                    executor: parts.executor,
                    executor_factory: parts.executor_factory,
                })),
                loader: parts.loader,
                fatal_handler: parts.fatal_handler,
                diagnostics: parts.diagnostics,
                config_style: parts.config_style,
                frame_rate: parts.frame_rate,
                ticker: Mutex::new(None),
                events: parts.events,
            }
        }))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn bundle_url(&self) -> &str {
        &self.bundle_url
    }

    pub fn handle(self: &Arc<Self>) -> BridgeHandle {
        BridgeHandle::new(Arc::downgrade(self))
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    pub fn has_errored(&self) -> bool {
        self.state.has_errored()
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.state.phase()
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub(crate) fn contexts(&self) -> &Arc<ContextSet> {
        &self.contexts
    }

    pub fn executor(&self) -> Option<Arc<dyn ScriptExecutor>> {
        self.executor.lock().clone()
    }

    /// Correlation id of the most recent batch that carried one.
    pub fn last_flow_id(&self) -> Option<i64> {
        self.router.last_flow_id()
    }

    /// The instance of a module, creating it if needed.
    pub fn module_instance(&self, name: &str) -> Option<Arc<dyn NativeModule>> {
        self.registry.resolve_name(name)?.instance()
    }

    /// The module configuration document injected into the runtime.
    pub fn module_config_json(&self) -> String {
        let style = self
            .config_style
            .or_else(|| self.executor().map(|e| e.config_style()))
            .unwrap_or_default();
        codec::module_config_json(&self.registry.snapshot(), style)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Startup
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the generation.
    ///
    /// The source load runs concurrently with registry build, runtime open and
    /// configuration injection. The source executes once all of them are done.
    pub async fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        if !self.state.begin_loading() {
            tracing::warn!(generation = %self.id, phase = %self.phase(), "Bridge generation already started");
            return Err(LifecycleError::Invalidated);
        }
        let Some(setup) = self.setup.lock().take() else {
            return Err(LifecycleError::Invalidated);
        };

        tracing::info!(generation = %self.id, url = %self.bundle_url, "Bridge loading");
        self.events.emit(self.id, BridgeEventKind::WillStartLoading);

        let (source, prepared) = tokio::join!(self.load_source(), self.prepare_runtime(setup));
        let result = match (source, prepared) {
            (Ok(source), Ok(())) => self.run_source(source).await,
            (Err(error), _) | (_, Err(error)) => Err(error),
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    generation = %self.id,
                    modules = self.registry.len(),
                    "Bridge loaded"
                );
                self.events.emit(self.id, BridgeEventKind::DidLoad);
                self.start_frame_ticker();
                Ok(())
            }
            Err(error) => {
                self.stop_loading_with_error(error.clone());
                Err(error)
            }
        }
    }

    async fn load_source(&self) -> Result<Source, LifecycleError> {
        let url = self.bundle_url.clone();
        let progress: ProgressFn = Arc::new(move |p: LoadProgress| {
            tracing::debug!(url = %url, done = p.done, total = ?p.total, "Loading source");
        });
        let source = self.loader.load(&self.bundle_url, progress).await?;
        tracing::debug!(url = %source.url, bytes = source.len(), "Source loaded");
        Ok(source)
    }

    async fn prepare_runtime(self: &Arc<Self>, setup: Setup) -> Result<(), LifecycleError> {
        let executor = self.registry.build(RegistryInput {
            extra_modules: setup.extra_modules,
            executor: setup.executor,
            executor_factory: setup.executor_factory,
            classes: setup.classes,
        });

        let weak = Arc::downgrade(self);
        executor.set_flush_sink(Arc::new(move |raw: Value| {
            if let Some(generation) = weak.upgrade() {
                generation.handle_buffer(raw, true);
            }
        }));
        let weak = Arc::downgrade(self);
        executor.set_module_config_provider(Arc::new(move |name: &str| {
            let generation = weak.upgrade()?;
            let descriptor = generation.registry.resolve_name(name)?;
            let entry = codec::module_entry(&descriptor, ConfigStyle::Full);
            (!descriptor.has_failed()).then_some(entry)
        }));
        *self.executor.lock() = Some(Arc::clone(&executor));

        let group = DispatchGroup::new();
        self.prepare_main_context_modules(&group);

        let opening = Arc::clone(&executor);
        run_on(self.contexts.script().as_ref(), move || opening.open_runtime())
            .await?
            .map_err(|e| LifecycleError::RuntimeOpen(e.message))?;

        // Constants of main-context modules are only read once they exist.
        group.wait().await;

        let config = self.module_config_json();
        tracing::debug!(generation = %self.id, bytes = config.len(), "Injecting module configuration");
        run_on(self.contexts.script().as_ref(), move || {
            executor.inject_configuration(CONFIG_GLOBAL, &config)
        })
        .await?
        .map_err(|e| LifecycleError::ConfigurationInjection(e.message))
    }

    /// Materialize modules that must be set up on the main context.
    fn prepare_main_context_modules(&self, group: &DispatchGroup) {
        let main = self.contexts.main();
        for descriptor in self.registry.snapshot() {
            if descriptor.is_executor() || !descriptor.requires_main_context_setup() {
                continue;
            }

            if main.is_current() {
                descriptor.instance();
                let _ = descriptor.constants();
                continue;
            }

            let token = group.enter();
            let name = descriptor.name().to_string();
            let work: Work = Box::new(move || {
                descriptor.instance();
                let _ = descriptor.constants();
                drop(token);
            });
            if let Err(e) = main.submit(work) {
                tracing::warn!(module = %name, "Failed to set up module on main context: {}", e);
            }
        }
    }

    async fn run_source(self: &Arc<Self>, source: Source) -> Result<(), LifecycleError> {
        let this = Arc::clone(self);
        run_on(self.contexts.script().as_ref(), move || this.execute_on_script(&source)).await?
    }

    /// Execute the source, dispatch its first batch and release pending work.
    fn execute_on_script(&self, source: &Source) -> Result<(), LifecycleError> {
        let executor = self.executor().ok_or(LifecycleError::Invalidated)?;
        let _guard = NoInlineGuard::enter();

        executor.execute_source(source).map_err(|e| {
            self.show_diagnostics(&e);
            LifecycleError::SourceExecution(e.message)
        })?;
        let initial = executor
            .flush_queue()
            .map_err(|e| LifecycleError::QueueFlush(e.message))?;

        if let Some(raw) = initial {
            self.handle_buffer(raw, false);
        }
        self.router.release_pending();
        self.state.finish_loading();
        Ok(())
    }

    fn stop_loading_with_error(&self, error: LifecycleError) {
        if !self.state.is_valid() {
            tracing::debug!(generation = %self.id, "Ignoring load error on invalid generation: {}", error);
            return;
        }

        tracing::error!(generation = %self.id, "Failed to load bridge: {}", error);
        self.state.fail_loading();
        self.router.discard_pending();
        if let Some(executor) = self.executor() {
            let _ = self
                .contexts
                .script()
                .submit(Box::new(move || executor.invalidate()));
        }

        self.events
            .emit(self.id, BridgeEventKind::DidFailToLoad(error.to_string()));
        self.handle_fatal(FatalError::Lifecycle(error));
    }

    fn start_frame_ticker(self: &Arc<Self>) {
        if !self.state.is_valid() {
            return;
        }
        let wanted = self
            .registry
            .snapshot()
            .iter()
            .any(|d| d.capabilities().frame_updates);
        if !wanted {
            return;
        }

        let weak = Arc::downgrade(self);
        *self.ticker.lock() = FrameTicker::start(self.frame_rate, move |tick| {
            if let Some(generation) = weak.upgrade() {
                generation.dispatch_frame(tick);
            }
        });
    }

    fn dispatch_frame(&self, tick: FrameTick) {
        if !self.state.is_valid() {
            return;
        }
        for descriptor in self.registry.snapshot() {
            if !descriptor.capabilities().frame_updates {
                continue;
            }
            let Some(instance) = descriptor.loaded_instance() else {
                continue;
            };
            let work: Work = Box::new(move || instance.did_update_frame(tick));
            if let Err(e) = self.router.submit(&descriptor.context_key(), work) {
                tracing::trace!(module = %descriptor.name(), "Frame update dropped: {}", e);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Decode and dispatch a flushed queue. `partial` marks an immediate flush.
    pub fn handle_buffer(&self, raw: Value, partial: bool) {
        if raw.is_null() {
            return;
        }
        match Batch::decode(&raw) {
            Ok(batch) if batch.is_empty() => {}
            Ok(batch) => self.router.dispatch_batch(batch, partial),
            Err(error) => {
                tracing::error!(generation = %self.id, "Dropping malformed batch: {}", error);
            }
        }
    }

    /// Call `Module.method(args)` on the script side.
    pub fn enqueue_call(self: &Arc<Self>, target: &str, args: Vec<Value>) -> Result<(), EnqueueError> {
        let (module, method) = target
            .split_once('.')
            .filter(|(module, method)| !module.is_empty() && !method.is_empty())
            .ok_or_else(|| ResolutionError::InvalidTarget(target.to_string()))?;
        let (module, method) = (module.to_string(), method.to_string());

        tracing::debug!(generation = %self.id, target, "Enqueueing script call");
        self.enqueue_script(move |executor| executor.call_function(&module, &method, &args))?;
        Ok(())
    }

    /// Invoke a script callback.
    pub fn enqueue_callback(self: &Arc<Self>, callback_id: u64, args: Vec<Value>) -> Result<(), LifecycleError> {
        tracing::trace!(generation = %self.id, callback_id, "Enqueueing script callback");
        self.enqueue_script(move |executor| executor.invoke_callback(callback_id, &args))
    }

    /// Run an executor call on the script context and dispatch what it flushed.
    fn enqueue_script<F>(self: &Arc<Self>, call: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(&dyn ScriptExecutor) -> Result<Option<Value>, ScriptError> + Send + 'static,
    {
        if !self.state.is_valid() {
            return Err(LifecycleError::Invalidated);
        }

        let weak = Arc::downgrade(self);
        self.router.submit(
            &ContextKey::Script,
            Box::new(move || {
                let Some(generation) = weak.upgrade() else {
                    return;
                };
                if !generation.state.is_valid() {
                    tracing::debug!(generation = %generation.id, "Dropping script call on invalid bridge");
                    return;
                }
                let Some(executor) = generation.executor() else {
                    return;
                };

                let result = {
                    let _guard = NoInlineGuard::enter();
                    call(executor.as_ref())
                };
                match result {
                    Ok(Some(raw)) => generation.handle_buffer(raw, false),
                    Ok(None) => {}
                    Err(error) => {
                        generation.handle_fatal(FatalError::Script {
                            message: error.message,
                            stack: error.stack,
                        });
                    }
                }
            }),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Errors
    // ─────────────────────────────────────────────────────────────────────────

    fn show_diagnostics(&self, error: &ScriptError) {
        if let (Some(diagnostics), Some(stack)) = (&self.diagnostics, &error.stack) {
            diagnostics.show_error(&error.message, stack);
        }
    }

    /// Surface a generation-ending error to the host.
    pub fn handle_fatal(&self, error: FatalError) {
        tracing::error!(generation = %self.id, "Fatal bridge error: {}", error);
        self.state.mark_errored();

        if let (Some(diagnostics), Some(stack)) = (&self.diagnostics, error.stack()) {
            diagnostics.show_error(&error.to_string(), stack);
        }
        self.events
            .emit(self.id, BridgeEventKind::Fatal(error.to_string()));
        if let Some(handler) = &self.fatal_handler {
            handler(&error);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────────

    /// Tear the generation down. Calling it again is a no-op.
    pub async fn invalidate(self: &Arc<Self>, reason: InvalidateReason) {
        if !self.state.begin_invalidate() {
            tracing::debug!(generation = %self.id, "Bridge generation already invalidating");
            return;
        }

        tracing::info!(generation = %self.id, ?reason, "Bridge invalidating");
        self.events
            .emit(self.id, BridgeEventKind::WillInvalidate(reason));
        self.router.discard_pending();

        // Each live instance is released by a unit queued behind the calls
        // already on its context, so those calls still find it.
        let group = DispatchGroup::new();
        for descriptor in self.registry.snapshot() {
            // The executor is shut down last, below.
            if descriptor.is_executor() {
                continue;
            }
            let Some(instance) = descriptor.loaded_instance() else {
                descriptor.invalidate();
                continue;
            };

            let cleanup = descriptor.capabilities().cleanup;
            let token = group.enter();
            let hook = Arc::clone(&instance);
            let releasing = Arc::clone(&descriptor);
            let work: Work = Box::new(move || {
                if cleanup {
                    hook.invalidate();
                }
                releasing.invalidate();
                drop(token);
            });
            let submitted = self
                .contexts
                .queue_for(&descriptor.context_key())
                .and_then(|queue| queue.submit(work));
            if let Err(e) = submitted {
                tracing::warn!(module = %descriptor.name(), "Releasing module in place: {}", e);
                if cleanup {
                    instance.invalidate();
                }
                descriptor.invalidate();
            }
        }
        group.wait().await;

        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }

        let executor = self.executor.lock().take();
        if let Some(executor) = executor {
            if let Err(e) = run_on(self.contexts.script().as_ref(), move || executor.invalidate()).await {
                tracing::warn!(generation = %self.id, "Script executor shutdown failed: {}", e);
            }
        }

        self.contexts.shutdown();
        self.registry.clear();
        self.state.finish_invalidate();

        tracing::info!(generation = %self.id, "Bridge invalidated");
        self.events.emit(self.id, BridgeEventKind::DidInvalidate);
    }
}

impl std::fmt::Debug for BridgeGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeGeneration")
            .field("id", &self.id)
            .field("bundle_url", &self.bundle_url)
            .field("phase", &self.phase())
            .finish()
    }
}
