//! Dispatch Router
//!
//! Fans a decoded batch out to the contexts its modules run on. Calls for one
//! context are handed over as a single unit of work, so their relative order
//! within the batch is kept. Work for the script context is held back until
//! the generation finishes loading.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::codec::{Batch, NO_CALL_ID};
use crate::error::{FatalError, LifecycleError, ResolutionError};
use crate::invoker::{CallInvoker, CallOutcome};
use crate::lifecycle::BridgeState;
use crate::module::{ModuleDescriptor, ModuleRegistry};
use crate::queue::{ContextKey, ContextSet, Work, WorkQueue, panic_message};

/// Receives fatal errors raised while running calls.
pub type FatalSink = Arc<dyn Fn(FatalError) + Send + Sync>;

thread_local! {
    static NO_INLINE: Cell<bool> = const { Cell::new(false) };
}

/// While alive, work submitted to the script context from the script thread
/// is queued instead of run in place.
pub struct NoInlineGuard {
    previous: bool,
}

impl NoInlineGuard {
    pub fn enter() -> Self {
        Self {
            previous: NO_INLINE.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for NoInlineGuard {
    fn drop(&mut self) {
        NO_INLINE.with(|flag| flag.set(self.previous));
    }
}

pub struct DispatchRouter {
    contexts: Arc<ContextSet>,
    registry: Arc<ModuleRegistry>,
    invoker: Arc<CallInvoker>,
    state: Arc<BridgeState>,
    fatal: FatalSink,
    /// `None` once the pending calls were released or discarded
    pending: Mutex<Option<Vec<Work>>>,
    last_flow_id: AtomicI64,
}

impl DispatchRouter {
    pub fn new(
        contexts: Arc<ContextSet>,
        registry: Arc<ModuleRegistry>,
        invoker: Arc<CallInvoker>,
        state: Arc<BridgeState>,
        fatal: FatalSink,
    ) -> Self {
        Self {
            contexts,
            registry,
            invoker,
            state,
            fatal,
            pending: Mutex::new(Some(Vec::new())),
            last_flow_id: AtomicI64::new(NO_CALL_ID),
        }
    }

    /// Submit work to a context.
    pub fn submit(&self, key: &ContextKey, work: Work) -> Result<(), LifecycleError> {
        match key {
            ContextKey::Script => self.submit_script(work),
            _ => self.contexts.queue_for(key)?.submit(work),
        }
    }

    fn submit_script(&self, work: Work) -> Result<(), LifecycleError> {
        {
            let mut pending = self.pending.lock();
            if let Some(queue) = pending.as_mut() {
                queue.push(work);
                tracing::trace!(pending = queue.len(), "Buffered script work while loading");
                return Ok(());
            }
        }

        let script = self.contexts.script();
        if script.is_current() && !NO_INLINE.with(Cell::get) {
            work();
            Ok(())
        } else {
            script.submit(work)
        }
    }

    /// Number of buffered script work items, or `None` after release.
    pub fn pending_len(&self) -> Option<usize> {
        self.pending.lock().as_ref().map(Vec::len)
    }

    /// Run the buffered script work in order and stop buffering.
    ///
    /// Must run on the script context. Work submitted from here on is queued
    /// behind the drained items.
    pub fn release_pending(&self) {
        let Some(drained) = self.pending.lock().take() else {
            return;
        };
        tracing::debug!(count = drained.len(), "Releasing pending script work");

        let _guard = NoInlineGuard::enter();
        for work in drained {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work)) {
                tracing::error!("Pending script work panicked: {}", panic_message(&panic));
            }
        }
    }

    /// Drop the buffered script work. Returns how many items were dropped.
    pub fn discard_pending(&self) -> usize {
        let discarded = self.pending.lock().take().map_or(0, |p| p.len());
        if discarded > 0 {
            tracing::debug!(count = discarded, "Discarded pending script work");
        }
        discarded
    }

    /// Correlation id of the most recent batch that carried one.
    pub fn last_flow_id(&self) -> Option<i64> {
        let id = self.last_flow_id.load(Ordering::SeqCst);
        (id != NO_CALL_ID).then_some(id)
    }

    /// Dispatch a batch. `partial` marks a batch from an immediate flush.
    pub fn dispatch_batch(self: &Arc<Self>, batch: Batch, partial: bool) {
        if let Some(call_id) = batch.call_id() {
            self.last_flow_id.store(call_id, Ordering::SeqCst);
        }
        tracing::debug!(calls = batch.len(), call_id = batch.call_id, partial, "Dispatching batch");

        // Contexts in order of first appearance, each with its call indices.
        let mut groups: Vec<(ContextKey, Vec<usize>)> = Vec::new();
        for (index, &module_id) in batch.module_ids.iter().enumerate() {
            let Some(descriptor) = self.registry.resolve_id(module_id) else {
                if self.state.is_valid() {
                    tracing::error!("{}", ResolutionError::UnknownModuleId(module_id));
                }
                continue;
            };
            let key = descriptor.context_key();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, indices)) => indices.push(index),
                None => groups.push((key, vec![index])),
            }
        }

        let batch = Arc::new(batch);
        for (key, indices) in groups {
            let router = Arc::clone(self);
            let batch = Arc::clone(&batch);
            let work: Work = Box::new(move || router.run_calls(&batch, &indices, partial));
            if let Err(e) = self.submit(&key, work) {
                tracing::warn!(context = %key, "Dropping calls for context: {}", e);
            }
        }
    }

    /// Run the calls at `indices`, then notify each touched module once.
    fn run_calls(&self, batch: &Batch, indices: &[usize], partial: bool) {
        let mut touched: Vec<Arc<ModuleDescriptor>> = Vec::new();

        for &index in indices {
            let module_id = batch.module_ids[index];
            let Some(descriptor) = self.registry.resolve_id(module_id) else {
                continue;
            };
            let outcome =
                self.invoker
                    .invoke_on(&descriptor, batch.method_ids[index], &batch.params[index]);
            match outcome {
                CallOutcome::Completed => {}
                CallOutcome::Skipped(reason) => {
                    tracing::trace!(module = %descriptor.name(), ?reason, "Call skipped");
                }
                CallOutcome::Fatal(error) => (self.fatal)(error),
            }
            if !touched.iter().any(|d| d.id() == descriptor.id()) {
                touched.push(descriptor);
            }
        }

        for descriptor in touched {
            let capabilities = descriptor.capabilities();
            let wanted = if partial {
                capabilities.partial_flush
            } else {
                capabilities.batch_complete
            };
            if !wanted {
                continue;
            }
            if let Some(instance) = descriptor.loaded_instance() {
                if partial {
                    instance.partial_batch_did_flush();
                } else {
                    instance.batch_did_complete();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeHandle;
    use crate::module::{Capabilities, ContextAssignment, ModuleClass, NativeModule, RegistryBuilder};
    use crate::queue::{SerialQueue, run_on};
    use crate::testing::{Recorder, RecordingModule, method_names};
    use serde_json::json;

    struct Fixture {
        router: Arc<DispatchRouter>,
        contexts: Arc<ContextSet>,
        state: Arc<BridgeState>,
        recorder: Recorder,
        fatals: Arc<Mutex<Vec<FatalError>>>,
    }

    fn class(type_name: &str, context: ContextAssignment, recorder: &Recorder) -> ModuleClass {
        let recorder = recorder.clone();
        let name = crate::module::normalize_module_name(type_name);
        let mut class = ModuleClass::new(type_name, move || {
            Some(Arc::new(RecordingModule::named(&name, recorder.clone())) as Arc<dyn NativeModule>)
        })
        .on_context(context)
        .capabilities(
            Capabilities::none()
                .with_batch_complete()
                .with_partial_flush(),
        );
        for method in method_names(&["a", "b", "c", "fail"]) {
            class = class.method(method);
        }
        class
    }

    fn fixture(label: &str) -> Fixture {
        let recorder = Recorder::default();
        let mut builder = RegistryBuilder::new();
        builder.register_class(class("NativeTiming", ContextAssignment::Dedicated, &recorder));
        builder.register_class(class("NativeUIManager", ContextAssignment::Main, &recorder));
        builder.register_class(class("NativeLogger", ContextAssignment::Script, &recorder));
        let registry = Arc::new(ModuleRegistry::new());
        registry.install(builder);

        let state = Arc::new(BridgeState::new());
        state.begin_loading();
        let main = SerialQueue::spawn(format!("{}.main", label)).unwrap();
        let contexts = Arc::new(ContextSet::new(main, &format!("{}.script", label)).unwrap());
        let invoker = Arc::new(CallInvoker::new(
            Arc::clone(&registry),
            Arc::clone(&state),
            None,
            BridgeHandle::detached(),
        ));
        let fatals = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fatals);
        let router = Arc::new(DispatchRouter::new(
            Arc::clone(&contexts),
            registry,
            invoker,
            Arc::clone(&state),
            Arc::new(move |error: FatalError| sink.lock().push(error)),
        ));

        Fixture {
            router,
            contexts,
            state,
            recorder,
            fatals,
        }
    }

    impl Fixture {
        /// Wait until every context used by the tests has drained.
        async fn settle(&self) {
            for key in [
                ContextKey::Serial("TimingQueue".into()),
                ContextKey::Main,
                ContextKey::Script,
            ] {
                let queue = self.contexts.queue_for(&key).unwrap();
                run_on(queue.as_ref(), || ()).await.unwrap();
            }
        }

        async fn release(&self) {
            let router = Arc::clone(&self.router);
            run_on(self.contexts.script().as_ref(), move || router.release_pending())
                .await
                .unwrap();
            self.state.finish_loading();
        }
    }

    #[tokio::test]
    async fn test_same_context_calls_run_in_index_order() {
        let fixture = fixture("router.order");
        fixture.release().await;

        let batch = Batch::decode(&json!([[0, 0], [1, 2], [[], []]])).unwrap();
        fixture.router.dispatch_batch(batch, false);
        fixture.settle().await;

        let calls = fixture.recorder.calls();
        let methods: Vec<_> = calls.iter().map(|c| c.method.as_str()).collect();
        assert_eq!(methods, vec!["b", "c", "@batchDidComplete"]);
        assert!(calls.iter().all(|c| c.thread.as_deref() == Some("TimingQueue")));
    }

    #[tokio::test]
    async fn test_calls_grouped_per_context() {
        let fixture = fixture("router.groups");
        fixture.release().await;

        let batch = Batch::decode(&json!([[1, 0, 1, 0], [0, 0, 1, 1], [[], [], [], []], 77])).unwrap();
        fixture.router.dispatch_batch(batch, false);
        fixture.settle().await;

        let ui: Vec<_> = fixture
            .recorder
            .calls()
            .into_iter()
            .filter(|c| c.module == "UIManager")
            .map(|c| (c.method, c.thread))
            .collect();
        assert_eq!(
            ui,
            vec![
                ("a".to_string(), Some("router.groups.main".to_string())),
                ("b".to_string(), Some("router.groups.main".to_string())),
                ("@batchDidComplete".to_string(), Some("router.groups.main".to_string())),
            ]
        );
        assert_eq!(fixture.router.last_flow_id(), Some(77));
    }

    #[tokio::test]
    async fn test_unknown_module_skips_single_call() {
        let fixture = fixture("router.unknown");
        fixture.release().await;

        let batch = Batch::decode(&json!([[9, 0], [0, 0], [[], []]])).unwrap();
        fixture.router.dispatch_batch(batch, false);
        fixture.settle().await;

        assert_eq!(fixture.recorder.methods(), vec!["Timing.a", "Timing@batchDidComplete"]);
        assert!(fixture.state.is_valid());
    }

    #[tokio::test]
    async fn test_script_work_buffered_until_release() {
        let fixture = fixture("router.pending");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            fixture
                .router
                .submit(&ContextKey::Script, Box::new(move || order.lock().push(i)))
                .unwrap();
        }
        assert_eq!(fixture.router.pending_len(), Some(5));
        fixture.settle().await;
        assert!(order.lock().is_empty());

        fixture.release().await;
        let late = Arc::clone(&order);
        fixture
            .router
            .submit(&ContextKey::Script, Box::new(move || late.lock().push(99)))
            .unwrap();
        fixture.settle().await;

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 99]);
        assert_eq!(fixture.router.pending_len(), None);
    }

    #[tokio::test]
    async fn test_work_submitted_during_release_runs_after_drain() {
        let fixture = fixture("router.reentrant");
        let order = Arc::new(Mutex::new(Vec::new()));

        let router = Arc::clone(&fixture.router);
        let first = Arc::clone(&order);
        fixture
            .router
            .submit(
                &ContextKey::Script,
                Box::new(move || {
                    first.lock().push("first");
                    let nested = Arc::clone(&first);
                    router
                        .submit(&ContextKey::Script, Box::new(move || nested.lock().push("nested")))
                        .unwrap();
                }),
            )
            .unwrap();
        let second = Arc::clone(&order);
        fixture
            .router
            .submit(&ContextKey::Script, Box::new(move || second.lock().push("second")))
            .unwrap();

        fixture.release().await;
        fixture.settle().await;
        assert_eq!(*order.lock(), vec!["first", "second", "nested"]);
    }

    #[tokio::test]
    async fn test_discarded_work_never_runs() {
        let fixture = fixture("router.discard");
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        fixture
            .router
            .submit(&ContextKey::Script, Box::new(move || *flag.lock() = true))
            .unwrap();

        assert_eq!(fixture.router.discard_pending(), 1);
        fixture.release().await;
        fixture.settle().await;
        assert!(!*ran.lock());
    }

    #[tokio::test]
    async fn test_fatal_outcomes_reach_sink_and_partial_hooks_run() {
        let fixture = fixture("router.fatal");
        fixture.release().await;

        let batch = Batch::decode(&json!([[0], [3], [[]]])).unwrap();
        fixture.router.dispatch_batch(batch, true);
        fixture.settle().await;

        assert_eq!(fixture.fatals.lock().len(), 1);
        assert_eq!(
            fixture.recorder.methods(),
            vec!["Timing.fail", "Timing@partialBatchDidFlush"]
        );
    }
}
