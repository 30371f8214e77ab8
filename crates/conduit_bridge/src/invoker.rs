//! Call Invoker
//!
//! Executes one decoded call against a module instance. Nothing unwinds out
//! of [`CallInvoker::invoke`]: module errors and panics become
//! [`CallOutcome::Fatal`], and policy decisions become
//! [`CallOutcome::Skipped`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;

use crate::bridge::BridgeHandle;
use crate::error::{FatalError, ModuleError, ResolutionError};
use crate::lifecycle::BridgeState;
use crate::module::{
    ArgSpec, CallContext, Callback, MethodDescriptor, MethodKind, ModuleDescriptor,
    ModuleRegistry, Promise, UI_MANAGER_MODULE,
};
use crate::queue::panic_message;

/// Why a call did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownModule,
    UnknownMethod,
    /// The bridge was invalidated and the target may not run afterwards
    Invalidated,
    /// The interceptor rejected the call
    Vetoed,
    /// The module failed to construct
    NoInstance,
}

/// Result of invoking one call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Completed,
    Skipped(SkipReason),
    Fatal(FatalError),
}

/// A call as seen by an interceptor.
#[derive(Debug, Clone, Copy)]
pub struct InterceptedCall<'a> {
    pub module: &'a str,
    pub method: &'a str,
    pub args: &'a [ArgSpec],
    pub params: &'a [Value],
    /// Whether the method takes callbacks or returns a promise
    pub is_async: bool,
}

/// Decides whether a call may run. A veto skips the call; it is not an error.
pub trait CallInterceptor: Send + Sync + 'static {
    fn should_invoke(&self, call: &InterceptedCall<'_>) -> bool;
}

/// Invokes calls for one bridge generation.
pub struct CallInvoker {
    registry: Arc<ModuleRegistry>,
    state: Arc<BridgeState>,
    interceptor: Option<Arc<dyn CallInterceptor>>,
    bridge: BridgeHandle,
}

impl CallInvoker {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        state: Arc<BridgeState>,
        interceptor: Option<Arc<dyn CallInterceptor>>,
        bridge: BridgeHandle,
    ) -> Self {
        Self {
            registry,
            state,
            interceptor,
            bridge,
        }
    }

    fn log_unresolved(&self, error: ResolutionError) {
        if self.state.is_valid() {
            tracing::error!("{}", error);
        }
    }

    /// Invoke `method_id` on the module with `module_id`.
    pub fn invoke(&self, module_id: usize, method_id: usize, params: &[Value]) -> CallOutcome {
        match self.registry.resolve_id(module_id) {
            Some(descriptor) => self.invoke_on(&descriptor, method_id, params),
            None => {
                self.log_unresolved(ResolutionError::UnknownModuleId(module_id));
                CallOutcome::Skipped(SkipReason::UnknownModule)
            }
        }
    }

    /// Invoke `method_id` on a resolved module.
    pub fn invoke_on(
        &self,
        descriptor: &ModuleDescriptor,
        method_id: usize,
        params: &[Value],
    ) -> CallOutcome {
        let Some(method) = descriptor.method(method_id) else {
            self.log_unresolved(ResolutionError::UnknownMethodId {
                module: descriptor.name().to_string(),
                method_id,
            });
            return CallOutcome::Skipped(SkipReason::UnknownMethod);
        };

        // Other modules may still drain calls issued during teardown, but the
        // UI tree must not change once the bridge is invalid.
        if !self.state.is_valid() && descriptor.name() == UI_MANAGER_MODULE {
            tracing::debug!(method = %method.js_name, "Rejecting UIManager call on invalid bridge");
            return CallOutcome::Skipped(SkipReason::Invalidated);
        }

        if let Some(interceptor) = &self.interceptor {
            let call = InterceptedCall {
                module: descriptor.name(),
                method: &method.js_name,
                args: &method.args,
                params,
                is_async: method.is_async(),
            };
            if !interceptor.should_invoke(&call) {
                tracing::debug!(
                    module = %descriptor.name(),
                    method = %method.js_name,
                    "Call vetoed by interceptor"
                );
                return CallOutcome::Skipped(SkipReason::Vetoed);
            }
        }

        let Some(instance) = descriptor.instance() else {
            tracing::error!(module = %descriptor.name(), "No instance to invoke {}", method.js_name);
            return CallOutcome::Skipped(SkipReason::NoInstance);
        };

        tracing::trace!(module = %descriptor.name(), method = %method.js_name, "Invoking native method");

        let result = catch_unwind(AssertUnwindSafe(|| {
            let (args, cx) = self.prepare_call(descriptor, method, params)?;
            instance.call(method, args, &cx)
        }));

        match result {
            Ok(Ok(())) => CallOutcome::Completed,
            Ok(Err(ModuleError::Fatal(error))) => CallOutcome::Fatal(error),
            Ok(Err(error)) => {
                CallOutcome::Fatal(invocation_error(descriptor, method, params, error.to_string()))
            }
            Err(panic) => CallOutcome::Fatal(invocation_error(
                descriptor,
                method,
                params,
                panic_message(&panic),
            )),
        }
    }

    /// Check arity and split off the promise callbacks.
    fn prepare_call<'p>(
        &self,
        descriptor: &ModuleDescriptor,
        method: &MethodDescriptor,
        params: &'p [Value],
    ) -> Result<(&'p [Value], CallContext), ModuleError> {
        let expected = method.script_arity();
        if params.len() != expected {
            return Err(ModuleError::InvalidArgument {
                method: method.js_name.clone(),
                index: params.len().min(expected),
                reason: format!("expected {} arguments, got {}", expected, params.len()),
            });
        }

        if method.kind != MethodKind::Promise {
            let cx = CallContext::new(self.bridge.clone(), descriptor.name(), None);
            return Ok((params, cx));
        }

        let split = params.len() - 2;
        let resolve = method.callback_arg(params, split)?;
        let reject = method.callback_arg(params, split + 1)?;
        let promise = Promise::new(
            Callback::new(resolve, self.bridge.clone()),
            Callback::new(reject, self.bridge.clone()),
        );
        let cx = CallContext::new(self.bridge.clone(), descriptor.name(), Some(promise));
        Ok((&params[..split], cx))
    }
}

fn invocation_error(
    descriptor: &ModuleDescriptor,
    method: &MethodDescriptor,
    params: &[Value],
    message: String,
) -> FatalError {
    FatalError::Invocation {
        module: descriptor.name().to_string(),
        method: method.js_name.clone(),
        params: serde_json::to_string(params).unwrap_or_default(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ArgType, ContextAssignment, ModuleClass, NativeModule, RegistryBuilder};
    use crate::testing::{Recorder, RecordingModule, method_names};
    use serde_json::json;

    struct BlockModule(&'static str);

    impl CallInterceptor for BlockModule {
        fn should_invoke(&self, call: &InterceptedCall<'_>) -> bool {
            call.module != self.0
        }
    }

    #[derive(Default)]
    struct Capture {
        seen: parking_lot::Mutex<Option<(String, usize, Vec<Value>, bool)>>,
    }

    impl CallInterceptor for Capture {
        fn should_invoke(&self, call: &InterceptedCall<'_>) -> bool {
            *self.seen.lock() = Some((
                call.method.to_string(),
                call.args.len(),
                call.params.to_vec(),
                call.is_async,
            ));
            false
        }
    }

    struct Fixture {
        registry: Arc<ModuleRegistry>,
        state: Arc<BridgeState>,
        recorder: Recorder,
    }

    impl Fixture {
        fn new() -> Self {
            let recorder = Recorder::default();
            let mut builder = RegistryBuilder::new();
            for (type_name, context) in [
                ("NativeTiming", ContextAssignment::Dedicated),
                ("NativeUIManager", ContextAssignment::Main),
            ] {
                let recorder = recorder.clone();
                let name = crate::module::normalize_module_name(type_name);
                let mut class = ModuleClass::new(type_name, move || {
                    Some(Arc::new(RecordingModule::named(&name, recorder.clone()))
                        as Arc<dyn NativeModule>)
                })
                .on_context(context);
                for method in method_names(&["createTimer", "fail", "panic", "fatal"]) {
                    class = class.method(method);
                }
                class = class.method(
                    MethodDescriptor::new("measure")
                        .arg("tag", ArgType::Number)
                        .promise(),
                );
                builder.register_class(class);
            }

            let registry = Arc::new(ModuleRegistry::new());
            registry.install(builder);
            let state = Arc::new(BridgeState::new());
            state.begin_loading();
            Self {
                registry,
                state,
                recorder,
            }
        }

        fn invoker(&self, interceptor: Option<Arc<dyn CallInterceptor>>) -> CallInvoker {
            CallInvoker::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.state),
                interceptor,
                BridgeHandle::detached(),
            )
        }
    }

    #[test]
    fn test_completed_call_reaches_module() {
        let fixture = Fixture::new();
        let outcome = fixture.invoker(None).invoke(0, 0, &[]);

        assert_eq!(outcome, CallOutcome::Completed);
        assert_eq!(fixture.recorder.methods(), vec!["Timing.createTimer"]);
    }

    #[test]
    fn test_unknown_ids_are_skipped() {
        let fixture = Fixture::new();
        let invoker = fixture.invoker(None);

        assert_eq!(
            invoker.invoke(7, 0, &[]),
            CallOutcome::Skipped(SkipReason::UnknownModule)
        );
        assert_eq!(
            invoker.invoke(0, 9, &[json!(5)]),
            CallOutcome::Skipped(SkipReason::UnknownMethod)
        );
        assert!(fixture.recorder.is_empty());
    }

    #[test]
    fn test_ui_manager_rejected_after_invalidation() {
        let fixture = Fixture::new();
        let invoker = fixture.invoker(None);
        fixture.state.begin_invalidate();

        assert_eq!(
            invoker.invoke(1, 0, &[]),
            CallOutcome::Skipped(SkipReason::Invalidated)
        );
        assert_eq!(invoker.invoke(0, 0, &[]), CallOutcome::Completed);
        assert_eq!(fixture.recorder.methods(), vec!["Timing.createTimer"]);
    }

    #[test]
    fn test_veto_skips_without_invoking() {
        let fixture = Fixture::new();
        let invoker = fixture.invoker(Some(Arc::new(BlockModule("Timing"))));

        assert_eq!(
            invoker.invoke(0, 0, &[]),
            CallOutcome::Skipped(SkipReason::Vetoed)
        );
        assert_eq!(invoker.invoke(1, 0, &[]), CallOutcome::Completed);
        assert_eq!(fixture.recorder.methods(), vec!["UIManager.createTimer"]);
    }

    #[test]
    fn test_interceptor_sees_call_shape() {
        let fixture = Fixture::new();
        let capture = Arc::new(Capture::default());

        fixture
            .invoker(Some(Arc::clone(&capture) as Arc<dyn CallInterceptor>))
            .invoke(0, 4, &[json!(1), json!(10), json!(11)]);
        assert_eq!(
            capture.seen.lock().clone(),
            Some(("measure".to_string(), 1, vec![json!(1), json!(10), json!(11)], true))
        );
    }

    #[test]
    fn test_module_error_is_wrapped() {
        let fixture = Fixture::new();
        let outcome = fixture.invoker(None).invoke(0, 1, &[]);

        let CallOutcome::Fatal(FatalError::Invocation { module, method, params, message }) = outcome
        else {
            panic!("expected an invocation error, got {:?}", outcome);
        };
        assert_eq!(module, "Timing");
        assert_eq!(method, "fail");
        assert_eq!(params, "[]");
        assert_eq!(message, "boom");
    }

    #[test]
    fn test_panic_is_contained() {
        let fixture = Fixture::new();
        let outcome = fixture.invoker(None).invoke(0, 2, &[]);

        assert!(matches!(
            outcome,
            CallOutcome::Fatal(FatalError::Invocation { ref message, .. }) if message.contains("kaboom")
        ));
    }

    #[test]
    fn test_fatal_error_passes_through_unwrapped() {
        let fixture = Fixture::new();
        let outcome = fixture.invoker(None).invoke(0, 3, &[]);

        assert!(matches!(
            outcome,
            CallOutcome::Fatal(FatalError::Script { ref message, .. }) if message == "script failed"
        ));
    }

    #[test]
    fn test_arity_mismatch_is_fatal() {
        let fixture = Fixture::new();
        let outcome = fixture.invoker(None).invoke(0, 0, &[json!(1)]);

        assert!(matches!(
            outcome,
            CallOutcome::Fatal(FatalError::Invocation { ref method, .. }) if method == "createTimer"
        ));
        assert!(fixture.recorder.is_empty());
    }

    #[test]
    fn test_promise_callbacks_are_split_off() {
        let fixture = Fixture::new();
        let outcome = fixture
            .invoker(None)
            .invoke(0, 4, &[json!(3), json!(20), json!(21)]);

        assert_eq!(outcome, CallOutcome::Completed);
        let calls = fixture.recorder.calls();
        assert_eq!(calls[0].args, vec![json!(3)]);
        assert!(calls[0].had_promise);
    }
}
