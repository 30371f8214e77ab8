//! Conduit Bridge - batched call bridge between a host and a script runtime
//!
//! This crate contains the core of the bridge:
//! - `module`: native module declarations, descriptors and the module registry
//! - `codec`: the wire format for call batches and the module configuration payload
//! - `queue` / `router`: execution contexts and per-context dispatch of batches
//! - `invoker`: execution of a single decoded call against a module instance
//! - `lifecycle` / `bridge`: bridge generations, startup, reload and teardown
//!
//! The scripting engine itself is a collaborator behind the `ScriptExecutor`
//! trait; see the `conduit-js-runtime` crate for a QuickJS implementation.

pub mod bridge;
pub mod codec;
pub mod error;
pub mod executor;
pub mod frame;
pub mod invoker;
pub mod lifecycle;
pub mod module;
pub mod queue;
pub mod router;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{Bridge, BridgeBuilder, BridgeGeneration, BridgeHandle};
pub use codec::{Batch, ConfigStyle};
pub use error::{
    EnqueueError, FatalError, LifecycleError, ModuleError, ProtocolError, ResolutionError,
};
pub use executor::{
    DiagnosticSurface, LoadProgress, ProgressFn, ScriptError, ScriptExecutor, Source, SourceLoader,
    StaticSourceLoader,
};
pub use invoker::{CallInterceptor, CallOutcome, InterceptedCall, SkipReason};
pub use lifecycle::{BridgeEvent, BridgeEventKind, InvalidateReason, LifecyclePhase};
pub use module::{
    ArgSpec, ArgType, CallContext, Callback, Capabilities, ContextAssignment, MethodDescriptor,
    MethodKind, ModuleClass, NativeModule, PreparedModule, Promise,
};
