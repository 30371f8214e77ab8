//! Native Modules
//!
//! A native module is a capability exposed to the script runtime. Modules are
//! declared with a [`ModuleClass`] (name, methods, execution context,
//! capabilities and a factory) and registered in the [`ModuleRegistry`], which
//! owns one [`ModuleDescriptor`] per module for the lifetime of a bridge
//! generation.
//!
//! # Naming
//!
//! The name seen by scripts is derived from the declared type name with the
//! framework prefix `Native` stripped (`NativeTiming` → `Timing`). The legacy
//! name `NativeModules` keeps its prefix.

mod descriptor;
mod registry;

pub use descriptor::*;
pub use registry::*;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::bridge::BridgeHandle;
use crate::error::{LifecycleError, ModuleError};
use crate::frame::FrameTick;

/// Prefix stripped from declared type names.
pub const FRAMEWORK_PREFIX: &str = "Native";

/// Stripped name that must keep the framework prefix.
pub const RESERVED_LEGACY_NAME: &str = "Modules";

/// Name of the UI-tree manager, which is never called after invalidation.
pub const UI_MANAGER_MODULE: &str = "UIManager";

/// Derive the script-visible module name from a declared type name.
pub fn normalize_module_name(declared: &str) -> String {
    match declared.strip_prefix(FRAMEWORK_PREFIX) {
        Some(stripped) if !stripped.is_empty() && stripped != RESERVED_LEGACY_NAME => {
            stripped.to_string()
        }
        _ => declared.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Methods
// ─────────────────────────────────────────────────────────────────────────────

/// How a method reports back to the script side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Fire and forget
    Normal,
    /// Takes one or more callback ids among its arguments
    Callback,
    /// Takes a trailing resolve/reject callback pair
    Promise,
}

/// Declared type of a method argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Any,
    Number,
    String,
    Boolean,
    Array,
    Object,
    Callback,
}

/// A declared method argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    pub name: String,
    pub ty: ArgType,
    pub nullable: bool,
}

/// A method exposed to scripts.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    /// Name as seen by the script side
    pub js_name: String,
    pub kind: MethodKind,
    pub args: Vec<ArgSpec>,
}

impl MethodDescriptor {
    pub fn new(js_name: impl Into<String>) -> Self {
        Self {
            js_name: js_name.into(),
            kind: MethodKind::Normal,
            args: Vec::new(),
        }
    }

    /// Add an argument. Adding a callback argument makes the method callback-taking.
    pub fn arg(mut self, name: impl Into<String>, ty: ArgType) -> Self {
        if ty == ArgType::Callback && self.kind == MethodKind::Normal {
            self.kind = MethodKind::Callback;
        }
        self.args.push(ArgSpec {
            name: name.into(),
            ty,
            nullable: false,
        });
        self
    }

    /// Add an argument that may be null.
    pub fn optional_arg(mut self, name: impl Into<String>, ty: ArgType) -> Self {
        self = self.arg(name, ty);
        if let Some(last) = self.args.last_mut() {
            last.nullable = true;
        }
        self
    }

    /// Mark the method as promise-returning.
    pub fn promise(mut self) -> Self {
        self.kind = MethodKind::Promise;
        self
    }

    /// Whether the script side expects an asynchronous reply.
    pub fn is_async(&self) -> bool {
        self.kind != MethodKind::Normal
    }

    /// Number of parameters the script side sends for this method.
    pub fn script_arity(&self) -> usize {
        match self.kind {
            MethodKind::Promise => self.args.len() + 2,
            _ => self.args.len(),
        }
    }

    fn invalid(&self, index: usize, reason: &str) -> ModuleError {
        ModuleError::InvalidArgument {
            method: self.js_name.clone(),
            index,
            reason: reason.to_string(),
        }
    }

    /// Read a string argument.
    pub fn str_arg<'a>(&self, args: &'a [Value], index: usize) -> Result<&'a str, ModuleError> {
        args.get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid(index, "expected a string"))
    }

    /// Read a numeric argument.
    pub fn f64_arg(&self, args: &[Value], index: usize) -> Result<f64, ModuleError> {
        args.get(index)
            .and_then(Value::as_f64)
            .ok_or_else(|| self.invalid(index, "expected a number"))
    }

    /// Read a callback id argument.
    pub fn callback_arg(&self, args: &[Value], index: usize) -> Result<u64, ModuleError> {
        args.get(index)
            .and_then(Value::as_u64)
            .ok_or_else(|| self.invalid(index, "expected a callback id"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities & Contexts
// ─────────────────────────────────────────────────────────────────────────────

/// Optional hooks a module implements. Checked once at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `invalidate` is called during bridge teardown
    pub cleanup: bool,
    /// `partial_batch_did_flush` is called after immediate flushes
    pub partial_flush: bool,
    /// `batch_did_complete` is called after each batch
    pub batch_complete: bool,
    /// `constants` is exported in the module configuration
    pub exports_constants: bool,
    /// `did_update_frame` is called on every frame tick
    pub frame_updates: bool,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_cleanup(mut self) -> Self {
        self.cleanup = true;
        self
    }

    pub fn with_partial_flush(mut self) -> Self {
        self.partial_flush = true;
        self
    }

    pub fn with_batch_complete(mut self) -> Self {
        self.batch_complete = true;
        self
    }

    pub fn with_constants(mut self) -> Self {
        self.exports_constants = true;
        self
    }

    pub fn with_frame_updates(mut self) -> Self {
        self.frame_updates = true;
        self
    }
}

/// Where a module's methods run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContextAssignment {
    /// A serial context of its own, labelled after the module
    #[default]
    Dedicated,
    /// The UI-affinity context
    Main,
    /// The script-affinity context
    Script,
    /// A named serial context, shared by every module naming it
    Serial(String),
    /// The shared concurrent context
    Concurrent,
}

// ─────────────────────────────────────────────────────────────────────────────
// Native Module Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A native capability exposed to scripts.
///
/// Only `call` is required. The other hooks are invoked only when the
/// matching flag is set in the module's [`Capabilities`].
pub trait NativeModule: Send + Sync + 'static {
    /// Execute one method call.
    fn call(
        &self,
        method: &MethodDescriptor,
        args: &[Value],
        cx: &CallContext,
    ) -> Result<(), ModuleError>;

    /// Constants exported to scripts alongside the module configuration.
    fn constants(&self) -> Option<serde_json::Map<String, Value>> {
        None
    }

    /// Release resources when the bridge generation is torn down.
    fn invalidate(&self) {}

    /// Called after all of this module's calls in a batch ran.
    fn batch_did_complete(&self) {}

    /// Called after all of this module's calls in an immediate flush ran.
    fn partial_batch_did_flush(&self) {}

    /// Called on every frame tick.
    fn did_update_frame(&self, _tick: FrameTick) {}
}

/// Builds a module instance; `None` means construction failed.
pub type ModuleFactory = Arc<dyn Fn() -> Option<Arc<dyn NativeModule>> + Send + Sync>;

/// Static declaration of a module type.
#[derive(Clone)]
pub struct ModuleClass {
    type_name: String,
    module_name: Option<String>,
    methods: Vec<MethodDescriptor>,
    context: ContextAssignment,
    requires_main_context_setup: bool,
    capabilities: Capabilities,
    factory: ModuleFactory,
}

impl ModuleClass {
    /// Declare a module type with the given factory.
    pub fn new<F>(type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Option<Arc<dyn NativeModule>> + Send + Sync + 'static,
    {
        Self {
            type_name: type_name.into(),
            module_name: None,
            methods: Vec::new(),
            context: ContextAssignment::default(),
            requires_main_context_setup: false,
            capabilities: Capabilities::default(),
            factory: Arc::new(factory),
        }
    }

    /// Declare a module type constructed with `Default`.
    pub fn of<M: NativeModule + Default>(type_name: impl Into<String>) -> Self {
        Self::new(type_name, || Some(Arc::new(M::default()) as Arc<dyn NativeModule>))
    }

    /// Override the declared name (the prefix rule still applies).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.module_name = Some(name.into());
        self
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn on_context(mut self, context: ContextAssignment) -> Self {
        self.context = context;
        self
    }

    pub fn requires_main_context_setup(mut self) -> Self {
        self.requires_main_context_setup = true;
        self
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Script-visible module name.
    pub fn name(&self) -> String {
        normalize_module_name(self.module_name.as_deref().unwrap_or(&self.type_name))
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn context(&self) -> &ContextAssignment {
        &self.context
    }

    pub fn needs_main_context_setup(&self) -> bool {
        self.requires_main_context_setup
    }

    pub fn caps(&self) -> Capabilities {
        self.capabilities
    }

    /// Run the factory.
    pub fn construct(&self) -> Option<Arc<dyn NativeModule>> {
        (self.factory)()
    }
}

impl fmt::Debug for ModuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleClass")
            .field("type_name", &self.type_name)
            .field("name", &self.name())
            .field("methods", &self.methods.len())
            .field("context", &self.context)
            .finish()
    }
}

/// A module supplied with a pre-built instance.
#[derive(Clone)]
pub struct PreparedModule {
    pub class: ModuleClass,
    pub instance: Arc<dyn NativeModule>,
}

impl PreparedModule {
    pub fn new(class: ModuleClass, instance: Arc<dyn NativeModule>) -> Self {
        Self { class, instance }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call Context
// ─────────────────────────────────────────────────────────────────────────────

/// A script callback, identified by the id the script side assigned to it.
#[derive(Clone)]
pub struct Callback {
    id: u64,
    bridge: BridgeHandle,
}

impl Callback {
    pub fn new(id: u64, bridge: BridgeHandle) -> Self {
        Self { id, bridge }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Invoke the callback on the script context.
    pub fn invoke(&self, args: Vec<Value>) -> Result<(), LifecycleError> {
        self.bridge.enqueue_callback(self.id, args)
    }
}

/// Resolve/reject pair handed to promise-returning methods.
#[derive(Clone)]
pub struct Promise {
    resolve: Callback,
    reject: Callback,
}

impl Promise {
    pub fn new(resolve: Callback, reject: Callback) -> Self {
        Self { resolve, reject }
    }

    pub fn resolve(&self, value: Value) -> Result<(), LifecycleError> {
        self.resolve.invoke(vec![value])
    }

    pub fn reject(&self, code: &str, message: &str) -> Result<(), LifecycleError> {
        self.reject
            .invoke(vec![serde_json::json!({ "code": code, "message": message })])
    }
}

/// Per-call context passed to [`NativeModule::call`].
pub struct CallContext {
    bridge: BridgeHandle,
    module: String,
    promise: Option<Promise>,
}

impl CallContext {
    pub fn new(bridge: BridgeHandle, module: impl Into<String>, promise: Option<Promise>) -> Self {
        Self {
            bridge,
            module: module.into(),
            promise,
        }
    }

    pub fn bridge(&self) -> &BridgeHandle {
        &self.bridge
    }

    /// Name of the module being called.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Promise responder, present for promise-returning methods.
    pub fn promise(&self) -> Option<&Promise> {
        self.promise.as_ref()
    }

    /// Build a callback from a callback id argument.
    pub fn callback(
        &self,
        method: &MethodDescriptor,
        args: &[Value],
        index: usize,
    ) -> Result<Callback, ModuleError> {
        let id = method.callback_arg(args, index)?;
        Ok(Callback::new(id, self.bridge.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_module_name() {
        assert_eq!(normalize_module_name("NativeTiming"), "Timing");
        assert_eq!(normalize_module_name("NativeUIManager"), "UIManager");
        assert_eq!(normalize_module_name("NativeModules"), "NativeModules");
        assert_eq!(normalize_module_name("Timing"), "Timing");
        assert_eq!(normalize_module_name("Native"), "Native");
    }

    #[test]
    fn test_method_kind_follows_arguments() {
        let method = MethodDescriptor::new("measure")
            .arg("tag", ArgType::Number)
            .arg("callback", ArgType::Callback);
        assert_eq!(method.kind, MethodKind::Callback);
        assert_eq!(method.script_arity(), 2);
        assert!(method.is_async());

        let method = MethodDescriptor::new("fetch").arg("url", ArgType::String).promise();
        assert_eq!(method.kind, MethodKind::Promise);
        assert_eq!(method.script_arity(), 3);

        let method = MethodDescriptor::new("log").optional_arg("message", ArgType::String);
        assert_eq!(method.kind, MethodKind::Normal);
        assert!(method.args[0].nullable);
    }

    #[test]
    fn test_argument_readers() {
        let method = MethodDescriptor::new("log")
            .arg("level", ArgType::String)
            .arg("count", ArgType::Number);
        let args = vec![serde_json::json!("info"), serde_json::json!(3)];

        assert_eq!(method.str_arg(&args, 0).unwrap(), "info");
        assert_eq!(method.f64_arg(&args, 1).unwrap(), 3.0);
        assert!(matches!(
            method.str_arg(&args, 1),
            Err(ModuleError::InvalidArgument { index: 1, .. })
        ));
    }

    #[test]
    fn test_class_name_uses_override() {
        let class = ModuleClass::new("NativeThing", || None).named("NativeWidget");
        assert_eq!(class.name(), "Widget");
        assert_eq!(class.type_name(), "NativeThing");
        assert!(class.construct().is_none());
    }
}
