//! Module Descriptor
//!
//! Metadata and the lazily created instance of one registered module.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{Capabilities, ContextAssignment, MethodDescriptor, ModuleClass, NativeModule};
use crate::queue::ContextKey;

/// Lifecycle of a descriptor's instance.
enum InstanceSlot {
    /// Not created yet
    Pending,
    /// Created and live
    Ready(Arc<dyn NativeModule>),
    /// The factory returned no instance
    Failed,
    /// Released during teardown
    Released,
}

/// Executor placeholder registered under the script-executor role.
struct ExecutorModule;

impl NativeModule for ExecutorModule {
    fn call(
        &self,
        method: &MethodDescriptor,
        _args: &[Value],
        _cx: &super::CallContext,
    ) -> Result<(), crate::error::ModuleError> {
        Err(crate::error::ModuleError::failed(format!(
            "script executor has no method {}",
            method.js_name
        )))
    }
}

/// One registered module.
///
/// The name, id and method list are fixed for the generation. Only the
/// instance (and the constants derived from it) are materialized lazily, at
/// most once, by whichever thread asks first.
pub struct ModuleDescriptor {
    id: usize,
    name: String,
    class: ModuleClass,
    instance_backed: bool,
    executor_role: bool,
    slot: Mutex<InstanceSlot>,
    constants: OnceLock<Option<Map<String, Value>>>,
}

impl ModuleDescriptor {
    /// Descriptor for a type-backed module; the instance is built on first use.
    pub fn for_class(id: usize, class: ModuleClass) -> Self {
        Self {
            id,
            name: class.name(),
            class,
            instance_backed: false,
            executor_role: false,
            slot: Mutex::new(InstanceSlot::Pending),
            constants: OnceLock::new(),
        }
    }

    /// Descriptor for a type-backed module whose instance was already built.
    pub fn for_built(id: usize, class: ModuleClass, instance: Arc<dyn NativeModule>) -> Self {
        Self {
            slot: Mutex::new(InstanceSlot::Ready(instance)),
            ..Self::for_class(id, class)
        }
    }

    /// Descriptor for a module supplied with a pre-built instance.
    pub fn for_instance(id: usize, class: ModuleClass, instance: Arc<dyn NativeModule>) -> Self {
        Self {
            id,
            name: class.name(),
            class,
            instance_backed: true,
            executor_role: false,
            slot: Mutex::new(InstanceSlot::Ready(instance)),
            constants: OnceLock::new(),
        }
    }

    /// Descriptor filling the script-executor role.
    pub(crate) fn for_executor(id: usize, type_name: &str) -> Self {
        let class = ModuleClass::new(type_name, || None).on_context(ContextAssignment::Script);
        Self {
            id,
            name: class.name(),
            class,
            instance_backed: true,
            executor_role: true,
            slot: Mutex::new(InstanceSlot::Ready(Arc::new(ExecutorModule))),
            constants: OnceLock::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &ModuleClass {
        &self.class
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        self.class.methods()
    }

    /// Resolve a method by its id (index in the method list).
    pub fn method(&self, method_id: usize) -> Option<&MethodDescriptor> {
        self.class.methods().get(method_id)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.class.caps()
    }

    pub fn is_instance_backed(&self) -> bool {
        self.instance_backed
    }

    pub fn is_executor(&self) -> bool {
        self.executor_role
    }

    /// Whether this module must be materialized on the main context before the
    /// script runtime may assume it exists.
    pub fn requires_main_context_setup(&self) -> bool {
        self.class.needs_main_context_setup() || self.class.caps().exports_constants
    }

    /// The execution context this module's calls run on.
    pub fn context_key(&self) -> ContextKey {
        match self.class.context() {
            ContextAssignment::Dedicated => ContextKey::Serial(format!("{}Queue", self.name)),
            ContextAssignment::Main => ContextKey::Main,
            ContextAssignment::Script => ContextKey::Script,
            ContextAssignment::Serial(label) => ContextKey::Serial(label.clone()),
            ContextAssignment::Concurrent => ContextKey::Concurrent,
        }
    }

    /// Whether the instance has been created and not released.
    pub fn has_instance(&self) -> bool {
        matches!(*self.slot.lock(), InstanceSlot::Ready(_))
    }

    /// Whether the factory ran and returned no instance.
    pub fn has_failed(&self) -> bool {
        matches!(*self.slot.lock(), InstanceSlot::Failed)
    }

    /// The instance, creating it on first access.
    pub fn instance(&self) -> Option<Arc<dyn NativeModule>> {
        let mut slot = self.slot.lock();
        match &*slot {
            InstanceSlot::Ready(instance) => Some(Arc::clone(instance)),
            InstanceSlot::Failed | InstanceSlot::Released => None,
            InstanceSlot::Pending => {
                tracing::debug!(module = %self.name, "Creating module instance");
                match self.class.construct() {
                    Some(instance) => {
                        *slot = InstanceSlot::Ready(Arc::clone(&instance));
                        Some(instance)
                    }
                    None => {
                        tracing::error!(module = %self.name, "Module factory returned no instance");
                        *slot = InstanceSlot::Failed;
                        None
                    }
                }
            }
        }
    }

    /// The instance if it already exists; never creates it.
    pub fn loaded_instance(&self) -> Option<Arc<dyn NativeModule>> {
        match &*self.slot.lock() {
            InstanceSlot::Ready(instance) => Some(Arc::clone(instance)),
            _ => None,
        }
    }

    /// Exported constants, computed once from the instance.
    pub fn constants(&self) -> Option<&Map<String, Value>> {
        if !self.class.caps().exports_constants {
            return None;
        }
        self.constants
            .get_or_init(|| self.instance().and_then(|instance| instance.constants()))
            .as_ref()
    }

    /// Release the instance. Later accesses return `None`.
    pub fn invalidate(&self) {
        *self.slot.lock() = InstanceSlot::Released;
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("instance_backed", &self.instance_backed)
            .field("has_instance", &self.has_instance())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;
    use crate::module::{CallContext, Capabilities};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Constant;

    impl NativeModule for Constant {
        fn call(&self, _: &MethodDescriptor, _: &[Value], _: &CallContext) -> Result<(), ModuleError> {
            Ok(())
        }

        fn constants(&self) -> Option<Map<String, Value>> {
            let mut map = Map::new();
            map.insert("answer".into(), Value::from(42));
            Some(map)
        }
    }

    #[test]
    fn test_instance_created_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let class = ModuleClass::new("NativeConstant", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(Constant) as Arc<dyn NativeModule>)
        });
        let descriptor = ModuleDescriptor::for_class(0, class);

        assert!(!descriptor.has_instance());
        assert!(descriptor.loaded_instance().is_none());
        assert!(descriptor.instance().is_some());
        assert!(descriptor.instance().is_some());
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(descriptor.has_instance());
    }

    #[test]
    fn test_failed_factory_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let class = ModuleClass::new("NativeBroken", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        });
        let descriptor = ModuleDescriptor::for_class(3, class);

        assert!(!descriptor.has_failed());
        assert!(descriptor.instance().is_none());
        assert!(descriptor.instance().is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(descriptor.has_failed());
    }

    #[test]
    fn test_built_descriptor_keeps_instance() {
        let instance: Arc<dyn NativeModule> = Arc::new(Constant);
        let class = ModuleClass::new("NativeConstant", || panic!("factory must not run"));
        let descriptor = ModuleDescriptor::for_built(4, class, Arc::clone(&instance));

        assert!(!descriptor.is_instance_backed());
        assert!(Arc::ptr_eq(&descriptor.instance().unwrap(), &instance));
        assert_eq!(descriptor.name(), "Constant");
    }

    #[test]
    fn test_constants_require_capability() {
        let plain = ModuleDescriptor::for_class(0, ModuleClass::of::<ConstantDefault>("NativeA"));
        assert!(plain.constants().is_none());
        assert!(!plain.requires_main_context_setup());

        let exporting = ModuleDescriptor::for_class(
            1,
            ModuleClass::of::<ConstantDefault>("NativeB")
                .capabilities(Capabilities::none().with_constants()),
        );
        assert!(exporting.requires_main_context_setup());
        assert_eq!(exporting.constants().unwrap()["answer"], 42);
    }

    #[test]
    fn test_invalidate_releases_instance() {
        let descriptor = ModuleDescriptor::for_instance(
            0,
            ModuleClass::new("NativeConstant", || None),
            Arc::new(Constant),
        );
        assert!(descriptor.is_instance_backed());
        assert!(descriptor.has_instance());

        descriptor.invalidate();
        assert!(!descriptor.has_instance());
        assert!(descriptor.instance().is_none());
    }

    #[test]
    fn test_context_keys() {
        let dedicated = ModuleDescriptor::for_class(0, ModuleClass::new("NativeTiming", || None));
        assert_eq!(dedicated.context_key(), ContextKey::Serial("TimingQueue".into()));

        let main = ModuleDescriptor::for_class(
            1,
            ModuleClass::new("NativeUIManager", || None).on_context(ContextAssignment::Main),
        );
        assert_eq!(main.context_key(), ContextKey::Main);

        let executor = ModuleDescriptor::for_executor(2, "NativeQuickJsExecutor");
        assert!(executor.is_executor());
        assert_eq!(executor.context_key(), ContextKey::Script);
        assert_eq!(executor.name(), "QuickJsExecutor");
    }

    #[derive(Default)]
    struct ConstantDefault;

    impl NativeModule for ConstantDefault {
        fn call(&self, _: &MethodDescriptor, _: &[Value], _: &CallContext) -> Result<(), ModuleError> {
            Ok(())
        }

        fn constants(&self) -> Option<Map<String, Value>> {
            Constant.constants()
        }
    }
}
