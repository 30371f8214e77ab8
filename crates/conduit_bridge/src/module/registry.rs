// Module Registry - Stable name/id mapping for all native modules
//
// The registry is rebuilt once per bridge generation. Both views (by name and
// by id) live in one immutable table that is swapped under a single lock, so
// readers always see a consistent pair.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ModuleClass, ModuleDescriptor, PreparedModule};
use crate::executor::ScriptExecutor;

/// Builds the script executor when no pre-built one was supplied.
pub type ExecutorFactory = Arc<dyn Fn() -> Arc<dyn ScriptExecutor> + Send + Sync>;

/// Immutable snapshot of the registered modules.
#[derive(Default)]
struct ModuleTable {
    by_id: Vec<Arc<ModuleDescriptor>>,
    by_name: HashMap<String, usize>,
}

/// Staging area for one registry build.
///
/// Ids are assigned in registration order. A name keeps its id even when a
/// later registration takes it over.
#[derive(Default)]
pub struct RegistryBuilder {
    table: ModuleTable,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: String, make: impl FnOnce(usize) -> ModuleDescriptor) -> usize {
        let id = self.table.by_id.len();
        self.table.by_id.push(Arc::new(make(id)));
        self.table.by_name.insert(name, id);
        id
    }

    /// Register a module with a pre-built instance.
    ///
    /// On a name collision the later registration is dropped.
    pub fn register_instance(&mut self, module: PreparedModule) -> Option<usize> {
        let name = module.class.name();
        if let Some(&existing) = self.table.by_name.get(&name) {
            tracing::warn!(
                module = %name,
                type_name = module.class.type_name(),
                existing_type = self.table.by_id[existing].class().type_name(),
                "Attempted to register module instance for a name that is already registered, dropping it"
            );
            return None;
        }
        let PreparedModule { class, instance } = module;
        Some(self.push(name, |id| ModuleDescriptor::for_instance(id, class, instance)))
    }

    /// Register the descriptor filling the script-executor role.
    pub fn register_executor(&mut self, type_name: &str) -> Option<usize> {
        let name = super::normalize_module_name(type_name);
        if self.table.by_name.contains_key(&name) {
            tracing::warn!(module = %name, "Script executor name is already registered");
            return None;
        }
        Some(self.push(name, |id| ModuleDescriptor::for_executor(id, type_name)))
    }

    /// Register a type-backed module.
    ///
    /// Instance-backed modules always keep their name. Between two type-backed
    /// modules, the one that constructs wins; if both construct the later one
    /// wins and the ambiguity is logged as an error.
    pub fn register_class(&mut self, class: ModuleClass) -> Option<usize> {
        let name = class.name();
        let Some(&id) = self.table.by_name.get(&name) else {
            return Some(self.push(name, |id| ModuleDescriptor::for_class(id, class)));
        };

        let existing = &self.table.by_id[id];
        if existing.is_instance_backed() {
            tracing::debug!(
                module = %name,
                type_name = class.type_name(),
                "Skipping module type, name is held by a module instance"
            );
            return None;
        }

        // The contender is built now to settle the name; the winner keeps
        // its instance so its factory runs only once.
        let Some(instance) = class.construct() else {
            tracing::warn!(
                module = %name,
                type_name = class.type_name(),
                "Module type failed to construct, keeping {}",
                existing.class().type_name()
            );
            return None;
        };

        if existing.loaded_instance().is_some() || existing.class().construct().is_some() {
            tracing::error!(
                module = %name,
                "Attempted to register module type {} for the name '{}', but name was already registered by {}",
                class.type_name(),
                name,
                existing.class().type_name()
            );
        }

        self.table.by_id[id] = Arc::new(ModuleDescriptor::for_built(id, class, instance));
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.table.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.by_id.is_empty()
    }
}

/// Everything needed to build the registry for one generation.
pub struct RegistryInput {
    /// Modules supplied with pre-built instances, registered first
    pub extra_modules: Vec<PreparedModule>,
    /// A pre-built script executor, if the host supplies one
    pub executor: Option<Arc<dyn ScriptExecutor>>,
    /// Builds the executor otherwise
    pub executor_factory: ExecutorFactory,
    /// Statically declared module types
    pub classes: Vec<ModuleClass>,
}

/// Registry of all modules in a bridge generation.
#[derive(Default)]
pub struct ModuleRegistry {
    table: Mutex<Arc<ModuleTable>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and install the module table, returning the script executor.
    pub fn build(&self, input: RegistryInput) -> Arc<dyn ScriptExecutor> {
        let mut builder = RegistryBuilder::new();

        for module in input.extra_modules {
            builder.register_instance(module);
        }

        // Other modules may need the executor, so it exists before they do.
        let executor = input
            .executor
            .unwrap_or_else(|| (input.executor_factory)());
        builder.register_executor(executor.type_name());

        for class in input.classes {
            builder.register_class(class);
        }

        tracing::debug!(modules = builder.len(), "Module registry built");
        self.install(builder);
        executor
    }

    /// Replace the module table.
    pub fn install(&self, builder: RegistryBuilder) {
        *self.table.lock() = Arc::new(builder.table);
    }

    fn current(&self) -> Arc<ModuleTable> {
        Arc::clone(&self.table.lock())
    }

    /// Resolve a module by name. A name whose only contender failed to
    /// construct is unresolved.
    pub fn resolve_name(&self, name: &str) -> Option<Arc<ModuleDescriptor>> {
        let table = self.current();
        table
            .by_name
            .get(name)
            .and_then(|&id| table.by_id.get(id))
            .filter(|descriptor| !descriptor.has_failed())
            .cloned()
    }

    /// Resolve a module by id. Stale ids resolve to `None`.
    pub fn resolve_id(&self, id: usize) -> Option<Arc<ModuleDescriptor>> {
        self.current().by_id.get(id).cloned()
    }

    /// All descriptors in id order.
    pub fn snapshot(&self) -> Vec<Arc<ModuleDescriptor>> {
        self.current().by_id.clone()
    }

    /// Drop every descriptor.
    pub fn clear(&self) {
        *self.table.lock() = Arc::new(ModuleTable::default());
    }

    pub fn len(&self) -> usize {
        self.current().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::NativeModule;
    use crate::testing::{MockExecutor, Recorder, RecordingModule};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_class(type_name: &str) -> ModuleClass {
        let recorder = Recorder::default();
        ModuleClass::new(type_name, move || {
            Some(Arc::new(RecordingModule::new(recorder.clone())) as Arc<dyn NativeModule>)
        })
    }

    fn input(extra: Vec<PreparedModule>, classes: Vec<ModuleClass>) -> RegistryInput {
        RegistryInput {
            extra_modules: extra,
            executor: None,
            executor_factory: Arc::new(|| Arc::new(MockExecutor::new()) as Arc<dyn ScriptExecutor>),
            classes,
        }
    }

    #[test]
    fn test_name_and_id_views_agree() {
        let registry = ModuleRegistry::new();
        registry.build(input(
            vec![],
            vec![recording_class("NativeTiming"), recording_class("NativeUIManager")],
        ));

        for descriptor in registry.snapshot() {
            let by_name = registry.resolve_name(descriptor.name()).unwrap();
            let by_id = registry.resolve_id(descriptor.id()).unwrap();
            assert!(Arc::ptr_eq(&by_name, &by_id));
            assert!(Arc::ptr_eq(&by_name, &descriptor));
        }
    }

    #[test]
    fn test_build_order_extras_then_executor_then_classes() {
        let registry = ModuleRegistry::new();
        let instance: Arc<dyn NativeModule> = Arc::new(RecordingModule::new(Recorder::default()));
        registry.build(input(
            vec![PreparedModule::new(recording_class("NativeLinking"), instance)],
            vec![recording_class("NativeTiming")],
        ));

        let names: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["Linking", "MockExecutor", "Timing"]);
        assert!(registry.resolve_id(1).unwrap().is_executor());
    }

    #[test]
    fn test_instance_backed_module_wins_collision() {
        let registry = ModuleRegistry::new();
        let first: Arc<dyn NativeModule> = Arc::new(RecordingModule::new(Recorder::default()));
        let second: Arc<dyn NativeModule> = Arc::new(RecordingModule::new(Recorder::default()));
        registry.build(input(
            vec![
                PreparedModule::new(recording_class("NativeTiming"), Arc::clone(&first)),
                PreparedModule::new(recording_class("Timing"), second),
            ],
            vec![recording_class("NativeTiming")],
        ));

        let timing = registry.resolve_name("Timing").unwrap();
        assert!(timing.is_instance_backed());
        assert!(Arc::ptr_eq(&timing.instance().unwrap(), &first));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_failed_type_cedes_name() {
        let registry = ModuleRegistry::new();
        registry.build(input(
            vec![],
            vec![
                ModuleClass::new("NativeStorage", || None),
                recording_class("Storage"),
                ModuleClass::new("NativeStorage", || None),
            ],
        ));

        let storage = registry.resolve_name("Storage").unwrap();
        assert_eq!(storage.class().type_name(), "Storage");
        assert_eq!(storage.id(), 1);
    }

    #[test]
    fn test_ambiguous_types_keep_one_descriptor() {
        let registry = ModuleRegistry::new();
        registry.build(input(
            vec![],
            vec![recording_class("NativeClipboard"), recording_class("Clipboard")],
        ));

        assert_eq!(registry.len(), 2);
        let clipboard = registry.resolve_name("Clipboard").unwrap();
        assert_eq!(clipboard.class().type_name(), "Clipboard");
        assert_eq!(clipboard.id(), 1);
    }

    #[test]
    fn test_unresolved_name_when_no_contender_survives() {
        let registry = ModuleRegistry::new();
        registry.build(input(
            vec![],
            vec![
                ModuleClass::new("NativeBroken", || None),
                ModuleClass::new("Broken", || None),
            ],
        ));

        // The failed contender cedes without taking a second id.
        assert_eq!(registry.len(), 2);
        let broken = registry.resolve_id(1).unwrap();
        assert_eq!(broken.class().type_name(), "NativeBroken");
        assert!(broken.instance().is_none());

        assert!(registry.resolve_name("Broken").is_none());
        assert!(registry.resolve_name("Missing").is_none());
        assert!(registry.resolve_id(99).is_none());
    }

    #[test]
    fn test_collision_winner_is_built_once() {
        let counted = |type_name: &str, built: &Arc<AtomicUsize>| {
            let built = Arc::clone(built);
            ModuleClass::new(type_name, move || {
                built.fetch_add(1, Ordering::SeqCst);
                Some(Arc::new(RecordingModule::new(Recorder::default())) as Arc<dyn NativeModule>)
            })
        };
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let registry = ModuleRegistry::new();
        registry.build(input(
            vec![],
            vec![counted("NativeClipboard", &first), counted("Clipboard", &second)],
        ));
        assert_eq!(second.load(Ordering::SeqCst), 1);

        let clipboard = registry.resolve_name("Clipboard").unwrap();
        assert!(clipboard.has_instance());
        let instance = clipboard.instance().unwrap();
        assert!(Arc::ptr_eq(&instance, &clipboard.instance().unwrap()));
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(first.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prebuilt_executor_is_used() {
        let registry = ModuleRegistry::new();
        let executor = Arc::new(MockExecutor::new());
        let mut input = input(vec![], vec![]);
        input.executor = Some(executor.clone() as Arc<dyn ScriptExecutor>);
        input.executor_factory = Arc::new(|| panic!("factory must not run"));

        let built = registry.build(input);
        assert_eq!(built.type_name(), executor.type_name());
        registry.clear();
        assert!(registry.is_empty());
    }
}
