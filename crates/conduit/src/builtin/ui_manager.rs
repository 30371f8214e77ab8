//! `UIManager` - a headless view tree.
//!
//! Scripts describe views by tag. Nothing is drawn; the tree is kept so a
//! host (or a test) can inspect what the script built.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use conduit_bridge::{
    ArgType, Capabilities, CallContext, ContextAssignment, MethodDescriptor, ModuleClass,
    ModuleError, NativeModule,
};
use parking_lot::RwLock;
use serde_json::{Map, Value};

/// A view created by the script.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    pub name: String,
    pub props: Map<String, Value>,
}

/// View state shared between the module and its host.
#[derive(Debug, Default)]
pub struct ViewTree {
    views: RwLock<BTreeMap<u64, View>>,
    batches: AtomicU64,
}

impl ViewTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, tag: u64) -> Option<View> {
        self.views.read().get(&tag).cloned()
    }

    pub fn len(&self) -> usize {
        self.views.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.read().is_empty()
    }

    /// Batches that touched the UI since startup.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }
}

pub struct UiManager {
    tree: Arc<ViewTree>,
}

impl UiManager {
    pub fn class(tree: Arc<ViewTree>) -> ModuleClass {
        let view = |name: &str| {
            MethodDescriptor::new(name)
                .arg("tag", ArgType::Number)
                .arg("viewName", ArgType::String)
                .arg("props", ArgType::Object)
        };

        ModuleClass::new("NativeUIManager", move || {
            let module: Arc<dyn NativeModule> = Arc::new(UiManager {
                tree: Arc::clone(&tree),
            });
            Some(module)
        })
        .method(view("createView"))
        .method(view("updateView"))
        .method(MethodDescriptor::new("removeView").arg("tag", ArgType::Number))
        .on_context(ContextAssignment::Main)
        .capabilities(Capabilities::none().with_batch_complete().with_cleanup())
    }

    fn tag(method: &MethodDescriptor, args: &[Value]) -> Result<u64, ModuleError> {
        let tag = method.f64_arg(args, 0)?;
        if tag < 0.0 || tag.fract() != 0.0 {
            return Err(ModuleError::InvalidArgument {
                method: method.js_name.clone(),
                index: 0,
                reason: "expected a view tag".into(),
            });
        }
        Ok(tag as u64)
    }

    fn props(args: &[Value]) -> Map<String, Value> {
        args.get(2)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

impl NativeModule for UiManager {
    fn call(
        &self,
        method: &MethodDescriptor,
        args: &[Value],
        _cx: &CallContext,
    ) -> Result<(), ModuleError> {
        let tag = Self::tag(method, args)?;
        let mut views = self.tree.views.write();

        match method.js_name.as_str() {
            "createView" => {
                let name = method.str_arg(args, 1)?.to_string();
                views.insert(
                    tag,
                    View {
                        name,
                        props: Self::props(args),
                    },
                );
            }
            "updateView" => {
                let view = views
                    .get_mut(&tag)
                    .ok_or_else(|| ModuleError::failed(format!("No view with tag {}", tag)))?;
                view.props.extend(Self::props(args));
            }
            "removeView" => {
                views.remove(&tag);
            }
            other => {
                return Err(ModuleError::failed(format!("UIManager has no method {}", other)));
            }
        }
        Ok(())
    }

    fn batch_did_complete(&self) {
        let batches = self.tree.batches.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(views = self.tree.len(), batches, "UI batch complete");
    }

    fn invalidate(&self) {
        self.tree.views.write().clear();
    }
}
