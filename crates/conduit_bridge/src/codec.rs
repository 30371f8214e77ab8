//! Call Batch Codec
//!
//! Script → native batches are position-fixed arrays of arrays:
//!
//! ```text
//! [ [moduleId, ...], [methodId, ...], [[param, ...], ...], callId? ]
//! ```
//!
//! Native → script, the module configuration is a JSON document keyed under
//! `remoteModuleConfig` with one entry per module in id order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::module::{MethodKind, ModuleDescriptor};

/// Call id of a batch that carries none.
pub const NO_CALL_ID: i64 = -1;

/// Top-level property of the module configuration payload.
pub const CONFIG_PROPERTY: &str = "remoteModuleConfig";

const MODULE_IDS: usize = 0;
const METHOD_IDS: usize = 1;
const PARAMS: usize = 2;
const CALL_ID: usize = 3;

/// A decoded batch of calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub module_ids: Vec<usize>,
    pub method_ids: Vec<usize>,
    pub params: Vec<Vec<Value>>,
    /// Correlation id, `NO_CALL_ID` if absent
    pub call_id: i64,
}

impl Batch {
    /// Decode a batch from its JSON value.
    ///
    /// Elements past the call id are ignored.
    pub fn decode(raw: &Value) -> Result<Self, ProtocolError> {
        let sections = raw.as_array().ok_or(ProtocolError::NotAnArray)?;
        if sections.len() < 3 {
            return Err(ProtocolError::TooShort(sections.len()));
        }
        if sections.len() > CALL_ID + 1 {
            tracing::debug!(
                extra = sections.len() - (CALL_ID + 1),
                "Ignoring trailing batch elements"
            );
        }

        let module_ids = decode_ids(&sections[MODULE_IDS], MODULE_IDS)?;
        let method_ids = decode_ids(&sections[METHOD_IDS], METHOD_IDS)?;
        let params = sections[PARAMS]
            .as_array()
            .ok_or(ProtocolError::SectionNotArray(PARAMS))?
            .iter()
            .enumerate()
            .map(|(index, params)| {
                params
                    .as_array()
                    .cloned()
                    .ok_or(ProtocolError::InvalidParams(index))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if module_ids.len() != method_ids.len() || module_ids.len() != params.len() {
            return Err(ProtocolError::LengthMismatch {
                modules: module_ids.len(),
                methods: method_ids.len(),
                params: params.len(),
            });
        }

        let call_id = match sections.get(CALL_ID) {
            None => NO_CALL_ID,
            Some(value) => value.as_i64().unwrap_or_else(|| {
                tracing::warn!(call_id = %value, "Batch call id is not an integer");
                NO_CALL_ID
            }),
        };

        Ok(Self {
            module_ids,
            method_ids,
            params,
            call_id,
        })
    }

    /// Decode a batch from JSON text.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Parse(e.to_string()))?;
        Self::decode(&raw)
    }

    /// Number of calls.
    pub fn len(&self) -> usize {
        self.module_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_ids.is_empty()
    }

    pub fn call_id(&self) -> Option<i64> {
        (self.call_id != NO_CALL_ID).then_some(self.call_id)
    }
}

fn decode_ids(section: &Value, index: usize) -> Result<Vec<usize>, ProtocolError> {
    section
        .as_array()
        .ok_or(ProtocolError::SectionNotArray(index))?
        .iter()
        .enumerate()
        .map(|(position, id)| {
            id.as_u64()
                .map(|id| id as usize)
                .ok_or(ProtocolError::InvalidId {
                    section: index,
                    index: position,
                })
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Module Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Shape of each module configuration entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStyle {
    /// `[name, constants, methods, promiseMethodIds]`
    #[default]
    Full,
    /// `[name]`; the engine discovers the rest itself
    Minimal,
}

/// Configuration entry for one module.
pub fn module_entry(descriptor: &ModuleDescriptor, style: ConfigStyle) -> Value {
    let name = Value::String(descriptor.name().to_string());
    if style == ConfigStyle::Minimal {
        return Value::Array(vec![name]);
    }

    let constants = descriptor
        .constants()
        .map(|c| Value::Object(c.clone()))
        .unwrap_or(Value::Null);

    let methods = descriptor.methods();
    let method_names = if methods.is_empty() {
        Value::Null
    } else {
        Value::Array(
            methods
                .iter()
                .map(|m| Value::String(m.js_name.clone()))
                .collect(),
        )
    };

    let promise_ids: Vec<Value> = methods
        .iter()
        .enumerate()
        .filter(|(_, m)| m.kind == MethodKind::Promise)
        .map(|(id, _)| Value::from(id))
        .collect();
    let promise_ids = if promise_ids.is_empty() {
        Value::Null
    } else {
        Value::Array(promise_ids)
    };

    let mut entry = vec![name, constants, method_names, promise_ids];
    while entry.len() > 1 && entry.last().is_some_and(Value::is_null) {
        entry.pop();
    }
    Value::Array(entry)
}

/// The module configuration document for descriptors in id order. Modules
/// whose factory failed keep their slot as `null`.
pub fn module_config(descriptors: &[Arc<ModuleDescriptor>], style: ConfigStyle) -> Value {
    let entries = descriptors
        .iter()
        .map(|descriptor| {
            let entry = module_entry(descriptor, style);
            if descriptor.has_failed() { Value::Null } else { entry }
        })
        .collect();
    let mut document = Map::new();
    document.insert(CONFIG_PROPERTY.to_string(), Value::Array(entries));
    Value::Object(document)
}

/// The module configuration document serialized as JSON text.
pub fn module_config_json(descriptors: &[Arc<ModuleDescriptor>], style: ConfigStyle) -> String {
    module_config(descriptors, style).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ArgType, Capabilities, MethodDescriptor, ModuleClass};
    use crate::testing::ConstantModule;
    use serde_json::json;

    #[test]
    fn test_decode_without_call_id() {
        let batch = Batch::decode(&json!([[0, 1], [2, 0], [[5], ["a", true]]])).unwrap();
        assert_eq!(batch.module_ids, vec![0, 1]);
        assert_eq!(batch.method_ids, vec![2, 0]);
        assert_eq!(batch.params[1], vec![json!("a"), json!(true)]);
        assert_eq!(batch.call_id, NO_CALL_ID);
        assert_eq!(batch.call_id(), None);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_decode_with_call_id_and_trailing_extras() {
        let batch = Batch::decode(&json!([[0], [1], [[]], 42, "extra", 7])).unwrap();
        assert_eq!(batch.call_id(), Some(42));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_non_integer_call_id_means_none() {
        let batch = Batch::decode(&json!([[0], [1], [[]], "abc"])).unwrap();
        assert_eq!(batch.call_id, NO_CALL_ID);
    }

    #[test]
    fn test_malformed_batches() {
        assert_eq!(Batch::decode(&json!({})), Err(ProtocolError::NotAnArray));
        assert_eq!(Batch::decode(&json!([[0], [1]])), Err(ProtocolError::TooShort(2)));
        assert_eq!(
            Batch::decode(&json!([[0], 1, [[]]])),
            Err(ProtocolError::SectionNotArray(1))
        );
        assert_eq!(
            Batch::decode(&json!([[0, "x"], [1, 1], [[], []]])),
            Err(ProtocolError::InvalidId { section: 0, index: 1 })
        );
        assert_eq!(
            Batch::decode(&json!([[0], [1], [5]])),
            Err(ProtocolError::InvalidParams(0))
        );
        assert_eq!(
            Batch::decode(&json!([[0, 0], [1], [[], []]])),
            Err(ProtocolError::LengthMismatch {
                modules: 2,
                methods: 1,
                params: 2
            })
        );
        assert!(matches!(Batch::parse("[[0],"), Err(ProtocolError::Parse(_))));
    }

    #[test]
    fn test_minimal_config() {
        let descriptors = vec![
            Arc::new(ModuleDescriptor::for_class(0, ModuleClass::new("NativeA", || None))),
            Arc::new(ModuleDescriptor::for_class(1, ModuleClass::new("B", || None))),
        ];
        assert_eq!(
            module_config_json(&descriptors, ConfigStyle::Minimal),
            r#"{"remoteModuleConfig":[["A"],["B"]]}"#
        );
    }

    #[test]
    fn test_full_config_entries() {
        let storage = ModuleClass::of::<ConstantModule>("NativeStorage")
            .method(MethodDescriptor::new("get").arg("key", ArgType::String).promise())
            .method(MethodDescriptor::new("set").arg("key", ArgType::String))
            .capabilities(Capabilities::none().with_constants());
        let bare = ModuleClass::new("NativeEmpty", || None);

        let descriptors = vec![
            Arc::new(ModuleDescriptor::for_class(0, storage)),
            Arc::new(ModuleDescriptor::for_class(1, bare)),
        ];
        let config = module_config(&descriptors, ConfigStyle::Full);

        assert_eq!(
            config[CONFIG_PROPERTY][0],
            json!(["Storage", {"answer": 42}, ["get", "set"], [0]])
        );
        assert_eq!(config[CONFIG_PROPERTY][1], json!(["Empty"]));
    }

    #[test]
    fn test_failed_module_leaves_null_slot() {
        let broken = ModuleClass::new("NativeBroken", || None)
            .capabilities(Capabilities::none().with_constants());
        let descriptors = vec![
            Arc::new(ModuleDescriptor::for_class(0, broken)),
            Arc::new(ModuleDescriptor::for_class(1, ModuleClass::new("NativeB", || None))),
        ];

        assert_eq!(
            module_config_json(&descriptors, ConfigStyle::Full),
            r#"{"remoteModuleConfig":[null,["B"]]}"#
        );
    }

    #[test]
    fn test_config_style_from_str() {
        let style: ConfigStyle = serde_json::from_str("\"minimal\"").unwrap();
        assert_eq!(style, ConfigStyle::Minimal);
        assert_eq!(ConfigStyle::default(), ConfigStyle::Full);
    }
}
