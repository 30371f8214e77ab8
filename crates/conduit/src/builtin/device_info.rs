//! `DeviceInfo` - host description exported to scripts.

use std::sync::Arc;

use conduit_bridge::{
    Capabilities, CallContext, ContextAssignment, MethodDescriptor, ModuleClass, ModuleError,
    NativeModule,
};
use serde_json::{Map, Value, json};

pub struct DeviceInfo {
    constants: Map<String, Value>,
}

impl DeviceInfo {
    /// Host facts merged with the `[device]` table. Configured keys win.
    pub fn new(device: Map<String, Value>) -> Self {
        let mut constants = Map::new();
        constants.insert("os".into(), json!(std::env::consts::OS));
        constants.insert("arch".into(), json!(std::env::consts::ARCH));
        constants.insert("hostVersion".into(), json!(env!("CARGO_PKG_VERSION")));
        constants.extend(device);
        Self { constants }
    }

    /// Constants are computed on the main context before the bridge loads.
    pub fn class(device: Map<String, Value>) -> ModuleClass {
        ModuleClass::new("NativeDeviceInfo", move || {
            let module: Arc<dyn NativeModule> = Arc::new(DeviceInfo::new(device.clone()));
            Some(module)
        })
        .method(MethodDescriptor::new("getInfo").promise())
        .on_context(ContextAssignment::Main)
        .requires_main_context_setup()
        .capabilities(Capabilities::none().with_constants())
    }
}

impl NativeModule for DeviceInfo {
    fn call(
        &self,
        method: &MethodDescriptor,
        _args: &[Value],
        cx: &CallContext,
    ) -> Result<(), ModuleError> {
        match method.js_name.as_str() {
            "getInfo" => {
                let promise = cx
                    .promise()
                    .ok_or_else(|| ModuleError::failed("getInfo expects a promise"))?;
                promise
                    .resolve(Value::Object(self.constants.clone()))
                    .map_err(|e| ModuleError::failed(e.to_string()))
            }
            other => Err(ModuleError::failed(format!("DeviceInfo has no method {}", other))),
        }
    }

    fn constants(&self) -> Option<Map<String, Value>> {
        Some(self.constants.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_keys_override_host_facts() {
        let mut device = Map::new();
        device.insert("model".into(), json!("kiosk-7"));
        device.insert("os".into(), json!("kiosk-os"));

        let info = DeviceInfo::new(device);
        let constants = info.constants().unwrap();
        assert_eq!(constants["model"], json!("kiosk-7"));
        assert_eq!(constants["os"], json!("kiosk-os"));
        assert_eq!(constants["arch"], json!(std::env::consts::ARCH));
    }

    #[test]
    fn test_class_declaration() {
        let class = DeviceInfo::class(Map::new());
        assert_eq!(class.name(), "DeviceInfo");
        assert_eq!(class.context(), &ContextAssignment::Main);
        assert!(class.needs_main_context_setup());
        assert!(class.caps().exports_constants);
        assert!(class.methods()[0].is_async());
        assert!(class.construct().is_some());
    }
}
