//! `ExceptionsManager` - script exceptions reported by the script side.

use conduit_bridge::{
    ArgType, CallContext, FatalError, MethodDescriptor, ModuleClass, ModuleError, NativeModule,
};
use serde_json::Value;

#[derive(Default)]
pub struct ExceptionsManager;

impl ExceptionsManager {
    pub fn class() -> ModuleClass {
        let report = |name: &str| {
            MethodDescriptor::new(name)
                .arg("message", ArgType::String)
                .optional_arg("stack", ArgType::String)
        };
        ModuleClass::of::<ExceptionsManager>("NativeExceptionsManager")
            .method(report("reportFatalException"))
            .method(report("reportSoftException"))
    }
}

impl NativeModule for ExceptionsManager {
    fn call(
        &self,
        method: &MethodDescriptor,
        args: &[Value],
        _cx: &CallContext,
    ) -> Result<(), ModuleError> {
        let message = method.str_arg(args, 0)?.to_string();
        let stack = args.get(1).and_then(Value::as_str).map(str::to_string);

        match method.js_name.as_str() {
            // Already fatal; the bridge surfaces it without wrapping.
            "reportFatalException" => Err(FatalError::Script { message, stack }.into()),
            "reportSoftException" => {
                tracing::warn!(stack = stack.as_deref().unwrap_or(""), "Script exception: {}", message);
                Ok(())
            }
            other => Err(ModuleError::failed(format!(
                "ExceptionsManager has no method {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_bridge::BridgeHandle;
    use serde_json::json;

    #[test]
    fn test_fatal_report_is_not_wrapped() {
        let class = ExceptionsManager::class();
        let cx = CallContext::new(BridgeHandle::detached(), "ExceptionsManager", None);
        let fatal = &class.methods()[0];

        let result = ExceptionsManager.call(fatal, &[json!("bad"), json!("at x (main.js:1)")], &cx);
        assert_eq!(
            result,
            Err(ModuleError::Fatal(FatalError::Script {
                message: "bad".into(),
                stack: Some("at x (main.js:1)".into()),
            }))
        );

        let soft = &class.methods()[1];
        assert!(ExceptionsManager.call(soft, &[json!("meh"), Value::Null], &cx).is_ok());
    }
}
