//! `Logger` - script logging routed to tracing.

use conduit_bridge::{
    ArgType, CallContext, ContextAssignment, MethodDescriptor, ModuleClass, ModuleError,
    NativeModule,
};
use serde_json::Value;

/// Log target of script-side `Logger.log` calls.
pub const LOG_TARGET: &str = "conduit.js";

#[derive(Default)]
pub struct Logger;

impl Logger {
    pub fn class() -> ModuleClass {
        ModuleClass::of::<Logger>("NativeLogger")
            .method(
                MethodDescriptor::new("log")
                    .arg("level", ArgType::String)
                    .arg("message", ArgType::String),
            )
            .on_context(ContextAssignment::Script)
    }
}

impl NativeModule for Logger {
    fn call(
        &self,
        method: &MethodDescriptor,
        args: &[Value],
        _cx: &CallContext,
    ) -> Result<(), ModuleError> {
        match method.js_name.as_str() {
            "log" => {
                let level = method.str_arg(args, 0)?;
                let message = method.str_arg(args, 1)?;
                match level {
                    "error" => tracing::error!(target: LOG_TARGET, "{}", message),
                    "warn" => tracing::warn!(target: LOG_TARGET, "{}", message),
                    "debug" => tracing::debug!(target: LOG_TARGET, "{}", message),
                    "trace" => tracing::trace!(target: LOG_TARGET, "{}", message),
                    _ => tracing::info!(target: LOG_TARGET, "{}", message),
                }
                Ok(())
            }
            other => Err(ModuleError::failed(format!("Logger has no method {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_bridge::BridgeHandle;
    use serde_json::json;

    #[test]
    fn test_log_validates_arguments() {
        let class = Logger::class();
        let logger = Logger;
        let cx = CallContext::new(BridgeHandle::detached(), "Logger", None);
        let log = &class.methods()[0];

        assert_eq!(class.name(), "Logger");
        assert!(logger.call(log, &[json!("warn"), json!("careful")], &cx).is_ok());
        assert!(matches!(
            logger.call(log, &[json!("info"), json!(3)], &cx),
            Err(ModuleError::InvalidArgument { index: 1, .. })
        ));
    }
}
