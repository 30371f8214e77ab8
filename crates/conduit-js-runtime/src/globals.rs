//! Runtime Globals
//!
//! Native functions installed into every runtime before the prelude runs.

use std::sync::Arc;

use conduit_bridge::executor::{FlushSink, ModuleConfigProvider};
use parking_lot::Mutex;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Result as JsResult};

/// Log target of script console output.
pub const CONSOLE_TARGET: &str = "conduit.js.console";

/// Install `console`, plus `nativeFlushQueueImmediate` and
/// `nativeRequireModuleConfig` for whichever of the sink and the config
/// provider is set.
///
/// Without the native functions the script side only flushes when asked and
/// only knows the modules it was configured with.
pub fn register_globals(
    ctx: &Ctx<'_>,
    sink: Arc<Mutex<Option<FlushSink>>>,
    module_config: Arc<Mutex<Option<ModuleConfigProvider>>>,
) -> JsResult<()> {
    register_console(ctx)?;
    if sink.lock().is_some() {
        register_immediate_flush(ctx, sink)?;
    }
    if module_config.lock().is_some() {
        register_module_config(ctx, module_config)?;
    }
    Ok(())
}

fn register_immediate_flush(ctx: &Ctx<'_>, sink: Arc<Mutex<Option<FlushSink>>>) -> JsResult<()> {
    let flush = Function::new(ctx.clone(), move |batch: String| {
        let sink = sink.lock().clone();
        let Some(sink) = sink else {
            tracing::trace!("Immediate flush with no sink installed");
            return;
        };
        match serde_json::from_str(&batch) {
            Ok(raw) => sink(raw),
            Err(e) => tracing::error!("Dropping unparsable immediate flush: {}", e),
        }
    })?;
    ctx.globals().set("nativeFlushQueueImmediate", flush)
}

/// The entry comes back as JSON text, or `undefined` for an unknown name.
fn register_module_config(
    ctx: &Ctx<'_>,
    module_config: Arc<Mutex<Option<ModuleConfigProvider>>>,
) -> JsResult<()> {
    let require = Function::new(ctx.clone(), move |name: String| -> Option<String> {
        let provider = module_config.lock().clone()?;
        let entry = provider(&name);
        if entry.is_none() {
            tracing::debug!(module = %name, "Script required an unknown module");
        }
        entry.map(|entry| entry.to_string())
    })?;
    ctx.globals().set("nativeRequireModuleConfig", require)
}

/// Route `console.*` to tracing.
fn register_console(ctx: &Ctx<'_>) -> JsResult<()> {
    let console = Object::new(ctx.clone())?;

    console.set("log", Function::new(ctx.clone(), |args: Rest<String>| {
        tracing::info!(target: CONSOLE_TARGET, "{}", args.0.join(" "));
    })?)?;

    console.set("info", Function::new(ctx.clone(), |args: Rest<String>| {
        tracing::info!(target: CONSOLE_TARGET, "{}", args.0.join(" "));
    })?)?;

    console.set("warn", Function::new(ctx.clone(), |args: Rest<String>| {
        tracing::warn!(target: CONSOLE_TARGET, "{}", args.0.join(" "));
    })?)?;

    console.set("error", Function::new(ctx.clone(), |args: Rest<String>| {
        tracing::error!(target: CONSOLE_TARGET, "{}", args.0.join(" "));
    })?)?;

    console.set("debug", Function::new(ctx.clone(), |args: Rest<String>| {
        tracing::debug!(target: CONSOLE_TARGET, "{}", args.0.join(" "));
    })?)?;

    ctx.globals().set("console", console)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::Value;

    #[test]
    fn test_console_without_sink() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            register_globals(&ctx, Arc::new(Mutex::new(None)), Arc::new(Mutex::new(None))).unwrap();
            let _: () = ctx.eval("console.log('hello', 'from', 'js')").unwrap();
            let kind: String = ctx.eval("typeof nativeFlushQueueImmediate").unwrap();
            assert_eq!(kind, "undefined");
            let kind: String = ctx.eval("typeof nativeRequireModuleConfig").unwrap();
            assert_eq!(kind, "undefined");
        });
    }

    #[test]
    fn test_immediate_flush_reaches_sink() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let flushed = Arc::new(Mutex::new(Vec::<Value>::new()));
        let seen = Arc::clone(&flushed);
        let sink: FlushSink = Arc::new(move |raw: Value| seen.lock().push(raw));

        context.with(|ctx| {
            register_globals(&ctx, Arc::new(Mutex::new(Some(sink))), Arc::new(Mutex::new(None)))
                .unwrap();
            let _: () = ctx
                .eval("nativeFlushQueueImmediate(JSON.stringify([[1],[2],[[3]],4]))")
                .unwrap();
        });

        assert_eq!(*flushed.lock(), vec![serde_json::json!([[1], [2], [[3]], 4])]);
    }

    #[test]
    fn test_module_config_is_served_as_json() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let provider: ModuleConfigProvider = Arc::new(|name: &str| {
            (name == "Timing").then(|| serde_json::json!(["Timing", null, ["createTimer"]]))
        });

        context.with(|ctx| {
            register_globals(&ctx, Arc::new(Mutex::new(None)), Arc::new(Mutex::new(Some(provider))))
                .unwrap();
            let entry: String = ctx.eval("nativeRequireModuleConfig('Timing')").unwrap();
            assert_eq!(
                serde_json::from_str::<Value>(&entry).unwrap(),
                serde_json::json!(["Timing", null, ["createTimer"]])
            );
            let missing: bool = ctx.eval("nativeRequireModuleConfig('Missing') === undefined").unwrap();
            assert!(missing);
        });
    }
}
