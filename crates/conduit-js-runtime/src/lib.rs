//! Conduit JavaScript Runtime
//!
//! A QuickJS implementation of the bridge's `ScriptExecutor`.
//!
//! # Script Globals
//!
//! - `NativeModules` - one object per native module, built from the injected
//!   module configuration; methods enqueue calls, promise methods return a `Promise`
//! - `__conduitBatchedBridge.registerCallableModule(name, module)` - expose a
//!   module the host can call into
//! - `console.log/info/warn/error/debug(...)` - logged under `conduit.js.console`
//!
//! Calls are queued and handed to the host when it flushes the queue. If more
//! than a few milliseconds passed since the last flush, the queue is pushed
//! to the host immediately instead.

mod error;
mod executor;
mod globals;

pub use error::{JsError, JsResult};
pub use executor::{BATCHED_BRIDGE_GLOBAL, QuickJsConfig, QuickJsExecutor};
pub use globals::CONSOLE_TARGET;
