//! Host Assembly
//!
//! Builds a [`Bridge`] from a [`BridgeConfig`]: QuickJS as the engine, the
//! built-in modules, and the configured interceptor.

use std::path::PathBuf;
use std::sync::Arc;

use conduit_bridge::{
    Bridge, BridgeBuilder, DiagnosticSurface, LifecycleError, ScriptExecutor, SourceLoader,
};
use conduit_js_runtime::QuickJsExecutor;

use crate::builtin::{self, ViewTree};
use crate::config::BridgeConfig;
use crate::interceptor::PatternInterceptor;
use crate::loader::FileSourceLoader;

/// Shows script errors in the log.
pub struct LogDiagnostics;

impl DiagnosticSurface for LogDiagnostics {
    fn show_error(&self, message: &str, stack: &str) {
        tracing::error!("{}\n{}", message, stack);
    }
}

/// A configured bridge and the state its built-in modules expose.
pub struct Host {
    bridge: Bridge,
    views: Arc<ViewTree>,
}

impl Host {
    /// Build a host loading bundles from `root`.
    pub fn new(config: &BridgeConfig, root: impl Into<PathBuf>) -> Result<Self, LifecycleError> {
        Self::with_loader(config, Arc::new(FileSourceLoader::new(root)), |builder| builder)
    }

    /// Build a host with a custom loader. `customize` sees the builder after
    /// the configuration has been applied.
    pub fn with_loader<F>(
        config: &BridgeConfig,
        loader: Arc<dyn SourceLoader>,
        customize: F,
    ) -> Result<Self, LifecycleError>
    where
        F: FnOnce(BridgeBuilder) -> BridgeBuilder,
    {
        let views = ViewTree::new();
        let bridge = customize(builder(config, loader, &views)).build()?;
        Ok(Self { bridge, views })
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn views(&self) -> &Arc<ViewTree> {
        &self.views
    }
}

/// A bridge builder with everything the configuration describes.
pub fn builder(config: &BridgeConfig, loader: Arc<dyn SourceLoader>, views: &Arc<ViewTree>) -> BridgeBuilder {
    let runtime = config.runtime.clone();
    let section = &config.bridge;

    let mut builder = Bridge::builder(
        move || Arc::new(QuickJsExecutor::new(runtime.clone())) as Arc<dyn ScriptExecutor>,
        loader,
    )
    .modules(builtin::classes(config, views))
    .diagnostics(Arc::new(LogDiagnostics))
    .bundle_url(section.bundle_url.clone())
    .config_style(section.config_style)
    .frame_rate(section.frame_rate)
    .queue_labels(section.main_queue_label.clone(), section.script_queue_label.clone());

    let interceptor = PatternInterceptor::new(&config.interceptor.blocked);
    if !interceptor.is_empty() {
        builder = builder.interceptor(Arc::new(interceptor));
    }
    builder
}
