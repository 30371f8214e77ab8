//! Built-in Modules
//!
//! Native modules every conduit host registers.

mod device_info;
mod exceptions;
mod logger;
mod ui_manager;

use std::sync::Arc;

use conduit_bridge::ModuleClass;

use crate::config::BridgeConfig;

pub use device_info::DeviceInfo;
pub use exceptions::ExceptionsManager;
pub use logger::{LOG_TARGET, Logger};
pub use ui_manager::{UiManager, View, ViewTree};

/// Declarations of the built-in modules.
pub fn classes(config: &BridgeConfig, views: &Arc<ViewTree>) -> Vec<ModuleClass> {
    vec![
        Logger::class(),
        ExceptionsManager::class(),
        DeviceInfo::class(config.device_constants()),
        UiManager::class(Arc::clone(views)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let views = ViewTree::new();
        let names: Vec<String> = classes(&BridgeConfig::default(), &views)
            .iter()
            .map(ModuleClass::name)
            .collect();
        assert_eq!(names, vec!["Logger", "ExceptionsManager", "DeviceInfo", "UIManager"]);
    }
}
