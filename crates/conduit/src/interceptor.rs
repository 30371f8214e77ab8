//! Pattern Interceptor
//!
//! Vetoes calls whose `Module.method` matches a blocked wildcard pattern.

use conduit_bridge::{CallInterceptor, InterceptedCall};
use wildmatch::WildMatch;

pub struct PatternInterceptor {
    blocked: Vec<WildMatch>,
}

impl PatternInterceptor {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            blocked: patterns
                .into_iter()
                .map(|pattern| WildMatch::new(pattern.as_ref()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    /// Whether `Module.method` is blocked.
    pub fn blocks(&self, module: &str, method: &str) -> bool {
        let target = format!("{}.{}", module, method);
        self.blocked.iter().any(|pattern| pattern.matches(&target))
    }
}

impl CallInterceptor for PatternInterceptor {
    fn should_invoke(&self, call: &InterceptedCall<'_>) -> bool {
        if self.blocks(call.module, call.method) {
            tracing::debug!(module = %call.module, method = %call.method, "Blocked by pattern");
            return false;
        }
        true
    }
}
