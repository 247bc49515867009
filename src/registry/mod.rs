//! Plugin registries (spec §4.6). Grounded in the teacher's
//! `engine::tool_registry::ToolRegistry` — a `HashMap`-backed lookup keyed by
//! lower-cased, trimmed, immutable string keys — generalized into a single
//! generic container instantiated once per registry kind. "Read-heavy; built
//! once at startup, mutated only via explicit Register" (spec §5).

pub mod channels;
pub mod node_handlers;
pub mod prompt_sources;
pub mod providers;
pub mod tools;

use std::collections::HashMap;
use std::sync::Arc;

/// A capability-tagged plugin registry keyed by lower-cased, trimmed name.
/// Lookups return `Option<&V>` (spec's `(value, found)` pair collapsed into
/// Rust's native idiom).
pub struct Registry<V> {
    entries: HashMap<String, V>,
}

impl<V> Registry<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn normalize(key: &str) -> String {
        key.trim().to_lowercase()
    }

    pub fn register(&mut self, key: &str, value: V) {
        self.entries.insert(Self::normalize(key), value);
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(&Self::normalize(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&Self::normalize(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Every plugin registry the gateway builds once at startup, bundled for
/// injection alongside [`crate::state::Dependencies`] (spec §5: "read-heavy;
/// built once at startup, mutated only via explicit Register").
///
/// `channels` and `node_handlers` are `Arc`-wrapped because both the `text`
/// workflow node handler and the cron tick loop need an owned handle to the
/// same registry instances (neither registry, nor the trait objects they
/// hold, is `Clone`).
pub struct Registries {
    pub providers: providers::ProviderRegistry,
    pub channels: Arc<channels::ChannelRegistry>,
    pub tools: tools::ToolRegistry,
    pub prompt_sources: prompt_sources::PromptSourceRegistry,
    pub node_handlers: Arc<node_handlers::NodeHandlerRegistry>,
}

impl Registries {
    pub fn default_set() -> Self {
        let channels = Arc::new(channels::default_channel_registry());

        let mut node_handlers = node_handlers::NodeHandlerRegistry::new();
        node_handlers.register(
            "text_event",
            Box::new(crate::workflow::handlers::TextEventHandler { channels: Arc::clone(&channels) }),
        );
        node_handlers.register("delay", Box::new(crate::workflow::handlers::DelayHandler));
        node_handlers.register("if_event", Box::new(crate::workflow::handlers::IfEventHandler));

        Self {
            providers: providers::default_provider_registry(),
            channels,
            tools: tools::default_tool_registry(),
            prompt_sources: prompt_sources::default_prompt_source_registry(),
            node_handlers: Arc::new(node_handlers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_and_whitespace_insensitive() {
        let mut reg: Registry<u32> = Registry::new();
        reg.register("  OpenAI ", 1);
        assert_eq!(reg.get("openai"), Some(&1));
        assert_eq!(reg.get("OPENAI"), Some(&1));
    }
}
