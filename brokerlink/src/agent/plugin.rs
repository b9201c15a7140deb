/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Plugin registry mapping `module.name` keys to constructors.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::config::{ConfigError, ProcessorConfig};
use crate::traits::ProcessorPlugin;

/// Constructor stored in the registry.
///
/// Receives the processor's configuration, including the extra keys in
/// [`ProcessorConfig::params`].
pub type PluginConstructor =
    Arc<dyn Fn(&ProcessorConfig) -> anyhow::Result<Box<dyn ProcessorPlugin>> + Send + Sync>;

/// Registry of processor plugin constructors.
///
/// Processors in the agent document name their plugin by `module` and `name`;
/// the agent looks up `"{module}.{name}"` here. Everything must be registered
/// before the agent is set up.
///
/// The registry is a cheap handle: clones share the same entries.
///
/// # Example
///
/// ```rust,ignore
/// let plugins = PluginRegistry::new();
/// plugins.register("demo", "Echo", |_conf| Ok(Box::new(Echo)));
/// ```
#[derive(Clone, Default)]
pub struct PluginRegistry {
    constructors: Arc<DashMap<String, PluginConstructor>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("registered_plugins", &self.constructors.len())
            .finish()
    }
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under `module.name`, replacing any previous one.
    pub fn register<F>(&self, module: &str, name: &str, constructor: F)
    where
        F: Fn(&ProcessorConfig) -> anyhow::Result<Box<dyn ProcessorPlugin>> + Send + Sync + 'static,
    {
        let key = format!("{module}.{name}");
        trace!(%key, "registering plugin");
        self.constructors.insert(key, Arc::new(constructor));
    }

    /// Whether a constructor is registered under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    /// Registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.constructors.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Builds the plugin for one processor.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownPlugin`] when nothing is registered under the
    /// processor's key, [`ConfigError::PluginConstruction`] when the constructor fails.
    pub fn create(
        &self,
        processor: &str,
        config: &ProcessorConfig,
    ) -> Result<Box<dyn ProcessorPlugin>, ConfigError> {
        let key = config.plugin_key();
        // Clone out of the map so the shard lock is not held while constructing.
        let constructor = self
            .constructors
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigError::UnknownPlugin {
                processor: processor.to_string(),
                key,
            })?;
        constructor(config).map_err(|source| ConfigError::PluginConstruction {
            processor: processor.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::message::MessageEnvelope;

    struct Fixed(String);

    #[async_trait]
    impl ProcessorPlugin for Fixed {
        async fn process(
            &mut self,
            _message: Option<&MessageEnvelope>,
        ) -> anyhow::Result<Option<String>> {
            Ok(Some(self.0.clone()))
        }
    }

    fn processor(module: &str, name: &str, extra: serde_json::Value) -> ProcessorConfig {
        let mut doc = serde_json::json!({ "module": module, "name": name });
        if let (Some(doc), Some(extra)) = (doc.as_object_mut(), extra.as_object()) {
            doc.extend(extra.clone());
        }
        serde_json::from_value(doc).unwrap()
    }

    #[tokio::test]
    async fn constructor_sees_extra_params() {
        let registry = PluginRegistry::new();
        registry.register("demo", "Fixed", |conf| {
            let text = conf
                .params
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("none")
                .to_string();
            Ok(Box::new(Fixed(text)))
        });
        assert_eq!(registry.keys(), vec!["demo.Fixed".to_string()]);

        let conf = processor("demo", "Fixed", serde_json::json!({ "text": "hi" }));
        let mut plugin = registry.create("p1", &conf).unwrap();
        assert_eq!(plugin.process(None).await.unwrap().as_deref(), Some("hi"));
    }

    #[test]
    fn unknown_and_failing_plugins_are_config_errors() {
        let registry = PluginRegistry::new();
        registry.register("demo", "Broken", |_| Err(anyhow::anyhow!("no database")));

        let missing = processor("demo", "Missing", serde_json::json!({}));
        assert!(matches!(
            registry.create("p1", &missing),
            Err(ConfigError::UnknownPlugin { .. })
        ));

        let broken = processor("demo", "Broken", serde_json::json!({}));
        match registry.create("p2", &broken) {
            Err(ConfigError::PluginConstruction { processor, .. }) => assert_eq!(processor, "p2"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
