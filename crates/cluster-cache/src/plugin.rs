/// Adapter plugins.
///
/// Plugins rewrite values on their way into and out of the cluster. The
/// registry is also what capability negotiation consults to decide whether
/// values are serialized above the connection layer.
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn is_serializer(&self) -> bool {
        false
    }

    /// Applied before a value is written.
    fn pre_set(&self, value: Value) -> Value {
        value
    }

    /// Applied after a value is read. Never called for misses.
    fn post_get(&self, value: Value) -> Value {
        value
    }
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn has_serializer(&self) -> bool {
        self.plugins.iter().any(|p| p.is_serializer())
    }

    pub(crate) fn pre_set(&self, value: Value) -> Value {
        self.plugins.iter().fold(value, |v, p| p.pre_set(v))
    }

    pub(crate) fn post_get(&self, value: Value) -> Value {
        self.plugins.iter().rev().fold(value, |v, p| p.post_get(v))
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

/// Stores every value as a JSON document.
///
/// Strings read back that are not valid JSON are returned untouched, so keys
/// written before the plugin was installed stay readable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializerPlugin;

impl Plugin for SerializerPlugin {
    fn name(&self) -> &str {
        "serializer"
    }

    fn is_serializer(&self) -> bool {
        true
    }

    fn pre_set(&self, value: Value) -> Value {
        Value::String(value.to_string())
    }

    fn post_get(&self, value: Value) -> Value {
        match value {
            Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Upper;

    impl Plugin for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn post_get(&self, value: Value) -> Value {
            match value {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            }
        }
    }

    #[test]
    fn test_serializer_plugin() {
        let plugin = SerializerPlugin;
        let stored = plugin.pre_set(json!({"a": [1, 2]}));
        assert_eq!(stored, json!(r#"{"a":[1,2]}"#));
        assert_eq!(plugin.post_get(stored), json!({"a": [1, 2]}));
        assert_eq!(plugin.post_get(json!("not json")), json!("not json"));
    }

    #[test]
    fn test_registry_detects_serializer() {
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(Upper));
        assert!(!registry.has_serializer());

        registry.add(Arc::new(SerializerPlugin));
        assert!(registry.has_serializer());
        assert_eq!(registry.len(), 2);
        assert_eq!(format!("{registry:?}"), r#"["upper", "serializer"]"#);
    }

    #[test]
    fn test_post_get_runs_in_reverse() {
        let mut registry = PluginRegistry::new();
        registry.add(Arc::new(Upper));
        registry.add(Arc::new(SerializerPlugin));

        let stored = registry.pre_set(json!("abc"));
        assert_eq!(stored, json!(r#""abc""#));
        assert_eq!(registry.post_get(stored), json!("ABC"));
    }
}
