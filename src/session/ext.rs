//! Session extensions.

use serde_json::Value;

use super::Session;

/// Rewrites `get_cfg` results. Registered expanders run in registration
/// order on every lookup.
pub trait ConfigExpander: Send + Sync {
    fn expand_config(&self, session: &Session, value: Value) -> Value;
}

/// Resolves `{"valueFrom": "/pointer"}` objects against the session-global
/// configuration, recursively.
pub struct ValueFromExpander;

impl ValueFromExpander {
    fn expand(&self, root: &Value, value: Value, depth: usize) -> Value {
        if depth == 0 {
            return value;
        }
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(ptr)) = map.get("valueFrom") {
                        if let Some(target) = root.pointer(ptr) {
                            return self.expand(root, target.clone(), depth - 1);
                        }
                        return Value::Null;
                    }
                }
                Value::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, self.expand(root, v, depth)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|v| self.expand(root, v, depth))
                    .collect(),
            ),
            v => v,
        }
    }
}

impl ConfigExpander for ValueFromExpander {
    fn expand_config(&self, session: &Session, value: Value) -> Value {
        match session.config() {
            // depth bounds reference chains so a self-referential config
            // cannot loop forever
            Some(root) => self.expand(&root, value, 16),
            None => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_references_resolve() {
        let root = json!({
            "a": {"valueFrom": "/b"},
            "b": "deep",
            "wrap": {"x": {"valueFrom": "/a"}}
        });
        let e = ValueFromExpander;
        assert_eq!(e.expand(&root, root["wrap"].clone(), 16), json!({"x": "deep"}));
    }

    #[test]
    fn dangling_reference_becomes_null() {
        let root = json!({});
        let e = ValueFromExpander;
        assert_eq!(
            e.expand(&root, json!({"valueFrom": "/missing"}), 16),
            Value::Null
        );
    }
}
