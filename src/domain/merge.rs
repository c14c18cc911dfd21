//! Deep merge of JSON documents, used to layer search deltas over the baseline.

use serde_json::Value;

/// Merge `source` into `target`. Objects merge key by key, recursively; any
/// other value in `source` (arrays and `null` included) replaces what
/// `target` held.
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}
