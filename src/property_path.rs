//!
//! Resolution of dot-separated field paths like ```"job.result.0.id"``` against JSON values.
//!
//! Each segment indexes an object by key or an array by decimal position. Resolution never panics:
//! empty path, empty segment, missing key, index out of range or stepping into a scalar all make
//! the path unresolvable. Any value reached by a resolvable path is returned as is, including
//! objects, arrays and ```null```.
//!
use serde_json::Value;

/// Resolve ```path``` against ```root```. Returns ```None``` if path can't be resolved.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(root, |value, segment| {
        if segment.is_empty() {
            return None;
        }
        match value {
            Value::Object(fields) => fields.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|n| items.get(n)),
            _ => None,
        }
    })
}

/// Same as [resolve], but returns copy of resolved value or ```default``` when path can't be resolved
pub fn resolve_or(root: &Value, path: &str, default: Value) -> Value {
    resolve(root, path).cloned().unwrap_or(default)
}
