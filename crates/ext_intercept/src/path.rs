//! Dotted-path resolution against a root object.
//!
//! Shared by automatic signature hooking, manual `hookByPath`, remote
//! dispatch and `register`, so every caller agrees on what `a.b.c` means.

use crate::realm::{Function, Object, Value};
use crate::InterceptError;

/// Leading segments accepted as aliases of the root itself.
const ROOT_ALIASES: &[&str] = &["window", "globalThis", "self"];

fn segments(path: &str) -> Option<Vec<&str>> {
    if path.is_empty() {
        return None;
    }
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return None;
    }
    Some(parts)
}

fn strip_root_alias<'p, 's>(root: &Object, parts: &'p [&'s str]) -> &'p [&'s str] {
    match parts.first() {
        Some(first) if parts.len() > 1 && ROOT_ALIASES.contains(first) && !root.contains_key(first) => {
            &parts[1..]
        }
        _ => parts,
    }
}

/// Walk to the container of the final segment.
///
/// Every intermediate segment must name an object owned by its parent.
pub fn resolve_slot(root: &Object, path: &str) -> Option<(Object, String)> {
    let parts = segments(path)?;
    let parts = strip_root_alias(root, &parts);
    let (last, parents) = parts.split_last()?;

    let mut current = root.clone();
    for segment in parents {
        current = match current.get(segment)? {
            Value::Object(next) => next,
            _ => return None,
        };
    }
    Some((current, (*last).to_string()))
}

/// Value at `path`, if every segment exists.
pub fn resolve(root: &Object, path: &str) -> Option<Value> {
    let (parent, key) = resolve_slot(root, path)?;
    parent.get(&key)
}

/// Function at `path`; `None` when absent or not callable.
pub fn resolve_callable(root: &Object, path: &str) -> Option<Function> {
    match resolve(root, path)? {
        Value::Function(f) => Some(f),
        _ => None,
    }
}

/// Bind `value` at `path`, creating missing intermediate segments as empty objects.
///
/// An intermediate that exists but is not an object is an error rather than
/// being overwritten.
pub fn define_path(root: &Object, path: &str, value: Value) -> Result<(), InterceptError> {
    let parts = segments(path).ok_or_else(|| InterceptError::invalid_path(path))?;
    let parts = strip_root_alias(root, &parts);
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| InterceptError::invalid_path(path))?;

    let mut current = root.clone();
    for segment in parents {
        let next = match current.get(segment) {
            Some(Value::Object(next)) => next,
            None | Some(Value::Undefined) | Some(Value::Null) => {
                let created = Object::new();
                current.set(*segment, created.clone());
                created
            }
            Some(other) => {
                return Err(InterceptError::invalid_path(format!(
                    "{}: segment '{}' is a {}",
                    path,
                    segment,
                    other.type_name()
                )));
            }
        };
        current = next;
    }

    current.set(*last, value);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Object {
        let root = Object::new();
        let a = Object::new();
        let b = Object::new();
        b.set("c", Function::new("c", |_, _| Ok(Value::from(42))));
        b.set("n", 7);
        a.set("b", b);
        root.set("a", a);
        root.set("leaf", "text");
        root
    }

    #[test]
    fn test_resolve_nested_function() {
        let root = tree();
        let f = resolve_callable(&root, "a.b.c").unwrap();
        assert_eq!(f.call(&Value::Undefined, &[]).unwrap(), Value::Number(42.0));
        assert_eq!(resolve(&root, "a.b.n"), Some(Value::Number(7.0)));
    }

    #[test]
    fn test_resolve_failures() {
        let root = tree();
        assert!(resolve(&root, "").is_none());
        assert!(resolve(&root, "a..c").is_none());
        assert!(resolve(&root, "a.missing.c").is_none());
        assert!(resolve(&root, "leaf.length").is_none());
        assert!(resolve_callable(&root, "a.b.n").is_none());
        assert!(resolve_slot(&root, "missing.x").is_none());
    }

    #[test]
    fn test_root_alias() {
        let root = tree();
        assert!(resolve_callable(&root, "window.a.b.c").is_some());
        assert!(resolve_callable(&root, "globalThis.a.b.c").is_some());
        let (parent, key) = resolve_slot(&root, "window.leaf").unwrap();
        assert!(parent.ptr_eq(&root));
        assert_eq!(key, "leaf");
    }

    #[test]
    fn test_alias_shadowed_by_real_property() {
        let root = tree();
        let window = Object::new();
        window.set("leaf", "inner");
        root.set("window", window);
        assert_eq!(resolve(&root, "window.leaf"), Some(Value::from("inner")));
    }

    #[test]
    fn test_define_path_creates_containers() {
        let root = Object::new();
        define_path(&root, "x.y.z", Value::from(1)).unwrap();
        assert_eq!(resolve(&root, "x.y.z"), Some(Value::Number(1.0)));
        assert!(resolve(&root, "x.y").unwrap().as_object().is_some());

        define_path(&root, "x.y.w", Value::from(2)).unwrap();
        assert_eq!(resolve(&root, "x.y.z"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_define_path_rejects_non_object_segment() {
        let root = tree();
        let err = define_path(&root, "leaf.inner", Value::Null).unwrap_err();
        assert!(err.to_string().contains("leaf"));
        assert!(define_path(&root, "", Value::Null).is_err());
        assert!(define_path(&root, "a.", Value::Null).is_err());
    }
}
