//! Formatting attributes attached to inserts and retains.
//!
//! A `null` value inside a retain's attributes removes that attribute from
//! the retained text. An empty map and "no attributes" are the same thing.

use std::collections::BTreeMap;

use serde_json::Value;

/// Attribute name → value. Ordered so equal maps compare and serialize equally.
pub type AttributeMap = BTreeMap<String, Value>;

/// Attributes of `b` applied on top of `a`.
///
/// With `keep_null` the `null` removal markers of `b` survive, which is what
/// composing two retains needs (the result is still a change, not content).
pub fn compose(a: &AttributeMap, b: &AttributeMap, keep_null: bool) -> AttributeMap {
    let mut attributes: AttributeMap = b
        .iter()
        .filter(|(_, v)| keep_null || !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in a {
        if !b.contains_key(key) {
            attributes.insert(key.clone(), value.clone());
        }
    }
    attributes
}

/// The attribute change that undoes `attr` when applied over `base`.
pub fn invert(attr: &AttributeMap, base: &AttributeMap) -> AttributeMap {
    let mut inverted = AttributeMap::new();
    for (key, value) in base {
        if let Some(changed) = attr.get(key) {
            if changed != value {
                inverted.insert(key.clone(), value.clone());
            }
        }
    }
    for key in attr.keys() {
        if !base.contains_key(key) {
            inverted.insert(key.clone(), Value::Null);
        }
    }
    inverted
}

/// Rewrite `b` so it applies after `a`.
///
/// Without priority `b` wins every key it sets. With priority `a` already
/// claimed its keys and `b` keeps only the keys `a` does not touch.
pub fn transform(a: &AttributeMap, b: &AttributeMap, priority: bool) -> AttributeMap {
    if a.is_empty() || !priority {
        return b.clone();
    }
    b.iter()
        .filter(|(k, _)| !a.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> AttributeMap {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => AttributeMap::new(),
        }
    }

    #[test]
    fn test_compose_left_only() {
        let a = attrs(json!({"bold": true, "color": "red"}));
        let result = compose(&a, &AttributeMap::new(), false);
        assert_eq!(result, a);
    }

    #[test]
    fn test_compose_overrides_and_removes() {
        let a = attrs(json!({"bold": true, "color": "red"}));
        let b = attrs(json!({"color": "blue", "bold": null}));
        assert_eq!(compose(&a, &b, false), attrs(json!({"color": "blue"})));
        assert_eq!(
            compose(&a, &b, true),
            attrs(json!({"color": "blue", "bold": null}))
        );
    }

    #[test]
    fn test_invert() {
        let base = attrs(json!({"bold": true}));
        let change = attrs(json!({"bold": null, "italic": true}));
        assert_eq!(
            invert(&change, &base),
            attrs(json!({"bold": true, "italic": null}))
        );
    }

    #[test]
    fn test_transform_priority() {
        let left = attrs(json!({"bold": true, "color": "red"}));
        let right = attrs(json!({"color": "blue", "italic": true}));
        assert_eq!(transform(&left, &right, false), right);
        assert_eq!(transform(&left, &right, true), attrs(json!({"italic": true})));
        assert_eq!(transform(&AttributeMap::new(), &right, true), right);
    }
}
