//! Token extraction for the inverted index and Jaccard similarity.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use hearth_core::models::Entity;

/// Lowercased alphanumeric tokens of a string.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn collect_string_leaves<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => {
            for item in items {
                collect_string_leaves(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_string_leaves(item, out);
            }
        }
        _ => {}
    }
}

/// String leaves of a content map, in document order.
pub fn string_leaves(content: &Map<String, Value>) -> Vec<&str> {
    let mut out = Vec::new();
    for value in content.values() {
        collect_string_leaves(value, &mut out);
    }
    out
}

/// The token set an entity contributes to the index: its name plus every
/// string leaf of its content.
pub fn entity_tokens(entity: &Entity) -> BTreeSet<String> {
    let mut tokens: BTreeSet<String> = tokenize(&entity.name).collect();
    for leaf in string_leaves(&entity.content) {
        tokens.extend(tokenize(leaf));
    }
    tokens
}

/// Jaccard similarity of two token sets. Defined as 0 when both are empty,
/// so content-free entities don't all look identical to each other.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    intersection as f64 / union as f64
}
