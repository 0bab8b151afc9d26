//! Content-tree flattener.
//!
//! Turns one nested [`ContentNode`] into zero or more [`FlatRecord`]s, one per
//! object node that has at least one text property of its own. Descendants
//! produce their own records; a record never mixes text from two nodes.
//!
//! # Rules
//!
//! 1. Object node: every non-empty string property becomes a `key: value`
//!    line, numbers are stringified, booleans and nulls are ignored.
//! 2. The [`STRUCTURAL_FIELDS`] are emitted first, untruncated, even though the
//!    generic pass emits them again. Generic lines are capped at
//!    `max_value_chars`.
//! 3. A list of scalars is a multi-valued property (`cq:tags: a, b`).
//! 4. Nested objects recurse with the path extended by `/key`; list elements
//!    recurse with `[index]`.
//! 5. Nodes deeper than `max_depth` are dropped silently.
//!
//! # Example
//!
//! ```rust
//! use aem_rag_core::flatten::{flatten, FlattenOptions};
//!
//! let node = serde_json::json!({
//!     "jcr:title": "Home",
//!     "hero": { "text": "Welcome" }
//! });
//! let records = flatten(&node, "/content/site", &FlattenOptions::default());
//! assert_eq!(records.len(), 2);
//! assert_eq!(records[1].path, "/content/site/hero");
//! assert_eq!(records[1].content, "text: Welcome");
//! ```

use serde_json::{Map, Value};

use crate::models::{ContentNode, FlatRecord};

/// Properties that always get their own line at the top of a record.
pub const STRUCTURAL_FIELDS: &[&str] = &[
    "jcr:primaryType",
    "sling:resourceType",
    "cq:template",
    "jcr:title",
    "jcr:description",
    "componentGroup",
];

/// Property holding the node type, copied into [`crate::models::RecordMetadata`].
pub const PRIMARY_TYPE: &str = "jcr:primaryType";

/// Limits applied while flattening.
#[derive(Debug, Clone)]
pub struct FlattenOptions {
    /// Deepest node depth (root = 0) that may still produce records.
    pub max_depth: usize,
    /// Character cap for generic text lines.
    pub max_value_chars: usize,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_value_chars: 2000,
        }
    }
}

/// Flatten `node`, addressed by `path`, into records in pre-order.
pub fn flatten(node: &ContentNode, path: &str, opts: &FlattenOptions) -> Vec<FlatRecord> {
    let mut out = Vec::new();
    flatten_into(node, path, 0, opts, &mut out);
    out
}

/// Append `key` to `path` with a `/` separator.
pub fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else if path.ends_with('/') {
        format!("{}{}", path, key)
    } else {
        format!("{}/{}", path, key)
    }
}

fn flatten_into(
    node: &ContentNode,
    path: &str,
    depth: usize,
    opts: &FlattenOptions,
    out: &mut Vec<FlatRecord>,
) {
    if depth > opts.max_depth {
        return;
    }

    match node {
        Value::Object(map) => {
            let mut children: Vec<(&String, &Value)> = Vec::new();
            let lines = own_lines(map, opts, &mut children);

            if !lines.is_empty() {
                let primary_type = map
                    .get(PRIMARY_TYPE)
                    .and_then(Value::as_str)
                    .map(str::to_string);
                out.push(FlatRecord::new(path, lines.join("\n"), primary_type));
            }

            for (key, value) in children {
                flatten_into(value, &join_path(path, key), depth + 1, opts, out);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_into(item, &format!("{}[{}]", path, i), depth + 1, opts, out);
            }
        }
        // A bare scalar has no key to label it with.
        _ => {}
    }
}

/// Collect the node's own text lines; nested values go to `children`.
fn own_lines<'a>(
    map: &'a Map<String, Value>,
    opts: &FlattenOptions,
    children: &mut Vec<(&'a String, &'a Value)>,
) -> Vec<String> {
    let mut lines = Vec::new();

    for field in STRUCTURAL_FIELDS {
        if let Some(Value::String(s)) = map.get(*field) {
            let s = s.trim();
            if !s.is_empty() {
                lines.push(format!("{}: {}", field, s));
            }
        }
    }

    for (key, value) in map {
        match value {
            Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    lines.push(format!("{}: {}", key, truncate_chars(s, opts.max_value_chars)));
                }
            }
            Value::Number(n) => lines.push(format!("{}: {}", key, n)),
            Value::Array(items) if !items.is_empty() && items.iter().all(is_scalar_text) => {
                let joined: Vec<String> = items.iter().filter_map(scalar_text).collect();
                if !joined.is_empty() {
                    lines.push(format!(
                        "{}: {}",
                        key,
                        truncate_chars(&joined.join(", "), opts.max_value_chars)
                    ));
                }
            }
            Value::Object(_) | Value::Array(_) => children.push((key, value)),
            Value::Bool(_) | Value::Null => {}
        }
    }

    lines
}

fn is_scalar_text(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_))
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn opts(max_depth: usize) -> FlattenOptions {
        FlattenOptions {
            max_depth,
            max_value_chars: 2000,
        }
    }

    fn page() -> Value {
        json!({
            "jcr:primaryType": "cq:PageContent",
            "jcr:title": "Men",
            "sling:resourceType": "weretail/components/structure/page",
            "hideInNav": true,
            "order": 3,
            "cq:tags": ["we-retail:gender/men", "we-retail:season/summer"],
            "root": {
                "jcr:primaryType": "nt:unstructured",
                "hero": { "text": "  Summer collection  ", "empty": "   " },
                "items": [
                    { "title": "Shirts" },
                    { "title": "Shorts" },
                    { "flag": false }
                ]
            }
        })
    }

    #[test]
    fn record_per_node_with_own_lines_only() {
        let records = flatten(&page(), "/content/we-retail/men/jcr:content", &opts(6));
        let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/content/we-retail/men/jcr:content",
                "/content/we-retail/men/jcr:content/root",
                "/content/we-retail/men/jcr:content/root/hero",
                "/content/we-retail/men/jcr:content/root/items[0]",
                "/content/we-retail/men/jcr:content/root/items[1]",
            ]
        );
        assert_eq!(records[2].content, "text: Summer collection");
        assert!(!records[0].content.contains("Summer"));
    }

    #[test]
    fn structural_fields_lead_and_repeat() {
        let records = flatten(&page(), "/p", &opts(6));
        let lines: Vec<&str> = records[0].content.lines().collect();
        assert_eq!(lines[0], "jcr:primaryType: cq:PageContent");
        assert_eq!(lines[1], "sling:resourceType: weretail/components/structure/page");
        assert_eq!(lines[2], "jcr:title: Men");
        let title_lines = lines.iter().filter(|l| **l == "jcr:title: Men").count();
        assert_eq!(title_lines, 2);
    }

    #[test]
    fn numbers_and_multi_values_are_lines_booleans_are_not() {
        let records = flatten(&page(), "/p", &opts(6));
        let content = &records[0].content;
        assert!(content.contains("order: 3"));
        assert!(content.contains("cq:tags: we-retail:gender/men, we-retail:season/summer"));
        assert!(!content.contains("hideInNav"));
    }

    #[test]
    fn metadata_carries_primary_type() {
        let records = flatten(&page(), "/p", &opts(6));
        assert_eq!(records[0].metadata.primary_type.as_deref(), Some("cq:PageContent"));
        assert_eq!(records[0].metadata.name, "p");
        assert_eq!(records[2].metadata.primary_type, None);
    }

    #[test]
    fn deterministic_for_same_input() {
        let a = serde_json::to_string(&flatten(&page(), "/p", &opts(6))).unwrap();
        let b = serde_json::to_string(&flatten(&page(), "/p", &opts(6))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn paths_are_unique() {
        let records = flatten(&page(), "/p", &opts(6));
        let unique: HashSet<&str> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(unique.len(), records.len());
    }

    #[test]
    fn nodes_past_depth_limit_are_dropped() {
        // Same shape repeated twelve levels deep.
        let mut node = json!({ "text": "leaf" });
        for _ in 0..12 {
            node = json!({ "text": "level", "child": node });
        }
        let limit = 4;
        let records = flatten(&node, "r", &opts(limit));
        assert_eq!(records.len(), limit + 1);
        for rec in &records {
            let depth = rec.path.matches('/').count();
            assert!(depth <= limit, "{} is deeper than {}", rec.path, limit);
        }
    }

    #[test]
    fn list_levels_count_toward_depth() {
        let node = json!({ "items": [ { "text": "a" } ] });
        // root (0) -> items list (1) -> element (2)
        assert_eq!(flatten(&node, "r", &opts(1)).len(), 0);
        assert_eq!(flatten(&node, "r", &opts(2)).len(), 1);
    }

    #[test]
    fn generic_lines_are_truncated_structural_are_not() {
        let long = "x".repeat(50);
        let node = json!({ "jcr:title": long, "text": long });
        let records = flatten(
            &node,
            "r",
            &FlattenOptions {
                max_depth: 6,
                max_value_chars: 10,
            },
        );
        let lines: Vec<&str> = records[0].content.lines().collect();
        assert_eq!(lines[0], format!("jcr:title: {}", long));
        assert_eq!(lines[1], "jcr:title: xxxxxxxxxx");
        assert_eq!(lines[2], "text: xxxxxxxxxx");
    }

    #[test]
    fn generic_lines_follow_property_order() {
        let node: Value =
            serde_json::from_str(r#"{"text": "x", "a_prop": "y", "zeta": {"b": "1"}, "alpha": {"c": "2"}}"#)
                .unwrap();
        let records = flatten(&node, "r", &opts(6));
        assert_eq!(records[0].content, "text: x\na_prop: y");
        assert_eq!(records[1].path, "r/zeta");
        assert_eq!(records[2].path, "r/alpha");
    }

    #[test]
    fn node_without_text_yields_nothing() {
        let node = json!({ "a": { "b": true }, "c": [] });
        assert!(flatten(&node, "r", &opts(6)).is_empty());
    }

    #[test]
    fn join_path_handles_empty_and_slash() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("/", "content"), "/content");
        assert_eq!(join_path("/content", "site"), "/content/site");
    }
}
