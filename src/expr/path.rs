//! Dot/bracket JSONPath subset: `$`, `$.a.b`, `$.items[2].name`.

use serde_json::Value;

/// Resolve a path against `data`. Returns `None` when any segment is
/// missing. The leading `$` is optional so config templates can use plain
/// `input.field` paths.
pub fn get_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in segments(path) {
        match segment {
            Segment::Key(key) => {
                current = current.as_object()?.get(key)?;
            }
            Segment::Index(idx) => {
                current = current.as_array()?.get(idx)?;
            }
        }
    }
    Some(current)
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn segments(path: &str) -> impl Iterator<Item = Segment<'_>> {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
    trimmed
        .split('.')
        .filter(|part| !part.is_empty())
        .flat_map(|part| {
            // A part may carry bracket indices: `items[0][1]`.
            let mut out = Vec::new();
            let key_end = part.find('[').unwrap_or(part.len());
            if key_end > 0 {
                out.push(Segment::Key(&part[..key_end]));
            }
            let mut rest = &part[key_end..];
            while let Some(open) = rest.find('[') {
                let Some(close) = rest[open..].find(']') else {
                    break;
                };
                if let Ok(idx) = rest[open + 1..open + close].trim().parse::<usize>() {
                    out.push(Segment::Index(idx));
                }
                rest = &rest[open + close + 1..];
            }
            out
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_root() {
        let data = json!({"a": 1});
        assert_eq!(get_path(&data, "$"), Some(&data));
    }

    #[test]
    fn test_nested_keys() {
        let data = json!({"user": {"name": "Alice", "age": 30}});
        assert_eq!(get_path(&data, "$.user.name"), Some(&json!("Alice")));
        assert_eq!(get_path(&data, "user.age"), Some(&json!(30)));
    }

    #[test]
    fn test_array_index() {
        let data = json!({"items": [10, 20, 30]});
        assert_eq!(get_path(&data, "$.items[1]"), Some(&json!(20)));
        assert_eq!(get_path(&data, "$.items[9]"), None);
    }

    #[test]
    fn test_mixed_path() {
        let data = json!({"rows": [{"cols": ["x", "y"]}]});
        assert_eq!(get_path(&data, "$.rows[0].cols[1]"), Some(&json!("y")));
    }

    #[test]
    fn test_missing_key() {
        let data = json!({"a": {"b": 1}});
        assert_eq!(get_path(&data, "$.a.c"), None);
        assert_eq!(get_path(&data, "$.x"), None);
    }

    #[test]
    fn test_non_object_traversal() {
        let data = json!({"a": 5});
        assert_eq!(get_path(&data, "$.a.b"), None);
    }
}
