//! `{{ … }}` template rendering over config and string values.

use serde_json::Value;

use super::{evaluate, get_path};

/// Render a template string, replacing each `{{ expr }}` with the
/// stringified result of evaluating `expr` against `data`. Missing keys
/// render as the empty string.
pub fn render_template(template: &str, data: &Value) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let Some(close_rel) = rest[open + 2..].find("}}") else {
            break;
        };
        let close = open + 2 + close_rel;
        result.push_str(&rest[..open]);
        let expr = rest[open + 2..close].trim();
        if let Some(value) = evaluate(expr, data) {
            result.push_str(&stringify(&value));
        }
        rest = &rest[close + 2..];
    }
    result.push_str(rest);
    result
}

/// Recursively expand templates inside a config value. A string that is a
/// single whole `{{path}}` template is replaced by the referenced value
/// itself, preserving its JSON type; mixed content falls back to string
/// substitution.
pub fn expand_templates(config: &Value, data: &Value) -> Value {
    match config {
        Value::String(s) => expand_string(s, data),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_templates(v, data)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| expand_templates(v, data)).collect())
        }
        other => other.clone(),
    }
}

fn expand_string(s: &str, data: &Value) -> Value {
    let trimmed = s.trim();
    if let Some(inner) = whole_template(trimmed) {
        match get_path(data, inner) {
            Some(value) => return value.clone(),
            None => return Value::String(String::new()),
        }
    }
    if s.contains("{{") {
        Value::String(render_template(s, data))
    } else {
        Value::String(s.to_string())
    }
}

/// Returns the inner expression when the whole string is exactly one
/// template, e.g. `{{documents}}`.
fn whole_template(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_substitution() {
        let data = json!({"name": "World"});
        assert_eq!(render_template("Hello {{ name }}!", &data), "Hello World!");
        assert_eq!(render_template("Hello {{ $.name }}!", &data), "Hello World!");
    }

    #[test]
    fn test_missing_key_renders_empty() {
        let data = json!({});
        assert_eq!(render_template("a{{ $.nope }}b", &data), "ab");
    }

    #[test]
    fn test_non_string_values_stringified() {
        let data = json!({"n": 42, "flag": true, "obj": {"a": 1}});
        assert_eq!(render_template("{{ n }}/{{ flag }}", &data), "42/true");
        assert_eq!(render_template("{{ obj }}", &data), "{\"a\":1}");
    }

    #[test]
    fn test_idempotent_when_no_templates_remain() {
        let data = json!({"x": "plain"});
        let once = render_template("value: {{ x }}", &data);
        let twice = render_template(&once, &data);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_whole_string_preserves_type() {
        let data = json!({"documents": [1, 2, 3], "meta": {"k": "v"}});
        let config = json!({
            "docs": "{{documents}}",
            "label": "docs: {{meta.k}}",
            "nested": {"copy": "{{ meta }}"}
        });
        let expanded = expand_templates(&config, &data);
        assert_eq!(expanded["docs"], json!([1, 2, 3]));
        assert_eq!(expanded["label"], json!("docs: v"));
        assert_eq!(expanded["nested"]["copy"], json!({"k": "v"}));
    }

    #[test]
    fn test_whole_string_missing_becomes_empty_string() {
        let expanded = expand_templates(&json!({"x": "{{absent}}"}), &json!({}));
        assert_eq!(expanded["x"], json!(""));
    }

    #[test]
    fn test_arrays_and_scalars_pass_through() {
        let data = json!({"v": 7});
        let config = json!({"list": ["{{v}}", "literal", 3], "num": 9, "flag": false});
        let expanded = expand_templates(&config, &data);
        assert_eq!(expanded["list"], json!([7, "literal", 3]));
        assert_eq!(expanded["num"], json!(9));
        assert_eq!(expanded["flag"], json!(false));
    }

    #[test]
    fn test_unclosed_template_left_verbatim() {
        let data = json!({"a": 1});
        assert_eq!(render_template("x {{ a", &data), "x {{ a");
    }
}
