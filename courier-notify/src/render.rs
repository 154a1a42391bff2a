use serde_json::Value;

/// String form of a scalar event value. `null`, arrays and objects have none.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Replaces every `{{key}}` token whose key holds a scalar in `event_data`.
///
/// Tokens without a scalar value are left in the output untouched. Substituted
/// text is never rescanned for tokens, and no escaping is applied.
pub fn render(template: &str, event_data: &Value) -> String {
    let Some(fields) = event_data.as_object() else {
        return template.to_string();
    };

    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        rendered.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            rest = &rest[open..];
            break;
        };

        match fields.get(&after_open[..close]).and_then(scalar_string) {
            Some(value) => {
                rendered.push_str(&value);
                rest = &after_open[close + 2..];
            }
            None => {
                // keep one brace and rescan, so `{{{key}}}` still finds `{{key}}`
                rendered.push('{');
                rest = &rest[open + 1..];
            }
        }
    }
    rendered.push_str(rest);
    rendered
}
