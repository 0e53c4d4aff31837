//! Intent tracing — augment tool schemas with a required `_intent` field and
//! lift the model's answer back out of the observed arguments.
//!
//! When enabled, every tool schema the model sees gains a `_intent` string
//! property so each call carries a one-line justification. The field is the
//! loop's, not the tool's: it is stripped from arguments before validation
//! and execution, and stored on the `Content::ToolCall` as `intent`.

use serde_json::{json, Value};

pub const INTENT_FIELD: &str = "_intent";

const INTENT_DESCRIPTION: &str =
    "One short sentence explaining why you are making this tool call.";

/// Returns a copy of `schema` with `_intent` added to `properties` and
/// `required`. The input is never mutated; unrecognized keywords pass
/// through untouched. Non-object schemas are returned as-is.
pub fn inject_intent(schema: &Value) -> Value {
    let mut out = schema.clone();
    let Some(obj) = out.as_object_mut() else {
        return out;
    };

    let properties = obj
        .entry("properties")
        .or_insert_with(|| json!({}));
    if let Some(properties) = properties.as_object_mut() {
        properties.insert(
            INTENT_FIELD.to_string(),
            json!({ "type": "string", "description": INTENT_DESCRIPTION }),
        );
    }

    match obj.get_mut("required") {
        None => {
            obj.insert("required".to_string(), json!([INTENT_FIELD]));
        }
        Some(Value::Array(required)) => {
            if !required.iter().any(|v| v == INTENT_FIELD) {
                required.push(json!(INTENT_FIELD));
            }
        }
        // Malformed `required` keyword: leave the schema alone.
        Some(_) => {}
    }

    out
}

/// Removes a string-valued `_intent` from `args` and returns it. Non-object
/// arguments and non-string `_intent` values are left untouched.
pub fn strip_intent(args: &mut Value) -> Option<String> {
    let obj = args.as_object_mut()?;
    if !matches!(obj.get(INTENT_FIELD), Some(Value::String(_))) {
        return None;
    }
    match obj.remove(INTENT_FIELD) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_adds_property_and_required() {
        let schema = json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        });
        let out = inject_intent(&schema);

        assert!(out["properties"][INTENT_FIELD].is_object());
        assert_eq!(out["properties"][INTENT_FIELD]["type"], "string");
        let required: Vec<_> = out["required"].as_array().unwrap().to_vec();
        assert!(required.contains(&json!("path")));
        assert!(required.contains(&json!(INTENT_FIELD)));

        // Original untouched.
        assert!(schema["properties"].get(INTENT_FIELD).is_none());
        assert_eq!(schema["required"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn inject_creates_missing_required_list() {
        let out = inject_intent(&json!({ "type": "object" }));
        assert_eq!(out["required"], json!([INTENT_FIELD]));
        assert!(out["properties"][INTENT_FIELD].is_object());
    }

    #[test]
    fn inject_is_idempotent_on_required() {
        let once = inject_intent(&json!({ "type": "object" }));
        let twice = inject_intent(&once);
        assert_eq!(twice["required"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn strip_lifts_string_intent() {
        let mut args = json!({ "path": "a.rs", INTENT_FIELD: "read the config" });
        assert_eq!(strip_intent(&mut args), Some("read the config".into()));
        assert_eq!(args, json!({ "path": "a.rs" }));
    }

    #[test]
    fn strip_leaves_non_string_intent() {
        let mut args = json!({ INTENT_FIELD: 42 });
        assert_eq!(strip_intent(&mut args), None);
        assert_eq!(args, json!({ INTENT_FIELD: 42 }));
    }

    #[test]
    fn strip_ignores_non_object_args() {
        let mut args = json!("not an object");
        assert_eq!(strip_intent(&mut args), None);
    }
}
