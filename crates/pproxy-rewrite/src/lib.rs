use serde_json::{Map, Value as JsonValue};

use pproxy_common::{ModelKind, ModelRecord, PromptValueType};

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("request body is not valid JSON: {0}")]
    BadRequest(serde_json::Error),
    #[error("no default prompt shape for model kind: {0}")]
    UnsupportedKind(ModelKind),
    #[error("prompt path {path} is not {expected}")]
    PathShapeMismatch {
        path: String,
        expected: &'static str,
    },
    #[error("prompt value must be an object or a string")]
    UnsupportedValueShape,
    #[error("encode rewritten body: {0}")]
    Encode(serde_json::Error),
}

/// Rewrite a request body for upstream dispatch: merge the record's prompt
/// fragment into the site addressed by `prompt_path`, then set the top-level
/// `model` key to `record.target`. Two passes so each concern stays testable
/// in isolation; the site lookup always runs against the current document.
pub fn rewrite_body(body: &[u8], record: &ModelRecord) -> Result<Vec<u8>, RewriteError> {
    let mut doc: JsonValue = serde_json::from_slice(body).map_err(RewriteError::BadRequest)?;
    inject_prompt(&mut doc, record)?;
    set_model(&mut doc, &record.target)?;
    serde_json::to_vec(&doc).map_err(RewriteError::Encode)
}

/// Merge the record's prompt fragment into `doc` at `record.prompt_path`.
///
/// If the record carries no `prompt_value`, one is synthesized: chat kinds get
/// a `{role: "system", content: prompt}` message treated as an array element;
/// image and audio kinds get the raw prompt string.
pub fn inject_prompt(doc: &mut JsonValue, record: &ModelRecord) -> Result<(), RewriteError> {
    let (value, value_type) = match &record.prompt_value {
        Some(value) => (value.clone(), record.prompt_value_type),
        None => match record.kind {
            ModelKind::Chat => (
                serde_json::json!({"role": "system", "content": record.prompt}),
                Some(PromptValueType::Array),
            ),
            ModelKind::Image | ModelKind::Audio => (
                JsonValue::String(record.prompt.clone()),
                Some(PromptValueType::String),
            ),
            other => return Err(RewriteError::UnsupportedKind(other)),
        },
    };

    let path = record.prompt_path.as_str();
    // A null node is indistinguishable from an absent path on purpose.
    let site = match path_get(doc, path) {
        Some(JsonValue::Null) | None => None,
        Some(existing) => Some(existing.clone()),
    };

    if value.is_object() {
        return match site {
            Some(JsonValue::Array(items)) => {
                let mut merged = Vec::with_capacity(items.len() + 1);
                merged.push(value);
                merged.extend(items);
                path_set(doc, path, JsonValue::Array(merged));
                Ok(())
            }
            None => {
                match value_type.unwrap_or(PromptValueType::Array) {
                    PromptValueType::Array => {
                        path_set(doc, path, JsonValue::Array(vec![value]));
                    }
                    PromptValueType::Object => path_set(doc, path, value),
                    PromptValueType::String => {
                        let encoded =
                            serde_json::to_string(&value).map_err(RewriteError::Encode)?;
                        path_set(doc, path, JsonValue::String(encoded));
                    }
                }
                Ok(())
            }
            Some(_) => Err(RewriteError::PathShapeMismatch {
                path: path.to_string(),
                expected: "an array",
            }),
        };
    }

    if let JsonValue::String(prefix) = value {
        return match site {
            Some(JsonValue::String(existing)) => {
                path_set(doc, path, JsonValue::String(format!("{prefix}\n{existing}")));
                Ok(())
            }
            None => {
                path_set(doc, path, JsonValue::String(prefix));
                Ok(())
            }
            Some(_) => Err(RewriteError::PathShapeMismatch {
                path: path.to_string(),
                expected: "a string",
            }),
        };
    }

    Err(RewriteError::UnsupportedValueShape)
}

/// Set the top-level `model` key, creating it if absent.
pub fn set_model(doc: &mut JsonValue, target: &str) -> Result<(), RewriteError> {
    match doc.as_object_mut() {
        Some(map) => {
            map.insert(
                "model".to_string(),
                JsonValue::String(target.to_string()),
            );
            Ok(())
        }
        None => Err(RewriteError::PathShapeMismatch {
            path: "model".to_string(),
            expected: "a top-level object",
        }),
    }
}

/// Read the top-level `model` string from a raw body. Returns an empty string
/// for non-JSON bodies or a missing key, so a lookup miss falls out naturally.
pub fn extract_model_id(body: &[u8]) -> String {
    serde_json::from_slice::<JsonValue>(body)
        .ok()
        .and_then(|doc| {
            doc.get("model")
                .and_then(|value| value.as_str().map(|s| s.to_string()))
        })
        .unwrap_or_default()
}

fn path_get<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write `value` at the dotted path, materializing missing or non-object
/// intermediate nodes as objects.
fn path_set(doc: &mut JsonValue, path: &str, value: JsonValue) {
    let mut value = Some(value);
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = JsonValue::Object(Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(
                segment.to_string(),
                value.take().unwrap_or(JsonValue::Null),
            );
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_record() -> ModelRecord {
        ModelRecord {
            id: "X".to_string(),
            name: "X".to_string(),
            target: "gpt-3.5-turbo".to_string(),
            prompt: "You are X.".to_string(),
            url: "https://api.example.com/v1/chat/completions".to_string(),
            kind: ModelKind::Chat,
            prompt_path: "messages".to_string(),
            prompt_value: Some(json!({"role": "system", "content": "You are X."})),
            prompt_value_type: Some(PromptValueType::Object),
        }
    }

    fn parse(bytes: Vec<u8>) -> JsonValue {
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn chat_injection_prepends_to_messages() {
        let body = br#"{"model":"X","messages":[{"role":"user","content":"hi"}]}"#;
        let out = parse(rewrite_body(body, &chat_record()).unwrap());
        assert_eq!(
            out,
            json!({
                "model": "gpt-3.5-turbo",
                "messages": [
                    {"role": "system", "content": "You are X."},
                    {"role": "user", "content": "hi"},
                ],
            })
        );
    }

    #[test]
    fn missing_messages_materializes_array() {
        let body = br#"{"model":"X","stream":true}"#;
        let out = parse(rewrite_body(body, &chat_record()).unwrap());
        assert_eq!(
            out,
            json!({
                "model": "gpt-3.5-turbo",
                "stream": true,
                "messages": [{"role": "system", "content": "You are X."}],
            })
        );
    }

    #[test]
    fn string_value_prepends_with_newline() {
        let record = ModelRecord {
            id: "I".to_string(),
            name: "I".to_string(),
            target: "img-v1".to_string(),
            prompt: String::new(),
            url: "https://api.example.com/images".to_string(),
            kind: ModelKind::Image,
            prompt_path: "prompt".to_string(),
            prompt_value: Some(json!("SAFE:")),
            prompt_value_type: Some(PromptValueType::String),
        };
        let body = br#"{"model":"I","prompt":"a cat"}"#;
        let out = parse(rewrite_body(body, &record).unwrap());
        assert_eq!(out, json!({"model": "img-v1", "prompt": "SAFE:\na cat"}));
    }

    #[test]
    fn string_value_sets_absent_path() {
        let mut record = chat_record();
        record.prompt_value = Some(json!("SAFE:"));
        record.prompt_path = "prompt".to_string();
        let out = parse(rewrite_body(br#"{"model":"X"}"#, &record).unwrap());
        assert_eq!(out["prompt"], json!("SAFE:"));
    }

    #[test]
    fn absent_path_respects_value_type() {
        let value = json!({"role": "system", "content": "s"});
        let cases = [
            (Some(PromptValueType::Array), json!([value.clone()])),
            (Some(PromptValueType::Object), value.clone()),
            (None, json!([value.clone()])),
        ];
        for (value_type, expected) in cases {
            let mut record = chat_record();
            record.prompt_value = Some(value.clone());
            record.prompt_value_type = value_type;
            let out = parse(rewrite_body(br#"{"model":"X"}"#, &record).unwrap());
            assert_eq!(out["messages"], expected, "type {value_type:?}");
        }
    }

    #[test]
    fn absent_path_string_type_stores_json_text() {
        let mut record = chat_record();
        record.prompt_value_type = Some(PromptValueType::String);
        let out = parse(rewrite_body(br#"{"model":"X"}"#, &record).unwrap());
        let stored = out["messages"].as_str().unwrap();
        let decoded: JsonValue = serde_json::from_str(stored).unwrap();
        assert_eq!(decoded, json!({"role": "system", "content": "You are X."}));
    }

    #[test]
    fn null_site_is_treated_as_absent() {
        let body = br#"{"model":"X","messages":null}"#;
        let out = parse(rewrite_body(body, &chat_record()).unwrap());
        assert!(out["messages"].is_array());
    }

    #[test]
    fn object_value_on_non_array_site_fails() {
        let body = br#"{"model":"X","messages":"oops"}"#;
        let err = rewrite_body(body, &chat_record()).unwrap_err();
        assert!(matches!(err, RewriteError::PathShapeMismatch { .. }));
    }

    #[test]
    fn string_value_on_non_string_site_fails() {
        let mut record = chat_record();
        record.prompt_value = Some(json!("SAFE:"));
        let body = br#"{"model":"X","messages":[1,2]}"#;
        let err = rewrite_body(body, &record).unwrap_err();
        assert!(matches!(err, RewriteError::PathShapeMismatch { .. }));
    }

    #[test]
    fn numeric_value_shape_is_rejected() {
        let mut record = chat_record();
        record.prompt_value = Some(json!(42));
        let err = rewrite_body(br#"{"model":"X"}"#, &record).unwrap_err();
        assert!(matches!(err, RewriteError::UnsupportedValueShape));
    }

    #[test]
    fn default_value_synthesized_from_kind() {
        let mut record = chat_record();
        record.prompt_value = None;
        let out = parse(rewrite_body(br#"{"model":"X","messages":[]}"#, &record).unwrap());
        assert_eq!(
            out["messages"],
            json!([{"role": "system", "content": "You are X."}])
        );

        record.kind = ModelKind::Video;
        let err = rewrite_body(br#"{"model":"X"}"#, &record).unwrap_err();
        assert!(matches!(err, RewriteError::UnsupportedKind(ModelKind::Video)));
    }

    #[test]
    fn nested_path_materializes_parents() {
        let mut record = chat_record();
        record.prompt_path = "input.context.messages".to_string();
        let out = parse(rewrite_body(br#"{"model":"X"}"#, &record).unwrap());
        assert!(out["input"]["context"]["messages"].is_array());
    }

    #[test]
    fn model_key_is_created_when_absent() {
        let mut record = chat_record();
        record.prompt_value = Some(json!("p"));
        record.prompt_path = "prompt".to_string();
        let out = parse(rewrite_body(br#"{"prompt":"x"}"#, &record).unwrap());
        assert_eq!(out["model"], json!("gpt-3.5-turbo"));
    }

    #[test]
    fn non_json_body_is_bad_request() {
        let err = rewrite_body(b"not json", &chat_record()).unwrap_err();
        assert!(matches!(err, RewriteError::BadRequest(_)));
    }

    #[test]
    fn extract_model_id_handles_missing_field() {
        assert_eq!(extract_model_id(br#"{"model":"m"}"#), "m");
        assert_eq!(extract_model_id(br#"{"other":1}"#), "");
        assert_eq!(extract_model_id(b"garbage"), "");
    }
}
