use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("model record field must not be empty: {0}")]
    MissingField(&'static str),
    #[error("upstream url is invalid: {0}")]
    InvalidUrl(String),
}

/// Kind of upstream API a model record fronts. Drives the default prompt
/// injection shape when `prompt_path`/`prompt_value` are not configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Chat,
    Image,
    Audio,
    Video,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Chat => "chat",
            ModelKind::Image => "image",
            ModelKind::Audio => "audio",
            ModelKind::Video => "video",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "chat" => Some(ModelKind::Chat),
            "image" => Some(ModelKind::Image),
            "audio" => Some(ModelKind::Audio),
            "video" => Some(ModelKind::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a configured `prompt_value` is materialized when the injection site
/// is absent from the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptValueType {
    String,
    Array,
    Object,
}

impl PromptValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptValueType::String => "string",
            PromptValueType::Array => "array",
            PromptValueType::Object => "object",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "string" => Some(PromptValueType::String),
            "array" => Some(PromptValueType::Array),
            "object" => Some(PromptValueType::Object),
            _ => None,
        }
    }
}

/// A registered mapping from a client-facing model id to an upstream endpoint
/// plus a prompt injection rule. Timestamps live on the storage row, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub prompt: String,
    pub url: String,
    #[serde(default, rename = "type")]
    pub kind: ModelKind,
    #[serde(default)]
    pub prompt_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_value: Option<JsonValue>,
    #[serde(
        default,
        alias = "prompt_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub prompt_value_type: Option<PromptValueType>,
}

impl ModelRecord {
    /// Enforce the record invariants and fill kind-specific defaults.
    ///
    /// An empty `prompt_path` is defaulted per kind: chat gets `messages` plus
    /// a system-message `prompt_value` synthesized from `prompt`; image gets
    /// `prompt`. Other kinds keep the empty path.
    pub fn validate(&mut self) -> Result<(), RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::MissingField("id"));
        }
        if self.name.trim().is_empty() {
            return Err(RecordError::MissingField("name"));
        }
        if self.target.trim().is_empty() {
            return Err(RecordError::MissingField("target"));
        }
        if self.url.trim().is_empty() {
            return Err(RecordError::MissingField("url"));
        }

        let parsed =
            url::Url::parse(&self.url).map_err(|err| RecordError::InvalidUrl(err.to_string()))?;
        if parsed.host_str().is_none() {
            return Err(RecordError::InvalidUrl(format!(
                "missing host: {}",
                self.url
            )));
        }

        if self.prompt_path.is_empty() {
            match self.kind {
                ModelKind::Chat => {
                    self.prompt_path = "messages".to_string();
                    if self.prompt_value.is_none() {
                        self.prompt_value = Some(serde_json::json!({
                            "role": "system",
                            "content": self.prompt,
                        }));
                    }
                }
                ModelKind::Image => {
                    self.prompt_path = "prompt".to_string();
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Shape of an on-disk seed descriptor: a `models:` list in the record schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorFile {
    #[serde(default)]
    pub models: Vec<ModelRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str) -> ModelRecord {
        ModelRecord {
            id: "m1".to_string(),
            name: "Model One".to_string(),
            target: "gpt-3.5-turbo".to_string(),
            prompt: "You are helpful.".to_string(),
            url: url.to_string(),
            kind: ModelKind::Chat,
            prompt_path: String::new(),
            prompt_value: None,
            prompt_value_type: None,
        }
    }

    #[test]
    fn validate_fills_chat_defaults() {
        let mut rec = record("https://api.example.com/v1/chat/completions");
        rec.validate().unwrap();
        assert_eq!(rec.prompt_path, "messages");
        assert_eq!(
            rec.prompt_value,
            Some(serde_json::json!({"role": "system", "content": "You are helpful."}))
        );
    }

    #[test]
    fn validate_fills_image_path_without_value() {
        let mut rec = record("https://api.example.com/v1/images");
        rec.kind = ModelKind::Image;
        rec.validate().unwrap();
        assert_eq!(rec.prompt_path, "prompt");
        assert!(rec.prompt_value.is_none());
    }

    #[test]
    fn validate_keeps_explicit_path() {
        let mut rec = record("https://api.example.com/v1");
        rec.prompt_path = "input.messages".to_string();
        rec.validate().unwrap();
        assert_eq!(rec.prompt_path, "input.messages");
        assert!(rec.prompt_value.is_none());
    }

    #[test]
    fn validate_rejects_empty_fields() {
        let mut rec = record("https://api.example.com");
        rec.target = "  ".to_string();
        assert!(matches!(
            rec.validate(),
            Err(RecordError::MissingField("target"))
        ));
    }

    #[test]
    fn validate_rejects_url_without_host() {
        let mut rec = record("not-a-url");
        assert!(matches!(rec.validate(), Err(RecordError::InvalidUrl(_))));

        let mut rec = record("file:///tmp/socket");
        assert!(matches!(rec.validate(), Err(RecordError::InvalidUrl(_))));
    }

    #[test]
    fn descriptor_accepts_prompt_type_alias() {
        let raw = serde_json::json!({
            "models": [{
                "id": "i1",
                "name": "img",
                "target": "img-v1",
                "url": "https://api.example.com/images",
                "type": "image",
                "prompt_path": "prompt",
                "prompt_value": "SAFE:",
                "prompt_type": "string",
            }]
        });
        let file: DescriptorFile = serde_json::from_value(raw).unwrap();
        assert_eq!(
            file.models[0].prompt_value_type,
            Some(PromptValueType::String)
        );
    }
}
