use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::AccessLogError;
use crate::record::AccessRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatterKind {
    Json,
    Line,
}

/// Template expressed as ordered named field groups. Each field is either
/// `$name` (system variable), `@group` (splice another group), or a literal,
/// with an optional trailing `#` (array flatten) and ` as alias` suffix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatterConfig {
    #[serde(default)]
    pub fields: HashMap<String, Vec<String>>,
}

pub trait Formatter: Send + Sync {
    fn format(&self, record: &AccessRecord) -> Result<Vec<u8>, AccessLogError>;
}

struct FieldSpec<'a> {
    token: &'a str,
    alias: Option<&'a str>,
    flatten: bool,
}

fn parse_field(raw: &str) -> FieldSpec<'_> {
    let mut token = raw.trim();
    let mut alias = None;
    if let Some((lhs, rhs)) = token.split_once(" as ") {
        token = lhs.trim();
        alias = Some(rhs.trim());
    }
    let flatten = token.ends_with('#');
    if flatten {
        token = token.trim_end_matches('#');
    }
    FieldSpec {
        token,
        alias,
        flatten,
    }
}

pub struct JsonFormatter {
    config: FormatterConfig,
}

impl JsonFormatter {
    pub fn new(config: FormatterConfig) -> Self {
        Self { config }
    }

    fn resolve(&self, token: &str, record: &AccessRecord) -> JsonValue {
        if let Some(name) = token.strip_prefix('$') {
            return record.system_value(name);
        }
        if let Some(group) = token.strip_prefix('@') {
            let Some(fields) = self.config.fields.get(group) else {
                return JsonValue::Null;
            };
            let mut nested = Map::new();
            for field in fields {
                self.process(field, record, &mut nested);
            }
            return JsonValue::Object(nested);
        }
        JsonValue::String(token.to_string())
    }

    fn process(&self, raw: &str, record: &AccessRecord, out: &mut Map<String, JsonValue>) {
        let spec = parse_field(raw);
        let value = self.resolve(spec.token, record);
        let name = spec
            .alias
            .unwrap_or_else(|| spec.token.trim_start_matches(['$', '@']))
            .to_string();
        let value = if spec.flatten {
            match value {
                JsonValue::Array(items) => JsonValue::Array(items),
                other => JsonValue::Array(vec![other]),
            }
        } else {
            value
        };
        out.insert(name, value);
    }
}

impl Formatter for JsonFormatter {
    /// Group `fields` is spliced into the document root; every other group
    /// becomes one top-level key holding its rendered object.
    fn format(&self, record: &AccessRecord) -> Result<Vec<u8>, AccessLogError> {
        let mut root = Map::new();
        if let Some(fields) = self.config.fields.get("fields") {
            for field in fields {
                self.process(field, record, &mut root);
            }
        }
        for (group, fields) in &self.config.fields {
            if group == "fields" {
                continue;
            }
            let mut nested = Map::new();
            for field in fields {
                self.process(field, record, &mut nested);
            }
            root.insert(group.clone(), JsonValue::Object(nested));
        }
        Ok(serde_json::to_vec(&JsonValue::Object(root))?)
    }
}

pub struct LineFormatter {
    config: FormatterConfig,
}

impl LineFormatter {
    pub fn new(config: FormatterConfig) -> Self {
        Self { config }
    }

    fn resolve(&self, raw: &str, record: &AccessRecord) -> String {
        let spec = parse_field(raw);
        if let Some(name) = spec.token.strip_prefix('$') {
            return render(&record.system_value(name));
        }
        if let Some(group) = spec.token.strip_prefix('@') {
            let Some(fields) = self.config.fields.get(group) else {
                return String::new();
            };
            return fields
                .iter()
                .map(|field| self.resolve(field, record))
                .collect::<Vec<_>>()
                .join(" ");
        }
        spec.token.to_string()
    }
}

impl Formatter for LineFormatter {
    /// Tab-separated values of the `fields` group, newline-terminated.
    fn format(&self, record: &AccessRecord) -> Result<Vec<u8>, AccessLogError> {
        let mut parts = Vec::new();
        if let Some(fields) = self.config.fields.get("fields") {
            for field in fields {
                parts.push(self.resolve(field, record));
            }
        }
        let mut line = parts.join("\t");
        line.push('\n');
        Ok(line.into_bytes())
    }
}

fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}
