use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

/// One structured access-log entry per completed (or rejected) proxy request.
#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub method: String,
    pub path: String,
    pub user_agent: String,
    pub client_ip: String,

    pub api_key: String,
    pub user_id: i64,

    pub request_size: i64,
    pub request_body: String,
    pub headers: HashMap<String, String>,

    pub model_id: String,
    pub target_model: String,
    pub proxy_url: String,
    pub proxy_scheme: String,
    pub proxy_host: String,
    pub upstream_body: String,

    pub status_code: u16,
    pub response_size: i64,
    pub response_time_ms: i64,
    pub response_body: String,

    pub error: String,

    pub extra: HashMap<String, JsonValue>,
}

impl AccessRecord {
    pub fn new() -> Self {
        Self {
            request_id: String::new(),
            timestamp: OffsetDateTime::now_utc(),
            method: String::new(),
            path: String::new(),
            user_agent: String::new(),
            client_ip: String::new(),
            api_key: String::new(),
            user_id: 0,
            request_size: 0,
            request_body: String::new(),
            headers: HashMap::new(),
            model_id: String::new(),
            target_model: String::new(),
            proxy_url: String::new(),
            proxy_scheme: String::new(),
            proxy_host: String::new(),
            upstream_body: String::new(),
            status_code: 0,
            response_size: 0,
            response_time_ms: 0,
            response_body: String::new(),
            error: String::new(),
            extra: HashMap::new(),
        }
    }

    /// Resolve a `$variable` against the record. Unknown names fall back to
    /// the `extra` map, then to the record's own field names, then to "".
    pub fn system_value(&self, pattern: &str) -> JsonValue {
        match pattern {
            "request_id" => JsonValue::String(self.request_id.clone()),
            "timestamp" | "time_iso8601" => JsonValue::String(
                self.timestamp
                    .format(&Rfc3339)
                    .unwrap_or_default(),
            ),
            "time_local" => {
                let format =
                    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
                JsonValue::String(self.timestamp.format(&format).unwrap_or_default())
            }
            "msec" => {
                JsonValue::from((self.timestamp.unix_timestamp_nanos() / 1_000_000) as i64)
            }
            "method" | "request_method" => JsonValue::String(self.method.clone()),
            "path" | "request_uri" => JsonValue::String(self.path.clone()),
            "user_agent" => JsonValue::String(self.user_agent.clone()),
            "client_ip" | "remote_addr" => JsonValue::String(self.client_ip.clone()),

            "api_key" => JsonValue::String(self.api_key.clone()),
            "user_id" => JsonValue::from(self.user_id),

            "request_size" | "request_length" => JsonValue::from(self.request_size),
            "request_body" => JsonValue::String(self.request_body.clone()),
            "headers" => serde_json::to_value(&self.headers).unwrap_or(JsonValue::Null),

            "model_id" => JsonValue::String(self.model_id.clone()),
            "target_model" => JsonValue::String(self.target_model.clone()),
            "proxy_uri" | "proxy_url" => JsonValue::String(self.proxy_url.clone()),
            "proxy_scheme" => JsonValue::String(self.proxy_scheme.clone()),
            "proxy_host" | "proxy_addr" => JsonValue::String(self.proxy_host.clone()),
            "upstream_body" => JsonValue::String(self.upstream_body.clone()),

            "status" | "status_code" => JsonValue::from(self.status_code),
            "response_size" | "response_length" => JsonValue::from(self.response_size),
            "response_time" => JsonValue::from(self.response_time_ms),
            "response_body" => JsonValue::String(self.response_body.clone()),

            "error" => JsonValue::String(self.error.clone()),

            other => {
                if let Some(value) = self.extra.get(other) {
                    return value.clone();
                }
                serde_json::to_value(self)
                    .ok()
                    .and_then(|doc| doc.get(other).cloned())
                    .unwrap_or(JsonValue::String(String::new()))
            }
        }
    }
}

impl Default for AccessRecord {
    fn default() -> Self {
        Self::new()
    }
}
