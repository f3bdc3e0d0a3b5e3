use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::AccessLogError;
use crate::file_sink::{FileSink, FileSinkConfig, LogFileInfo, RotatePeriod};
use crate::formatter::{
    Formatter, FormatterConfig, FormatterKind, JsonFormatter, LineFormatter,
};
use crate::record::AccessRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: FormatterKind,
    pub file: String,
    pub dir: std::path::PathBuf,
    #[serde(default)]
    pub period: RotatePeriod,
    /// Retention in days.
    #[serde(default)]
    pub expire: i64,
    #[serde(default)]
    pub formatter: FormatterConfig,
}

fn default_true() -> bool {
    true
}

/// One named logger: a formatter feeding a rotating file sink.
pub struct RequestLogger {
    config: OutputConfig,
    formatter: Box<dyn Formatter>,
    sink: Arc<FileSink>,
    enabled: AtomicBool,
}

impl RequestLogger {
    pub fn new(config: OutputConfig) -> Result<Self, AccessLogError> {
        let formatter: Box<dyn Formatter> = match config.kind {
            FormatterKind::Json => Box::new(JsonFormatter::new(config.formatter.clone())),
            FormatterKind::Line => Box::new(LineFormatter::new(config.formatter.clone())),
        };
        let sink = FileSink::open(FileSinkConfig {
            dir: config.dir.clone(),
            file: config.file.clone(),
            period: config.period,
            expire_days: config.expire,
        })?;
        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            formatter,
            sink,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn log(&self, record: &AccessRecord) -> Result<(), AccessLogError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut formatted = self.formatter.format(record)?;
        if formatted.last() != Some(&b'\n') {
            formatted.push(b'\n');
        }
        self.sink.write(&formatted)
    }

    pub fn list_files(&self) -> Result<Vec<LogFileInfo>, AccessLogError> {
        self.sink.list_files()
    }

    pub fn read_slice(
        &self,
        filename: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<u8>, AccessLogError> {
        self.sink.read_slice(filename, offset, limit)
    }

    pub fn close(&self) {
        self.set_enabled(false);
        self.sink.close();
    }
}

/// Name → logger map with asynchronous fan-out. `log_to_all` hands one record
/// to every enabled logger on its own blocking task and returns immediately;
/// a slow or failing sink never backs up the request path.
#[derive(Default)]
pub struct LoggerRegistry {
    loggers: RwLock<HashMap<String, Arc<RequestLogger>>>,
}

impl LoggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a logger, replacing (and closing) any logger with the same
    /// name.
    pub fn add_logger(&self, config: OutputConfig) -> Result<(), AccessLogError> {
        let logger = Arc::new(RequestLogger::new(config)?);
        let mut guard = self.write_guard();
        if let Some(old) = guard.insert(logger.name().to_string(), logger) {
            old.close();
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<RequestLogger>> {
        self.read_guard().get(name).cloned()
    }

    pub fn remove(&self, name: &str) {
        if let Some(logger) = self.write_guard().remove(name) {
            logger.close();
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.read_guard().keys().cloned().collect()
    }

    pub fn log_to_all(&self, record: AccessRecord) {
        let targets: Vec<Arc<RequestLogger>> = self
            .read_guard()
            .values()
            .filter(|logger| logger.is_enabled())
            .cloned()
            .collect();
        for logger in targets {
            let record = record.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(err) = logger.log(&record) {
                    tracing::warn!(logger = logger.name(), "access log write failed: {err}");
                }
            });
        }
    }

    pub fn close(&self) {
        let mut guard = self.write_guard();
        for logger in guard.values() {
            logger.close();
        }
        guard.clear();
    }

    fn read_guard(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<RequestLogger>>> {
        self.loggers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<RequestLogger>>> {
        self.loggers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The logger installed at startup: structured JSON over every system field,
/// hourly rotation, three-day retention.
pub fn default_output_config(log_dir: &Path) -> OutputConfig {
    let fields = [
        "$request_id",
        "$timestamp",
        "$method",
        "$path",
        "$user_agent",
        "$client_ip",
        "$api_key",
        "$user_id",
        "$request_size",
        "$request_body",
        "$model_id",
        "$target_model",
        "$proxy_url",
        "$proxy_scheme",
        "$proxy_host",
        "$upstream_body",
        "$status_code",
        "$response_size",
        "$response_time",
        "$response_body",
        "$error",
    ];
    OutputConfig {
        name: "default".to_string(),
        description: "default access log".to_string(),
        enabled: true,
        kind: FormatterKind::Json,
        file: "access.log".to_string(),
        dir: log_dir.to_path_buf(),
        period: RotatePeriod::Hour,
        expire: 3,
        formatter: FormatterConfig {
            fields: HashMap::from([(
                "fields".to_string(),
                fields.iter().map(|f| f.to_string()).collect(),
            )]),
        },
    }
}
