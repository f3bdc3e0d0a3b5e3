mod file_sink;
mod formatter;
mod record;
mod registry;

pub use file_sink::{FileSink, FileSinkConfig, LogFileInfo, RotatePeriod};
pub use formatter::{Formatter, FormatterConfig, FormatterKind, JsonFormatter, LineFormatter};
pub use record::AccessRecord;
pub use registry::{default_output_config, LoggerRegistry, OutputConfig, RequestLogger};

#[derive(Debug, thiserror::Error)]
pub enum AccessLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("log file does not exist: {0}")]
    UnknownFile(String),
    #[error("log sink is closed")]
    Closed,
}
