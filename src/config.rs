use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    export::{FileExporter, ReportFormat},
    notify::{LogNotifier, WebhookNotifier},
    store::{FileStore, HttpReader, NoopWriter},
    Error, Exporter, FlagReader, FlagWriter, Notifier, Result,
};

/// Serialization format of flag documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagFormat {
    Json,
    #[default]
    Yaml,
}

impl FlagFormat {
    pub(crate) fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            FlagFormat::Json => Ok(serde_json::from_slice(bytes)?),
            FlagFormat::Yaml => Ok(serde_yaml::from_slice(bytes)?),
        }
    }

    pub(crate) fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            FlagFormat::Json => Ok(serde_json::to_vec_pretty(value)?),
            FlagFormat::Yaml => Ok(serde_yaml::to_string(value)?.into_bytes()),
        }
    }
}

impl FromStr for FlagFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<FlagFormat> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(FlagFormat::Json),
            "yaml" | "yml" => Ok(FlagFormat::Yaml),
            other => Err(Error::InvalidConfiguration(format!(
                "unsupported flag format '{other}'"
            ))),
        }
    }
}

/// Timing of a background loop.
// Not implementing `Copy` to keep room for non-copyable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerThreadConfig {
    /// Interval to wait between two ticks.
    pub interval: Duration,
    /// Up to `jitter` is subtracted from each wait so that several servers polling the same
    /// source do not synchronize.
    pub jitter: Duration,
}

impl PollerThreadConfig {
    pub fn new(interval: Duration) -> PollerThreadConfig {
        PollerThreadConfig {
            interval,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }
}

/// Where flags are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderConfig {
    File { path: PathBuf },
    /// Remote document, e.g. a raw file URL on a Git host.
    Http { url: String, token: Option<String> },
}

impl ReaderConfig {
    pub fn build(&self, format: FlagFormat) -> Result<Arc<dyn FlagReader + Send + Sync>> {
        match self {
            ReaderConfig::File { path } => Ok(Arc::new(FileStore::new(path, format))),
            ReaderConfig::Http { url, token } => {
                Ok(Arc::new(HttpReader::new(url, token.clone(), format)?))
            }
        }
    }
}

/// Where admin writes go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WriterConfig {
    #[default]
    Noop,
    File {
        path: PathBuf,
    },
}

impl WriterConfig {
    pub fn build(&self, format: FlagFormat) -> Result<Arc<dyn FlagWriter + Send + Sync>> {
        match self {
            WriterConfig::Noop => Ok(Arc::new(NoopWriter)),
            WriterConfig::File { path } => Ok(Arc::new(FileStore::new(path, format))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NotifierConfig {
    #[default]
    Log,
    Webhook {
        url: String,
    },
}

impl NotifierConfig {
    pub fn build(&self) -> Result<Arc<dyn Notifier + Send + Sync>> {
        match self {
            NotifierConfig::Log => Ok(Arc::new(LogNotifier)),
            NotifierConfig::Webhook { url } => Ok(Arc::new(WebhookNotifier::new(url)?)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExporterConfig {
    File { dir: PathBuf, format: ReportFormat },
}

impl ExporterConfig {
    pub fn build(&self) -> Result<Box<dyn Exporter + Send + Sync>> {
        match self {
            ExporterConfig::File { dir, format } => Ok(Box::new(FileExporter::new(dir, *format)?)),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> ExporterConfig {
        ExporterConfig::File {
            dir: std::env::temp_dir(),
            format: ReportFormat::Csv,
        }
    }
}

/// Configuration for [`Server`](crate::Server).
///
/// ```
/// # use std::time::Duration;
/// # use flagserve::{ReaderConfig, ServerConfig};
/// let config = ServerConfig::new()
///     .reader(ReaderConfig::File { path: "flags.yaml".into() })
///     .refresh_interval(Duration::from_secs(10))
///     .export_reports(true);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) env: String,
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) flag_format: FlagFormat,
    pub(crate) refresh: PollerThreadConfig,
    pub(crate) export_reports: bool,
    pub(crate) export: PollerThreadConfig,
    pub(crate) export_max_events: usize,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) reader: ReaderConfig,
    pub(crate) writer: WriterConfig,
    pub(crate) notifiers: Vec<NotifierConfig>,
    pub(crate) exporter: ExporterConfig,
}

impl ServerConfig {
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_secs(120);
    pub const DEFAULT_EXPORT_MAX_EVENTS: usize = 10_000;
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> ServerConfig {
        ServerConfig::default()
    }

    pub fn env(mut self, env: impl Into<String>) -> ServerConfig {
        self.env = env.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> ServerConfig {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> ServerConfig {
        self.version = version.into();
        self
    }

    pub fn flag_format(mut self, format: FlagFormat) -> ServerConfig {
        self.flag_format = format;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> ServerConfig {
        self.refresh = self.refresh.with_interval(interval);
        self
    }

    pub fn refresh(mut self, refresh: PollerThreadConfig) -> ServerConfig {
        self.refresh = refresh;
        self
    }

    /// Record one export event per single-flag evaluation.
    pub fn export_reports(mut self, enabled: bool) -> ServerConfig {
        self.export_reports = enabled;
        self
    }

    pub fn export_interval(mut self, interval: Duration) -> ServerConfig {
        self.export = self.export.with_interval(interval);
        self
    }

    pub fn export(mut self, export: PollerThreadConfig) -> ServerConfig {
        self.export = export;
        self
    }

    /// Buffer size at which [`ExportService::add`](crate::ExportService::add) flushes
    /// synchronously.
    pub fn export_max_events(mut self, max_events: usize) -> ServerConfig {
        self.export_max_events = max_events;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> ServerConfig {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn reader(mut self, reader: ReaderConfig) -> ServerConfig {
        self.reader = reader;
        self
    }

    pub fn writer(mut self, writer: WriterConfig) -> ServerConfig {
        self.writer = writer;
        self
    }

    pub fn notifiers(mut self, notifiers: Vec<NotifierConfig>) -> ServerConfig {
        self.notifiers = notifiers;
        self
    }

    pub fn exporter(mut self, exporter: ExporterConfig) -> ServerConfig {
        self.exporter = exporter;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            env: "dev".to_owned(),
            name: "flags".to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            flag_format: FlagFormat::Yaml,
            refresh: PollerThreadConfig::new(ServerConfig::DEFAULT_REFRESH_INTERVAL)
                .with_jitter(Duration::from_secs(5)),
            export_reports: false,
            export: PollerThreadConfig::new(ServerConfig::DEFAULT_EXPORT_INTERVAL),
            export_max_events: ServerConfig::DEFAULT_EXPORT_MAX_EVENTS,
            shutdown_timeout: ServerConfig::DEFAULT_SHUTDOWN_TIMEOUT,
            reader: ReaderConfig::File {
                path: PathBuf::from("./flags.yaml"),
            },
            writer: WriterConfig::Noop,
            notifiers: vec![NotifierConfig::Log],
            exporter: ExporterConfig::default(),
        }
    }
}
