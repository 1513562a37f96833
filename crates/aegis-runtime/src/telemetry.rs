//! Log and span output for the gateway process.
//!
//! [`init_tracing`] installs one global subscriber built from up to three
//! sinks, all behind the same `RUST_LOG` filter (default `info`):
//!
//! | Sink | Enabled by |
//! |---|---|
//! | console, compact or JSON | always; `AEGIS_LOG_FORMAT=json` for JSON |
//! | daily-rotated `system.*.log` files | `AEGIS_LOG_DIR=<dir>` |
//! | OTLP/HTTP span export | `OTEL_EXPORTER_OTLP_ENDPOINT=<url>` |
//!
//! ```rust,no_run
//! // Hold the guard until exit: it flushes the log file and pending spans.
//! let _guard = aegis_runtime::init_tracing("aegiscan");
//! ```

use std::path::{Path, PathBuf};

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Rotated log files kept on disk.
pub const LOG_FILES_KEPT: usize = 5;
const LOG_FILE_PREFIX: &str = "system";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// What [`init_tracing`] should install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub service: String,
    pub json: bool,
    /// Directory for rotated log files; no file output when `None`.
    pub file_dir: Option<PathBuf>,
    pub otlp_endpoint: Option<String>,
}

impl LogSettings {
    /// Read `AEGIS_LOG_FORMAT`, `AEGIS_LOG_DIR` and
    /// `OTEL_EXPORTER_OTLP_ENDPOINT`.
    pub fn from_env(service: &str) -> Self {
        Self::from_vars(service, |key| std::env::var(key).ok())
    }

    fn from_vars(service: &str, var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            service: service.to_string(),
            json: var("AEGIS_LOG_FORMAT").is_some_and(|f| f.trim().eq_ignore_ascii_case("json")),
            file_dir: non_empty("AEGIS_LOG_DIR").map(PathBuf::from),
            otlp_endpoint: non_empty("OTEL_EXPORTER_OTLP_ENDPOINT"),
        }
    }
}

/// Keeps the background outputs alive. Dropping it flushes the log file
/// writer and shuts the span exporter down.
#[must_use = "dropping the guard stops file logging and span export"]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
    file: Option<WorkerGuard>,
}

impl TelemetryGuard {
    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }

    pub fn writes_file(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[aegiscan] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

/// Install the global subscriber from the environment. See the module docs.
///
/// A second call leaves the first subscriber in place, so tests may call
/// this freely.
pub fn init_tracing(service: &str) -> TelemetryGuard {
    init_with(&LogSettings::from_env(service))
}

/// Install the global subscriber described by `settings`.
///
/// Outputs that fail to open are reported on stderr and left out; the
/// console output is always installed.
pub fn init_with(settings: &LogSettings) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console = fmt::layer();
    let mut layers: Vec<BoxedLayer> = vec![if settings.json {
        console.json().boxed()
    } else {
        console.compact().boxed()
    }];

    let file = settings.file_dir.as_deref().and_then(|dir| match open_log_file(dir) {
        Ok((writer, guard)) => {
            layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
            Some(guard)
        }
        Err(e) => {
            eprintln!("[aegiscan] log file in {} unavailable: {e}", dir.display());
            None
        }
    });

    let provider = settings
        .otlp_endpoint
        .as_deref()
        .and_then(|endpoint| span_provider(&settings.service, endpoint));
    if let Some(provider) = &provider {
        let tracer = provider.tracer("aegiscan");
        layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
    }

    if let Err(e) = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
    {
        eprintln!("[aegiscan] tracing subscriber already installed: {e}");
    }

    TelemetryGuard { provider, file }
}

/// Non-blocking writer over `dir/system.<date>.log`, rotated daily with the
/// newest [`LOG_FILES_KEPT`] files kept.
fn open_log_file(dir: &Path) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(LOG_FILES_KEPT)
        .build(dir)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// OTLP/HTTP span pipeline, or `None` when the exporter cannot be built.
fn span_provider(service: &str, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[aegiscan] OTLP exporter init failed: {e}"))
        .ok()?;

    Some(
        SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name(service.to_string()).build())
            // Built before the CLI's runtime exists, so no batch exporter.
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn settings(pairs: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<&str, &str> = pairs.iter().copied().collect();
        LogSettings::from_vars("svc", |key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_are_console_only() {
        let s = settings(&[]);
        assert_eq!(s.service, "svc");
        assert!(!s.json);
        assert_eq!(s.file_dir, None);
        assert_eq!(s.otlp_endpoint, None);
    }

    #[test]
    fn env_values_select_outputs() {
        let s = settings(&[
            ("AEGIS_LOG_FORMAT", " JSON "),
            ("AEGIS_LOG_DIR", "data"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4318"),
        ]);
        assert!(s.json);
        assert_eq!(s.file_dir, Some(PathBuf::from("data")));
        assert_eq!(s.otlp_endpoint.as_deref(), Some("http://localhost:4318"));

        let blank = settings(&[("AEGIS_LOG_FORMAT", "compact"), ("AEGIS_LOG_DIR", "  ")]);
        assert!(!blank.json);
        assert_eq!(blank.file_dir, None);
    }

    #[test]
    fn log_file_lands_in_the_directory() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let (mut writer, guard) = open_log_file(dir.path())?;
        writer.write_all(b"gateway started\n")?;
        // Dropping the guard flushes the background writer.
        drop(guard);

        let files: Vec<PathBuf> = std::fs::read_dir(dir.path())?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().and_then(|n| n.to_str()).ok_or("bad name")?;
        assert!(name.starts_with("system.") && name.ends_with(".log"), "{name}");
        assert!(std::fs::read_to_string(&files[0])?.contains("gateway started"));
        Ok(())
    }

    #[test]
    fn guard_without_outputs_drops_cleanly() {
        let guard = TelemetryGuard {
            provider: None,
            file: None,
        };
        assert!(!guard.is_exporting());
        assert!(!guard.writes_file());
    }
}
