//! Logging setup shared by the PVC backup binaries and tests.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::Once;

use pvc_backup_config::{Environment, UnknownEnvironment};
use thiserror::Error;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, InitError};
use tracing_log::{LogTracer, log_tracer::SetLoggerError};
use tracing_subscriber::{EnvFilter, FmtSubscriber, Registry, fmt, layer::SubscriberExt};

/// Directory, relative to the working directory, receiving JSON log files.
const DEFAULT_LOG_DIR: &str = "logs";

/// Number of daily log files kept on disk.
const MAX_LOG_FILES: usize = 5;

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to build rolling file appender: {0}")]
    InitAppender(#[from] InitError),

    #[error("failed to init log tracer: {0}")]
    InitLogTracer(#[from] SetLoggerError),

    #[error("failed to set global default subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),

    #[error("failed to load the runtime environment: {0}")]
    Environment(#[from] UnknownEnvironment),
}

/// Keeps buffered file logs alive until dropped.
///
/// Hold it for the lifetime of `main`; dropping it flushes pending records.
#[must_use]
pub enum LogFlusher {
    Flusher(WorkerGuard),
    NullFlusher,
}

/// Where and under which name logs are written.
#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Prefix of the rolling log files.
    pub app_name: String,
    /// Directory receiving the rolling log files in production.
    pub log_dir: PathBuf,
}

impl TracingOptions {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }
}

static INIT_TEST_TRACING: Once = Once::new();

/// Enables terminal logging for a test run when `ENABLE_TRACING` is set:
///
/// ENABLE_TRACING=1 cargo test <test_name>
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_ok() {
            // Prod would log to files, tests want the terminal.
            Environment::Dev.set();
            let _log_flusher = init_tracing(TracingOptions::new("test"))
                .expect("Failed to initialize tracing for tests");
        }
    });
}

/// Installs the global subscriber.
///
/// Production and staging write JSON lines to a daily rolling file, development
/// pretty-prints to the terminal. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(options: TracingOptions) -> Result<LogFlusher, TracingError> {
    // Route `log` records emitted by dependencies (kube, sqlx) through tracing.
    LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_flusher = if Environment::load()?.is_prod() {
        configure_file_tracing(filter, &options.app_name, &options.log_dir)?
    } else {
        configure_terminal_tracing(filter)?
    };

    set_tracing_panic_hook();

    Ok(log_flusher)
}

fn configure_file_tracing(
    filter: EnvFilter,
    app_name: &str,
    log_dir: &Path,
) -> Result<LogFlusher, TracingError> {
    let file_appender = rolling::Builder::new()
        .filename_prefix(app_name)
        .filename_suffix("log")
        .rotation(rolling::Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)?;

    let (file_appender, guard) = tracing_appender::non_blocking(file_appender);

    let format = fmt::format()
        .with_level(true)
        .with_ansi(false)
        .with_target(false);

    let subscriber = Registry::default().with(filter).with(
        fmt::layer()
            .event_format(format)
            .with_writer(file_appender)
            .json()
            .with_current_span(true)
            .with_span_list(true),
    );

    set_global_default(subscriber)?;

    Ok(LogFlusher::Flusher(guard))
}

fn configure_terminal_tracing(filter: EnvFilter) -> Result<LogFlusher, TracingError> {
    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .pretty()
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let subscriber = FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .finish();

    set_global_default(subscriber)?;

    Ok(LogFlusher::NullFlusher)
}

/// Sends panics through `tracing` before delegating to the previous hook, so
/// they reach the JSON log files and not only stderr.
fn set_tracing_panic_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        panic_hook(info);
        prev_hook(info);
    }));
}

fn panic_hook(panic_info: &PanicHookInfo) {
    let backtrace = Backtrace::capture();
    let (backtrace, note) = match backtrace.status() {
        BacktraceStatus::Captured => (Some(backtrace), None),
        BacktraceStatus::Disabled => (
            None,
            Some("run with RUST_BACKTRACE=1 to display backtraces"),
        ),
        _ => (None, Some("backtraces are not available")),
    };

    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic_info.payload().downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload");

    let location = panic_info.location().map(|location| location.to_string());

    tracing::error!(
        panic.payload = payload,
        panic.location = location,
        panic.backtrace = backtrace.map(tracing::field::display),
        panic.note = note,
        "a panic occurred",
    );
}
