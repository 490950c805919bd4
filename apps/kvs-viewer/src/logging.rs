//! Process-wide tracing setup for the viewer binary.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

/// Full directive string that replaces everything derived from `--log-level`.
pub const FILTER_ENV: &str = "KVS_LOG_FILTER";
/// Any value other than empty or `0` lets the media stack log at the
/// requested level too.
pub const TRACE_DEPS_ENV: &str = "KVS_TRACE_DEPS";

const VIEWER_TARGETS: &[&str] = &["kvs_viewer", "kvs_viewer_core", "kvs_signaling"];

/// ICE, DTLS and RTP internals log per packet and per connectivity check.
const MEDIA_STACK_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_sctp",
    "webrtc_mdns",
    "webrtc_util",
    "interceptor",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("cannot install global subscriber: {0}")]
    Install(String),
}

static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once it is installed, later calls return
/// `Ok` and leave it in place.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if WRITER_GUARD.get().is_some() {
        return Ok(());
    }

    let directives = std::env::var(FILTER_ENV)
        .unwrap_or_else(|_| default_directives(config.level, dependency_traces_enabled()));
    let filter = EnvFilter::try_new(&directives)?;
    let (writer, guard) = open_writer(config.file.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = WRITER_GUARD.set(guard);
    tracing::debug!(%directives, "logging initialised");
    Ok(())
}

fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let Some(path) = file else {
        return Ok(tracing_appender::non_blocking(std::io::stderr()));
    };
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::LogFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(tracing_appender::non_blocking(log))
}

/// Up to `info` the level applies everywhere. Above it only the viewer
/// crates are raised. Other crates stay at `info` and the media stack at
/// `warn`.
fn default_directives(level: LogLevel, dependency_traces: bool) -> String {
    let own = level.directive();
    if level <= LogLevel::Info || dependency_traces {
        return own.to_string();
    }
    let mut directives = vec!["info".to_string()];
    directives.extend(VIEWER_TARGETS.iter().map(|target| format!("{target}={own}")));
    directives.extend(MEDIA_STACK_TARGETS.iter().map(|target| format!("{target}=warn")));
    directives.join(",")
}

fn dependency_traces_enabled() -> bool {
    matches!(std::env::var(TRACE_DEPS_ENV).as_deref(), Ok(value) if !value.is_empty() && value != "0")
}
