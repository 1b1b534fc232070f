//! log4rs wiring for the runtime.
//!
//! Three sinks: `app.log` (root), `metrics.log` (target `nexus_odm::metrics`: slow reads,
//! flush summaries) and, when enabled, `dev6.log` (target `nexus_odm::dev6`).

use crate::errors::OdmError;
use log::LevelFilter;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::{Path, PathBuf};

const ENCODER_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
const ROLL_SIZE_BYTES: u64 = 10 * 1024 * 1024;

pub const METRICS_TARGET: &str = "nexus_odm::metrics";
pub const DEV6_TARGET: &str = "nexus_odm::dev6";

/// Options for [`configure_logging`].
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Base directory for log files; current directory when `None`.
    pub dir: Option<PathBuf>,
    /// error|warn|info|debug|trace, default info.
    pub level: Option<String>,
    /// Number of rolled files to keep, default 7.
    pub retention: Option<u32>,
    /// Persist `dev6!` bench lines to `dev6.log`.
    pub enable_dev6: bool,
}

#[must_use]
pub fn parse_level(level: Option<&str>) -> LevelFilter {
    match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn rolling_appender(base: &Path, stem: &str, keep: u32) -> Result<RollingFileAppender, OdmError> {
    let roller = FixedWindowRoller::builder()
        .build(&format!("{}", base.join(format!("{stem}.{{}}.log")).display()), keep)
        .map_err(|e| OdmError::Config(e.to_string()))?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_SIZE_BYTES)), Box::new(roller));
    RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(ENCODER_PATTERN)))
        .build(base.join(format!("{stem}.log")), Box::new(policy))
        .map_err(|e| OdmError::Io(e.to_string()))
}

/// Build the log4rs configuration without installing it.
///
/// # Errors
/// Returns an error if the directory cannot be created or an appender fails to build.
pub fn build_config(opts: &LogOptions) -> Result<Config, OdmError> {
    let base = match &opts.dir {
        Some(d) => d.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    std::fs::create_dir_all(&base)?;
    let keep = opts.retention.unwrap_or(7);
    let lvl = parse_level(opts.level.as_deref());

    let mut builder = Config::builder()
        .appender(Appender::builder().build("app", Box::new(rolling_appender(&base, "app", keep)?)))
        .appender(
            Appender::builder().build("metrics", Box::new(rolling_appender(&base, "metrics", keep)?)),
        )
        .logger(Logger::builder().appender("metrics").additive(false).build(METRICS_TARGET, lvl));

    if opts.enable_dev6 {
        builder = builder
            .appender(Appender::builder().build("dev6", Box::new(rolling_appender(&base, "dev6", keep)?)))
            .logger(
                Logger::builder()
                    .appender("dev6")
                    .additive(false)
                    .build(DEV6_TARGET, LevelFilter::Trace),
            );
    } else {
        builder = builder.logger(Logger::builder().additive(false).build(DEV6_TARGET, LevelFilter::Off));
    }

    builder
        .build(Root::builder().appender("app").build(lvl))
        .map_err(|e| OdmError::Config(e.to_string()))
}

/// Configure logging globally for the process. A second call is ignored by log4rs; the
/// error is swallowed so that embedding applications keep their own logger.
///
/// # Errors
/// Returns an error if the configuration cannot be built.
pub fn configure_logging(opts: &LogOptions) -> Result<(), OdmError> {
    let config = build_config(opts)?;
    if log4rs::init_config(config).is_err() {
        log::debug!("logger already initialized; keeping existing configuration");
    }
    Ok(())
}

/// Read [`LogOptions`] from the environment:
/// - `NEXUS_ODM_LOG_DIR`
/// - `NEXUS_ODM_LOG_LEVEL`
/// - `NEXUS_ODM_LOG_RETENTION`
/// - `NEXUS_ODM_DEV6`
#[must_use]
pub fn options_from_env() -> LogOptions {
    LogOptions {
        dir: std::env::var("NEXUS_ODM_LOG_DIR").ok().map(PathBuf::from),
        level: std::env::var("NEXUS_ODM_LOG_LEVEL").ok(),
        retention: std::env::var("NEXUS_ODM_LOG_RETENTION").ok().and_then(|s| s.parse::<u32>().ok()),
        enable_dev6: std::env::var("NEXUS_ODM_DEV6")
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false),
    }
}

/// Configure logging from environment variables.
///
/// # Errors
/// Returns an error if the configuration cannot be built.
pub fn configure_from_env() -> Result<(), OdmError> {
    configure_logging(&options_from_env())
}
