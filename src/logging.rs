use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const LEVEL_CHOICES: &str = "trace, debug, info, warn, error, off";

/// Effective logging setup after CLI and config overrides are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Json,
        }
    }
}

impl LogSettings {
    /// `--log-level` beats `[logging].level`; anything unset keeps the default.
    pub fn resolve(config: &Config, cli_level: Option<&str>) -> anyhow::Result<Self> {
        let mut settings = Self::default();
        let logging = config.logging.as_ref();

        if let Some(raw) = cli_level.or_else(|| logging.and_then(|table| table.level.as_deref())) {
            settings.level = parse_level(raw)?;
        }
        if let Some(format) = logging.and_then(|table| table.format) {
            settings.format = format;
        }
        Ok(settings)
    }
}

/// Installs the global fmt subscriber and reports what it resolved to.
pub fn init(config: &Config, cli_level: Option<&str>) -> anyhow::Result<LogSettings> {
    let settings = LogSettings::resolve(config, cli_level)?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true);

    let installed = match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    installed
        .map_err(|err| anyhow!("install {} log subscriber: {err}", settings.format.as_str()))?;
    Ok(settings)
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim()
        .to_ascii_lowercase()
        .parse()
        .map_err(|_| anyhow!("invalid log level `{raw}`; expected one of {LEVEL_CHOICES}"))
}
