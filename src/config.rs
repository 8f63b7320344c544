use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Raised when a proxy instance cannot be constructed: bad upstream URL, unusable fixture
/// directory, unreadable TLS material, invalid hook rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationError {
    reason: String,
}

impl ConfigurationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for ConfigurationError {}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub fixtures: FixturesConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub normalize: Option<NormalizeConfig>,
    #[serde(default)]
    pub scrub: Option<ScrubConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Resolves a path from the config file against the file's directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.source_path.as_deref().and_then(Path::parent) {
            Some(base) => base.join(path),
            None => path.to_path_buf(),
        }
    }

    pub fn fixture_dir(&self) -> PathBuf {
        self.resolve_path(&self.fixtures.dir)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
}

impl ProxyConfig {
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES)
    }
}

#[derive(Debug, Deserialize)]
pub struct FixturesConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub tls: Option<UpstreamTlsConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpstreamTlsConfig {
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct NormalizeConfig {
    /// Request headers removed before fingerprinting (case-insensitive).
    #[serde(default)]
    pub remove_headers: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct ScrubConfig {
    #[serde(default)]
    pub headers: Vec<HeaderRewriteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeaderRewriteConfig {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    #[serde(default)]
    pub scope: HeaderScope,
}

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HeaderScope {
    #[default]
    Request,
    Response,
    Both,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}
