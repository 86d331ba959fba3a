//! Server configuration.
//!
//! Loaded from a TOML file. Every field has a default, so an empty file is
//! a valid configuration.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration, printed by `--print-config`.
pub const DEFAULT_CONFIG: &str = r#"# rpcchan demo server configuration

# Address to accept HTTP connections on
listen = "127.0.0.1:8080"

# Path prefix under which RPC methods are served
base_path = "/"

# Largest request message accepted (e.g., "4MB", "512KB")
max_recv_message_size = "4MB"

# Largest response message sent. Unlimited when not set.
# max_send_message_size = "4MB"

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
# Can be overridden with RUST_LOG environment variable
level = "info"
# Log format: "pretty" (human-readable), "json", or "compact"
format = "pretty"
# Include timestamps
timestamps = true
# Include thread names
thread_names = false
# Include module target
target = true
"#;

/// Server configuration loaded from TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Path prefix for RPC methods
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Maximum request message size (e.g., "4MB")
    #[serde(
        default = "default_max_recv_message_size",
        deserialize_with = "deserialize_size"
    )]
    pub max_recv_message_size: usize,

    /// Maximum response message size
    #[serde(default, deserialize_with = "deserialize_optional_size")]
    pub max_send_message_size: Option<usize>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            base_path: default_base_path(),
            max_recv_message_size: default_max_recv_message_size(),
            max_send_message_size: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level, used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    #[serde(default)]
    pub thread_names: bool,

    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            thread_names: false,
            target: true,
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_base_path() -> String {
    "/".to_string()
}

fn default_max_recv_message_size() -> usize {
    rpcchan::DEFAULT_MAX_RECV_MESSAGE_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Number(usize),
    String(String),
}

impl SizeValue {
    fn into_bytes(self) -> Result<usize, String> {
        match self {
            SizeValue::Number(n) => Ok(n),
            SizeValue::String(s) => parse_size(&s),
        }
    }
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    SizeValue::deserialize(deserializer)?
        .into_bytes()
        .map_err(D::Error::custom)
}

fn deserialize_optional_size<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<SizeValue>::deserialize(deserializer)? {
        Some(value) => value.into_bytes().map(Some).map_err(D::Error::custom),
        None => Ok(None),
    }
}

/// Parse a size such as "4MB", "512KB" or "1024".
///
/// Suffixes are binary multiples and case-insensitive.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

/// Format a size in bytes as a human-readable string.
pub fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    const GB: usize = 1024 * MB;

    if bytes >= GB && bytes.is_multiple_of(GB) {
        format!("{} GB", bytes / GB)
    } else if bytes >= MB && bytes.is_multiple_of(MB) {
        format!("{} MB", bytes / MB)
    } else if bytes >= KB && bytes.is_multiple_of(KB) {
        format!("{} KB", bytes / KB)
    } else {
        format!("{} bytes", bytes)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "base_path {:?} must start with '/'",
                self.base_path
            )));
        }

        if self.max_recv_message_size == 0 {
            return Err(ConfigError::Invalid(
                "max_recv_message_size must be greater than zero".to_string(),
            ));
        }

        if self.max_send_message_size == Some(0) {
            return Err(ConfigError::Invalid(
                "max_send_message_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
