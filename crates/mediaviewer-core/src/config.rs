use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("media_viewer_url is not set")]
    MissingViewerUrl,

    #[error("invalid media_viewer_url {url:?}: {reason}")]
    InvalidViewerUrl { url: String, reason: String },

    #[error("unknown forward mode {0:?} (expected self-encrypt or passthrough)")]
    InvalidMode(String),
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "config_read",
            Self::Parse { .. } => "config_parse",
            Self::MissingViewerUrl => "missing_viewer_url",
            Self::InvalidViewerUrl { .. } => "invalid_viewer_url",
            Self::InvalidMode(_) => "invalid_mode",
        }
    }
}

/// Which request builder handles media events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardMode {
    #[default]
    SelfEncrypt,
    Passthrough,
}

impl ForwardMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfEncrypt => "self-encrypt",
            Self::Passthrough => "passthrough",
        }
    }
}

impl std::fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForwardMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "self-encrypt" | "self_encrypt" => Ok(Self::SelfEncrypt),
            "passthrough" => Ok(Self::Passthrough),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

/// On-disk TOML shape; every field may be overridden from the command line
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FileConfig {
    pub media_viewer_url: Option<String>,
    pub mode: Option<ForwardMode>,
    pub request_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn from_toml_str(s: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&s, path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub media_viewer_url: Option<String>,
    pub mode: Option<ForwardMode>,
    pub request_timeout_secs: Option<u64>,
}

/// Validated settings for one forwarder snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    /// Absolute http(s) URL without trailing slash
    pub media_viewer_url: String,
    pub mode: ForwardMode,
    pub request_timeout: Duration,
}

impl ForwarderConfig {
    pub fn resolve(file: FileConfig, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let raw_url = overrides
            .media_viewer_url
            .clone()
            .or(file.media_viewer_url)
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingViewerUrl)?;
        let timeout_secs = overrides
            .request_timeout_secs
            .or(file.request_timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);

        Ok(Self {
            media_viewer_url: normalize_viewer_url(&raw_url)?,
            mode: overrides.mode.or(file.mode).unwrap_or_default(),
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Require an absolute http(s) URL and strip trailing slashes
pub fn normalize_viewer_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let invalid = |reason: &str| ConfigError::InvalidViewerUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let parsed = reqwest::Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(invalid("query and fragment are not allowed"));
    }
    Ok(trimmed.to_string())
}

/// Where a [`ForwarderConfig`] comes from, re-read on every reload
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    pub path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

impl ConfigSource {
    pub fn new(path: Option<PathBuf>, overrides: ConfigOverrides) -> Self {
        Self { path, overrides }
    }

    pub fn load(&self) -> Result<ForwarderConfig, ConfigError> {
        let file = match &self.path {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        ForwarderConfig::resolve(file, &self.overrides)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_full_file() {
        let file = write_config(
            r#"
media_viewer_url = "https://media.example.com/"
mode = "passthrough"
request_timeout_secs = 12
"#,
        );
        let config = ConfigSource::new(Some(file.path().to_path_buf()), Default::default())
            .load()
            .unwrap();
        assert_eq!(
            config,
            ForwarderConfig {
                media_viewer_url: "https://media.example.com".to_string(),
                mode: ForwardMode::Passthrough,
                request_timeout: Duration::from_secs(12),
            }
        );
    }

    #[test]
    fn defaults_apply() {
        let file = write_config(r#"media_viewer_url = "http://localhost:8080""#);
        let config = ConfigSource::new(Some(file.path().to_path_buf()), Default::default())
            .load()
            .unwrap();
        assert_eq!(config.mode, ForwardMode::SelfEncrypt);
        assert_eq!(config.request_timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn overrides_win() {
        let file = write_config(
            r#"
media_viewer_url = "https://a.example.com"
mode = "self-encrypt"
"#,
        );
        let overrides = ConfigOverrides {
            media_viewer_url: Some("https://b.example.com".to_string()),
            mode: Some(ForwardMode::Passthrough),
            request_timeout_secs: Some(5),
        };
        let config = ConfigSource::new(Some(file.path().to_path_buf()), overrides)
            .load()
            .unwrap();
        assert_eq!(config.media_viewer_url, "https://b.example.com");
        assert_eq!(config.mode, ForwardMode::Passthrough);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn overrides_alone_are_enough() {
        let source = ConfigSource::new(
            None,
            ConfigOverrides {
                media_viewer_url: Some("https://media.example.com".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(
            source.load().unwrap().media_viewer_url,
            "https://media.example.com"
        );
    }

    #[test]
    fn timeout_is_clamped() {
        let overrides = |secs| ConfigOverrides {
            media_viewer_url: Some("https://media.example.com".to_string()),
            request_timeout_secs: Some(secs),
            ..Default::default()
        };
        let low = ForwarderConfig::resolve(FileConfig::default(), &overrides(0)).unwrap();
        assert_eq!(low.request_timeout, Duration::from_secs(MIN_TIMEOUT_SECS));
        let high = ForwarderConfig::resolve(FileConfig::default(), &overrides(86_400)).unwrap();
        assert_eq!(high.request_timeout, Duration::from_secs(MAX_TIMEOUT_SECS));
    }

    #[test]
    fn missing_url_is_an_error() {
        let err = ConfigSource::default().load().unwrap_err();
        assert_eq!(err, ConfigError::MissingViewerUrl);
    }

    #[test]
    fn invalid_urls_are_rejected() {
        for raw in ["media.example.com", "ftp://media.example.com", "https://", "https://a.example.com/?x=1"] {
            let err = normalize_viewer_url(raw).unwrap_err();
            assert_eq!(err.kind(), "invalid_viewer_url", "{raw}");
        }
        assert_eq!(
            normalize_viewer_url(" https://media.example.com/viewer/ ").unwrap(),
            "https://media.example.com/viewer"
        );
    }

    #[test]
    fn unreadable_and_unparseable_files() {
        let err = ConfigSource::new(Some("/nonexistent/mediaviewer.toml".into()), Default::default())
            .load()
            .unwrap_err();
        assert_eq!(err.kind(), "config_read");

        let file = write_config("media_viewer_url = ");
        let err = ConfigSource::new(Some(file.path().to_path_buf()), Default::default())
            .load()
            .unwrap_err();
        assert_eq!(err.kind(), "config_parse");

        let file = write_config(r#"mode = "both""#);
        let err = ConfigSource::new(Some(file.path().to_path_buf()), Default::default())
            .load()
            .unwrap_err();
        assert_eq!(err.kind(), "config_parse");
    }

    #[test]
    fn mode_parses_from_cli_strings() {
        assert_eq!("passthrough".parse::<ForwardMode>().unwrap(), ForwardMode::Passthrough);
        assert_eq!("Self-Encrypt".parse::<ForwardMode>().unwrap(), ForwardMode::SelfEncrypt);
        assert_eq!(
            "both".parse::<ForwardMode>().unwrap_err(),
            ConfigError::InvalidMode("both".to_string())
        );
        assert_eq!(ForwardMode::Passthrough.to_string(), "passthrough");
    }
}
