use std::time::Duration;
use tracing::Level;
use unichat_core::protocol::Language;
use url::Url;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub backend_url: String,
    pub vision_url: String,
    pub language: Language,
    pub typewriter_speed: Duration,
    pub idle_timeout: Option<Duration>,
    pub log_level: Level,
}

/// Values given on the command line, which win over the environment.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub backend_url: Option<String>,
    pub language: Option<Language>,
    pub speed_ms: Option<u64>,
}

fn validate_url(var: &str, value: &str) -> Result<String, ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(value.trim_end_matches('/').to_string()),
        other => Err(ConfigError::InvalidValue(
            var.to_string(),
            format!("unsupported scheme '{}'", other),
        )),
    }
}

fn parse_u64(var: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let backend_url_str =
            std::env::var("BACKEND_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
        let backend_url = validate_url("BACKEND_URL", &backend_url_str)?;

        let vision_url = match std::env::var("VISION_URL") {
            Ok(value) => validate_url("VISION_URL", &value)?,
            Err(_) => format!("{}/api/chat", backend_url),
        };

        let language_str = std::env::var("CHAT_LANGUAGE").unwrap_or_else(|_| "vi".to_string());
        let language = language_str
            .parse::<Language>()
            .map_err(|e| ConfigError::InvalidValue("CHAT_LANGUAGE".to_string(), e))?;

        let speed_ms = match std::env::var("TYPEWRITER_SPEED_MS") {
            Ok(value) => parse_u64("TYPEWRITER_SPEED_MS", &value)?,
            Err(_) => 15,
        };
        if speed_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "TYPEWRITER_SPEED_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let idle_secs = match std::env::var("STREAM_IDLE_TIMEOUT_SECS") {
            Ok(value) => parse_u64("STREAM_IDLE_TIMEOUT_SECS", &value)?,
            Err(_) => 120,
        };
        let idle_timeout = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            backend_url,
            vision_url,
            language,
            typewriter_speed: Duration::from_millis(speed_ms),
            idle_timeout,
            log_level,
        })
    }

    /// Applies command-line values on top of the environment.
    ///
    /// A new backend URL also moves the vision endpoint unless `VISION_URL` set it explicitly.
    pub fn with_overrides(mut self, overrides: Overrides) -> Result<Self, ConfigError> {
        if let Some(url) = overrides.backend_url {
            let default_vision = format!("{}/api/chat", self.backend_url);
            self.backend_url = validate_url("--backend-url", &url)?;
            if self.vision_url == default_vision {
                self.vision_url = format!("{}/api/chat", self.backend_url);
            }
        }
        if let Some(language) = overrides.language {
            self.language = language;
        }
        if let Some(ms) = overrides.speed_ms {
            if ms == 0 {
                return Err(ConfigError::InvalidValue(
                    "--speed-ms".to_string(),
                    "must be greater than zero".to_string(),
                ));
            }
            self.typewriter_speed = Duration::from_millis(ms);
        }
        Ok(self)
    }
}
