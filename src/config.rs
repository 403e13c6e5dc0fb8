use crate::error::{Error, Result};
use crate::throttle::MaxStartups;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

pub const MIN_AUTH_TIMEOUT: u64 = 1;
pub const MAX_AUTH_TIMEOUT: u64 = 900;
pub const DEFAULT_AUTH_TIMEOUT: u64 = 30;
pub const DEFAULT_RESPONSE_TIMEOUT: u64 = 15;
pub const DEFAULT_SERVICE_IDLE: u64 = 15;
pub const DEFAULT_PROCESS_IDLE: u64 = 90;

/// Compiled-in login helper, used when a scheme section has no `command`.
pub const DEFAULT_LOGIN_COMMAND: &str = "/usr/libexec/authgate-session";
pub const DEFAULT_SSH_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(rename = "WebService", default)]
    pub web_service: WebServiceConfig,
    /// Per-scheme sections, keyed by lowercase scheme name.
    #[serde(flatten)]
    pub schemes: HashMap<String, SchemeConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebServiceConfig {
    #[serde(rename = "MaxStartups")]
    pub max_startups: Option<String>,
    /// Seconds before an idle session is reaped.
    #[serde(rename = "ServiceIdle")]
    pub service_idle: Option<String>,
    /// Seconds of empty tables before the broker signals `idling`.
    #[serde(rename = "ProcessIdle")]
    pub process_idle: Option<String>,
    #[serde(rename = "LogLevel")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SchemeConfig {
    pub command: Option<String>,
    pub action: Option<String>,
    pub timeout: Option<String>,
    #[serde(rename = "response-timeout")]
    pub response_timeout: Option<String>,
    pub host: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file. If `path_opt` is None or the
    /// file is missing/unreadable, returns defaults. Parsing errors are
    /// returned.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("authgate.toml");
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(cfg) => Ok(cfg),
                Err(e) => Err(Error::Internal(format!("Failed to parse {}: {}", path, e))),
            },
            Err(_e) => Ok(Self::default()),
        }
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    pub fn with_overrides(mut self, max_startups: Option<String>) -> Self {
        if let Some(ms) = max_startups {
            self.web_service.max_startups = Some(ms);
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for (scheme, section) in &self.schemes {
            if let Some(command) = &section.command {
                if command.trim().is_empty() {
                    return Err(Error::Internal(format!(
                        "[{}] command cannot be empty",
                        scheme
                    )));
                }
            }
            if scheme != &scheme.to_ascii_lowercase() {
                return Err(Error::Internal(format!(
                    "scheme section [{}] must be lowercase",
                    scheme
                )));
            }
        }
        Ok(())
    }

    pub fn scheme(&self, scheme: &str) -> Option<&SchemeConfig> {
        self.schemes.get(scheme)
    }

    /// The login helper argv for a scheme: the configured `command`
    /// whitespace-split, or the compiled-in default.
    pub fn login_command(&self, scheme: &str) -> Vec<String> {
        let command = self
            .scheme(scheme)
            .and_then(|s| s.command.as_deref())
            .unwrap_or(DEFAULT_LOGIN_COMMAND);
        command.split_whitespace().map(str::to_string).collect()
    }

    /// `(conversation, idle)` timeouts for a scheme's auth pipe.
    pub fn auth_timeouts(&self, scheme: &str) -> (Duration, Duration) {
        let section = self.scheme(scheme);
        let conversation = parse_timeout(
            section.and_then(|s| s.timeout.as_deref()),
            DEFAULT_AUTH_TIMEOUT,
        );
        let idle = parse_timeout(
            section.and_then(|s| s.response_timeout.as_deref()),
            DEFAULT_RESPONSE_TIMEOUT,
        );
        (Duration::from_secs(conversation), Duration::from_secs(idle))
    }

    pub fn ssh_host(&self, scheme: &str) -> String {
        self.scheme(scheme)
            .and_then(|s| s.host.clone())
            .unwrap_or_else(|| DEFAULT_SSH_HOST.to_string())
    }

    pub fn max_startups(&self) -> MaxStartups {
        match self.web_service.max_startups.as_deref() {
            Some(spec) => MaxStartups::parse(spec),
            None => MaxStartups::default(),
        }
    }

    pub fn service_idle(&self) -> Duration {
        Duration::from_secs(parse_idle(
            self.web_service.service_idle.as_deref(),
            DEFAULT_SERVICE_IDLE,
        ))
    }

    pub fn process_idle(&self) -> Duration {
        Duration::from_secs(parse_idle(
            self.web_service.process_idle.as_deref(),
            DEFAULT_PROCESS_IDLE,
        ))
    }
}

/// Parse a configured timeout in whole seconds, clamped to
/// `[MIN_AUTH_TIMEOUT, MAX_AUTH_TIMEOUT]`. Negative or non-numeric values
/// revert to the default with a warning.
pub fn parse_timeout(value: Option<&str>, default_secs: u64) -> u64 {
    let Some(raw) = value else {
        return default_secs;
    };
    match raw.trim().parse::<i64>() {
        Ok(v) if v >= 0 => (v as u64).clamp(MIN_AUTH_TIMEOUT, MAX_AUTH_TIMEOUT),
        _ => {
            tracing::warn!(value = raw, "invalid timeout, using default");
            default_secs
        }
    }
}

fn parse_idle(value: Option<&str>, default_secs: u64) -> u64 {
    let Some(raw) = value else {
        return default_secs;
    };
    match raw.trim().parse::<u64>() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(value = raw, "invalid idle interval, using default");
            default_secs
        }
    }
}
