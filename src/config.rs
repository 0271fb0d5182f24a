use serde::Deserialize;
use anyhow::Result;
use http::Uri;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use crate::scheduler::StopCondition;
use crate::transport::{TcpDialer, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE, DEFAULT_TLS_HANDSHAKE_TIMEOUT};

const DEFAULT_CONFIG_FILE: &str = "probe.json";
const DEFAULT_ITERATIONS: u64 = 10;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProbeConfig {
    #[serde(default = "default_target_url")]
    pub target_url: String,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    // At most one of these may be set; neither means the default iteration count.
    #[serde(default)]
    pub iterations: Option<u64>,
    #[serde(default)]
    pub run_duration_ms: Option<u64>,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default = "default_tls_handshake_timeout_ms")]
    pub tls_handshake_timeout_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

fn default_target_url() -> String {
    "https://gitlab.com".to_string()
}

fn default_probe_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

fn default_keep_alive_ms() -> u64 {
    DEFAULT_KEEP_ALIVE.as_millis() as u64
}

fn default_tls_handshake_timeout_ms() -> u64 {
    DEFAULT_TLS_HANDSHAKE_TIMEOUT.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target_url: default_target_url(),
            probe_interval_ms: default_probe_interval_ms(),
            iterations: None,
            run_duration_ms: None,
            dial_timeout_ms: default_dial_timeout_ms(),
            keep_alive_ms: default_keep_alive_ms(),
            tls_handshake_timeout_ms: default_tls_handshake_timeout_ms(),
            log_level: default_log_level(),
            metrics_addr: None,
        }
    }
}

impl ProbeConfig {
    /// Load from the file named by `PROBE_CONFIG`, falling back to
    /// `probe.json`. Built-in defaults apply only when neither is present.
    pub async fn load() -> Result<Self> {
        match std::env::var("PROBE_CONFIG") {
            Ok(path) => {
                println!("Loading config from {}", path);
                Self::load_file(&path).await
            }
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                println!("Loading config from {}", DEFAULT_CONFIG_FILE);
                Self::load_file(DEFAULT_CONFIG_FILE).await
            }
            Err(_) => {
                println!("No config file found, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub async fn load_file(file_path: &str) -> Result<Self> {
        if !Path::new(file_path).exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", file_path));
        }

        let content = fs::read_to_string(file_path).await?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: ProbeConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_log_level()?;
        self.target_uri()?;
        self.stop_condition()?;
        if self.run_duration_ms.is_some() && self.probe_interval_ms == 0 {
            return Err(anyhow::anyhow!("probe_interval_ms must be non-zero when run_duration_ms is set"));
        }
        Ok(())
    }

    /// Get the log level as a tracing::Level
    pub fn get_tracing_level(&self) -> Result<tracing::Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(tracing::Level::TRACE),
            "debug" => Ok(tracing::Level::DEBUG),
            "info" => Ok(tracing::Level::INFO),
            "warn" | "warning" => Ok(tracing::Level::WARN),
            "error" => Ok(tracing::Level::ERROR),
            _ => Err(anyhow::anyhow!("Invalid log level: {}. Valid levels are: trace, debug, info, warn, error", self.log_level))
        }
    }

    /// Validate the log level is one of the supported values
    pub fn validate_log_level(&self) -> Result<()> {
        self.get_tracing_level().map(|_| ())
    }

    pub fn target_uri(&self) -> Result<Uri> {
        let uri: Uri = self.target_url.parse()
            .map_err(|e| anyhow::anyhow!("Invalid target_url {}: {}", self.target_url, e))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Err(anyhow::anyhow!("target_url must use http or https: {}", self.target_url)),
        }
        if uri.host().is_none() {
            return Err(anyhow::anyhow!("target_url has no host: {}", self.target_url));
        }
        Ok(uri)
    }

    pub fn stop_condition(&self) -> Result<StopCondition> {
        match (self.iterations, self.run_duration_ms) {
            (Some(_), Some(_)) => Err(anyhow::anyhow!("Set either iterations or run_duration_ms, not both")),
            (Some(n), None) => Ok(StopCondition::Iterations(n)),
            (None, Some(ms)) => Ok(StopCondition::Elapsed(Duration::from_millis(ms))),
            (None, None) => Ok(StopCondition::Iterations(DEFAULT_ITERATIONS)),
        }
    }

    pub fn dialer(&self) -> TcpDialer {
        TcpDialer {
            connect_timeout: Duration::from_millis(self.dial_timeout_ms),
            keep_alive: Duration::from_millis(self.keep_alive_ms),
        }
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_source_defaults() {
        let config = ProbeConfig::from_json("{}").unwrap();
        assert_eq!(config, ProbeConfig::default());
        assert_eq!(config.target_url, "https://gitlab.com");
        assert_eq!(config.probe_interval_ms, 300_000);
        assert_eq!(config.stop_condition().unwrap(), StopCondition::Iterations(10));

        let dialer = config.dialer();
        assert_eq!(dialer.connect_timeout, Duration::from_secs(30));
        assert_eq!(dialer.keep_alive, Duration::from_secs(30));
        assert_eq!(config.tls_handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_run_duration_selects_time_window() {
        let config = ProbeConfig::from_json(r#"{
            "target_url": "http://127.0.0.1:8080/health",
            "probe_interval_ms": 5000,
            "run_duration_ms": 3600000,
            "metrics_addr": "0.0.0.0:9100"
        }"#).unwrap();

        assert_eq!(config.stop_condition().unwrap(), StopCondition::Elapsed(Duration::from_secs(3600)));
        assert_eq!(config.metrics_addr, Some(([0, 0, 0, 0], 9100).into()));
        assert_eq!(config.target_uri().unwrap().port_u16(), Some(8080));
    }

    #[test]
    fn test_iterations_alone_bound_the_run() {
        let config = ProbeConfig::from_json(r#"{"iterations": 3, "probe_interval_ms": 0}"#).unwrap();
        assert_eq!(config.stop_condition().unwrap(), StopCondition::Iterations(3));
    }

    #[test]
    fn test_both_stop_bounds_rejected() {
        let err = ProbeConfig::from_json(r#"{"iterations": 3, "run_duration_ms": 1000}"#).unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ProbeConfig::from_json(r#"{"log_level": "loud"}"#).is_err());
        assert!(ProbeConfig::from_json(r#"{"target_url": "ftp://example.com"}"#).is_err());
        assert!(ProbeConfig::from_json(r#"{"target_url": "/just/a/path"}"#).is_err());
        assert!(ProbeConfig::from_json(r#"{"probe_interval_ms": 0, "run_duration_ms": 1000}"#).is_err());
    }

    #[tokio::test]
    async fn test_missing_named_file_is_an_error() {
        assert!(ProbeConfig::load_file("/nonexistent/probe.json").await.is_err());
    }
}
