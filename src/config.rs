use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ProxyError;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "MQTT_PROXY_CONFIG";
/// Prefix for per-field environment overrides, e.g. `MQTT_PROXY_TLS__ENABLED`.
pub const ENV_PREFIX: &str = "MQTT_PROXY";

/// Settings shared by every MQTT component, not just the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Tenant that client topics are resolved under
    pub default_tenant: String,
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    /// Largest MQTT frame accepted on either leg, in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    /// Service URL of the broker cluster, e.g. `mqtt://broker:1883`
    pub broker_service_url: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_proxy_port")]
    pub mqtt_proxy_port: u16,
    #[serde(default)]
    pub tls: TlsListenerConfig,
    #[serde(default)]
    pub tls_psk: PskListenerConfig,
    #[serde(default = "default_acceptor_threads")]
    pub num_acceptor_threads: usize,
    #[serde(default = "default_io_threads")]
    pub num_io_threads: usize,
    /// Maximum number of lookup requests allowed at once, queued or running
    #[serde(default = "default_max_lookup_request")]
    pub max_lookup_request: usize,
    /// Number of lookup requests that may run concurrently
    #[serde(default = "default_concurrent_lookup_request")]
    pub concurrent_lookup_request: usize,
    #[serde(default)]
    pub system_event_enabled: bool,
    /// Upper bound between a client's CONNECT and the broker's CONNACK; 0 disables
    #[serde(default = "default_handshake_timeout_ms")]
    pub broker_handshake_timeout_ms: u64,
    /// Frames buffered per leg before the other leg stops being read
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsListenerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tls_port")]
    pub port: u16,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PskListenerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tls_psk_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_hint: Option<String>,
}

impl Default for TlsListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_tls_port(),
            cert_path: None,
            key_path: None,
        }
    }
}

impl Default for PskListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_tls_psk_port(),
            identity_hint: None,
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_max_frame_size() -> usize {
    8092
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    1883
}

fn default_tls_port() -> u16 {
    8883
}

fn default_tls_psk_port() -> u16 {
    8884
}

fn default_acceptor_threads() -> usize {
    1
}

fn default_io_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

fn default_max_lookup_request() -> usize {
    50000
}

fn default_concurrent_lookup_request() -> usize {
    5000
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_shutdown_timeout_ms() -> u64 {
    15_000
}

impl ProxyConfig {
    /// Configuration with every optional field at its default.
    pub fn new(broker_service_url: impl Into<String>, default_tenant: impl Into<String>) -> Self {
        Self {
            common: CommonConfig {
                default_tenant: default_tenant.into(),
                default_namespace: default_namespace(),
                max_frame_size: default_max_frame_size(),
            },
            broker_service_url: broker_service_url.into(),
            bind_address: default_bind_address(),
            mqtt_proxy_port: default_proxy_port(),
            tls: TlsListenerConfig::default(),
            tls_psk: PskListenerConfig::default(),
            num_acceptor_threads: default_acceptor_threads(),
            num_io_threads: default_io_threads(),
            max_lookup_request: default_max_lookup_request(),
            concurrent_lookup_request: default_concurrent_lookup_request(),
            system_event_enabled: false,
            broker_handshake_timeout_ms: default_handshake_timeout_ms(),
            channel_capacity: default_channel_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var(CONFIG_PATH_ENV)
            .unwrap_or_else(|_| "./config/proxy.toml".to_string());

        Self::from_file(&config_path)
    }

    /// Load a TOML file, then apply `MQTT_PROXY_*` environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config file: {}", path))?;

        settings
            .try_deserialize()
            .with_context(|| "Failed to parse proxy configuration")
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).with_context(|| "Failed to parse TOML configuration")
    }

    /// Check the invariants the service relies on.
    pub fn validate(&self) -> Result<(), ProxyError> {
        let invalid = |msg: &str| Err(ProxyError::Configuration(msg.to_string()));

        if self.mqtt_proxy_port == 0 {
            return invalid("mqtt_proxy_port must be greater than 0");
        }
        if self.broker_service_url.trim().is_empty() {
            return invalid("broker_service_url is required");
        }
        if self.common.default_tenant.trim().is_empty() {
            return invalid("default_tenant is required");
        }
        if self.common.max_frame_size == 0 {
            return invalid("max_frame_size must be greater than 0");
        }
        if self.num_acceptor_threads == 0 || self.num_io_threads == 0 {
            return invalid("thread pool sizes must be greater than 0");
        }
        if self.max_lookup_request == 0 || self.concurrent_lookup_request == 0 {
            return invalid("lookup request limits must be greater than 0");
        }
        if self.concurrent_lookup_request > self.max_lookup_request {
            return invalid("concurrent_lookup_request cannot exceed max_lookup_request");
        }
        if self.tls.enabled {
            if self.tls.port == 0 {
                return invalid("tls.port must be greater than 0");
            }
            if self.tls.cert_path.is_none() || self.tls.key_path.is_none() {
                return invalid("tls.cert_path and tls.key_path are required when TLS is enabled");
            }
        }
        if self.tls_psk.enabled && self.tls_psk.port == 0 {
            return invalid("tls_psk.port must be greater than 0");
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.broker_handshake_timeout_ms > 0)
            .then(|| Duration::from_millis(self.broker_handshake_timeout_ms))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn max_frame_size(&self) -> usize {
        self.common.max_frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        broker_service_url = "mqtt://broker:1883"
        default_tenant = "public"
    "#;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.mqtt_proxy_port, 1883);
        assert_eq!(config.common.default_namespace, "default");
        assert_eq!(config.max_lookup_request, 50000);
        assert_eq!(config.concurrent_lookup_request, 5000);
        assert!(!config.system_event_enabled);
        assert!(!config.tls.enabled);
        assert!(!config.tls_psk.enabled);
        assert_eq!(config.tls.port, 8883);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_required_field() {
        assert!(ProxyConfig::from_toml_str(r#"default_tenant = "public""#).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let base = ProxyConfig::new("mqtt://broker:1883", "public");

        let mut config = base.clone();
        config.mqtt_proxy_port = 0;
        assert!(matches!(config.validate(), Err(ProxyError::Configuration(_))));

        let mut config = base.clone();
        config.broker_service_url = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.common.default_tenant = String::new();
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.concurrent_lookup_request = config.max_lookup_request + 1;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.tls.enabled = true;
        assert!(config.validate().is_err());
        config.tls.cert_path = Some("cert.pem".into());
        config.tls.key_path = Some("key.pem".into());
        assert!(config.validate().is_ok());

        let mut config = base;
        config.broker_handshake_timeout_ms = 0;
        assert_eq!(config.handshake_timeout(), None);
    }

    #[test]
    fn test_from_file_with_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
            broker_service_url = "mqtt://broker:1883"
            default_tenant = "public"
            mqtt_proxy_port = 1884

            [tls]
            enabled = true
            port = 8885
            cert_path = "/etc/proxy/cert.pem"
            key_path = "/etc/proxy/key.pem"
            "#
        )
        .unwrap();

        std::env::set_var("MQTT_PROXY_SYSTEM_EVENT_ENABLED", "true");
        let config = ProxyConfig::from_file(file.path().to_str().unwrap());
        std::env::remove_var("MQTT_PROXY_SYSTEM_EVENT_ENABLED");

        let config = config.unwrap();
        assert_eq!(config.mqtt_proxy_port, 1884);
        assert!(config.tls.enabled);
        assert_eq!(config.tls.port, 8885);
        assert!(config.system_event_enabled);
        assert!(config.validate().is_ok());
    }
}
