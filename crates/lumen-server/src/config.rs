use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use lumen_subscriptions::EngineSettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Engine-wide subscription settings, fixed at startup
    #[serde(default)]
    pub engine: EngineSettings,
    /// Tenants to provision at startup; empty provisions `default`
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl AppConfig {
    /// Load from `lumen.toml` (optional) overlaid with `LUMEN__*`
    /// environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("lumen").required(false))
            .add_source(config::Environment::with_prefix("LUMEN").separator("__"))
            .build()?;
        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        let level = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&level.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        self.engine.validate().map_err(|e| format!("engine: {e}"))?;
        for tenant in &self.tenants {
            if tenant.id.is_empty() {
                return Err("tenant id must not be empty".into());
            }
            if tenant.recognized_content_types.is_empty() {
                return Err(format!(
                    "tenant '{}' must recognize at least one content type",
                    tenant.id
                ));
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Tenants to provision; defaults to a single `default` tenant.
    pub fn effective_tenants(&self) -> Vec<TenantConfig> {
        if self.tenants.is_empty() {
            vec![TenantConfig::default()]
        } else {
            self.tenants.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL used in links; defaults to http://{host}:{port}
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_content_types")]
    pub recognized_content_types: Vec<String>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            base_url: None,
            recognized_content_types: default_content_types(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8090
}
fn default_log_level() -> String {
    "info".into()
}
fn default_content_types() -> Vec<String> {
    vec![
        "application/fhir+json".to_string(),
        "application/json".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.effective_tenants().len(), 1);
        assert_eq!(config.effective_tenants()[0].id, "default");
    }

    #[test]
    fn test_parse_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [logging]
            level = "debug"

            [engine]
            retry_limit = 3
            dispatcher_workers = 4

            [[tenants]]
            id = "hospital-a"

            [[tenants]]
            id = "hospital-b"
            recognized_content_types = ["application/fhir+json"]
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.engine.retry_limit, 3);
        assert_eq!(config.tenants.len(), 2);
        assert_eq!(config.tenants[0].id, "hospital-a");
        assert_eq!(
            config.tenants[1].recognized_content_types,
            vec!["application/fhir+json"]
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tenants.push(TenantConfig {
            id: String::new(),
            base_url: None,
            recognized_content_types: default_content_types(),
        });
        assert!(config.validate().is_err());
    }
}
