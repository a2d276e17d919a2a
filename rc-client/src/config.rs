use remote_config::config::Config as RemoteConfig;
use serde::Deserialize;
use std::fs::File;

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub logging: Option<LoggingConfig>,
    pub metrics: Option<MetricsConfig>,
    pub remote_config: RemoteConfig,
    /// Products subscribed with a handler that logs every change.
    #[serde(default)]
    pub products: Vec<String>,
    /// Capability bits advertised to the agent.
    #[serde(default)]
    pub capabilities: Vec<u32>,
    /// Product whose configurations are merged by scope priority.
    pub lib_config_product: Option<String>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            logging:
                sentry_dsn: https://public@sentry.example.com/1
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            remote_config:
                url: http://datadog-agent:8126
                poll_interval_secs: 1.5
                service: checkout
                env: prod
            products:
                - ASM_FEATURES
                - ASM_DD
            capabilities: [1, 2]
            lib_config_product: APM_TRACING
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(
            config.logging.expect("logging config").sentry_dsn,
            "https://public@sentry.example.com/1"
        );
        assert_eq!(config.metrics.expect("metrics config").statsd_port, 8125);
        assert_eq!(config.remote_config.service, "checkout");
        assert_eq!(
            config.remote_config.url.host_str(),
            Some("datadog-agent")
        );
        assert_eq!(config.products, vec!["ASM_FEATURES", "ASM_DD"]);
        assert_eq!(config.capabilities, vec![1, 2]);
        assert_eq!(config.lib_config_product.as_deref(), Some("APM_TRACING"));
    }

    #[test]
    fn minimal_config() {
        let tmp = write_tmp_file("remote_config:\n    service: checkout\n");
        let config = Config::from_file(tmp.path()).expect("load config");

        assert!(config.logging.is_none());
        assert!(config.metrics.is_none());
        assert!(config.products.is_empty());
        assert!(config.remote_config.validate().is_ok());
    }

    #[test]
    fn config_errors() {
        let tmp = write_tmp_file("products: [ASM_FEATURES]\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));

        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/rc-client.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
