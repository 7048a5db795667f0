//! Bridge configuration
//!
//! Loaded from a TOML file (by default `~/.config/facility-bridge/bridge.toml`), then
//! adjusted by the environment and command line flags, then validated. The broker secret
//! should come from `FACILITY_BRIDGE_SECRET` rather than the file.
//!
//! ```toml
//! dataset = "outputs/dataset.csv"
//! topic = "facility/office/sensors"
//! interval_ms = 1000
//! qos = "at_least_once"
//!
//! [broker]
//! host = "broker.example.com"
//! port = 8883
//! tls = true
//!
//! [credentials]
//! username = "facility_client"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::{debug, warn, Level};

use crate::error::BridgeError;
use crate::mqtt::config::{BrokerEndpoint, Credentials, Secret, SessionOptions};
use crate::mqtt::message::QualityOfService;
use crate::publisher::PublishSettings;

const CONFIG_DIR: &str = ".config/facility-bridge";
const CONFIG_FILE: &str = "bridge.toml";
pub const SECRET_ENV: &str = "FACILITY_BRIDGE_SECRET";

/// Command line flags; each one overrides its configuration file counterpart
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "facility-bridge", version, about = "Replays a telemetry dataset to an MQTT broker")]
pub struct BridgeArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Dataset CSV to stream
    #[arg(short, long)]
    pub dataset: Option<PathBuf>,

    /// Topic to publish on
    #[arg(short, long)]
    pub topic: Option<String>,

    /// Pause between rows in milliseconds
    #[arg(short, long)]
    pub interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Load and encode every row without connecting
    #[arg(long)]
    pub dry_run: bool,

    /// First row to stream
    #[arg(long, default_value_t = 0)]
    pub start_row: usize,

    /// Maximum number of rows to stream
    #[arg(long)]
    pub limit: Option<usize>,
}

impl BridgeArgs {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(BridgeConfig::default_path)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            start_row: self.start_row,
            limit: self.limit,
        }
    }
}

/// Per-invocation choices that are not part of the persisted configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub dry_run: bool,
    pub start_row: usize,
    pub limit: Option<usize>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub ca_file: Option<PathBuf>,
    pub request_capacity: usize,
    pub connect_timeout_secs: u64,
    pub ack_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            tls: true,
            client_id: "facility-bridge".to_string(),
            keep_alive_secs: 60,
            clean_session: true,
            ca_file: None,
            request_capacity: 10,
            connect_timeout_secs: 10,
            ack_timeout_secs: 10,
        }
    }
}

impl BrokerConfig {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            tls: self.tls,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            clean_session: self.clean_session,
            ca_file: self.ca_file.clone(),
            request_capacity: self.request_capacity,
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<Level, BridgeError> {
        self.level
            .parse()
            .map_err(|_| BridgeError::validation(format!("unknown log level '{}'", self.level)))
    }
}

fn default_dataset() -> PathBuf {
    PathBuf::from("outputs/dataset.csv")
}

fn default_topic() -> String {
    "facility/office/sensors".to_string()
}

fn default_interval_ms() -> u64 {
    1000
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct BridgeConfig {
    #[serde(default = "default_dataset")]
    pub dataset: PathBuf,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub qos: QualityOfService,
    pub broker: BrokerConfig,
    pub credentials: Credentials,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| {
            warn!("Could not determine home directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml(content: &str) -> Result<Self, BridgeError> {
        Ok(toml::from_str(content)?)
    }

    /// Reads the file and applies the environment; does not validate
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();

        if !tokio::fs::try_exists(path).await? {
            return Err(BridgeError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = tokio::fs::read_to_string(path).await?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env(|key| std::env::var(key).ok());
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Takes the secret from `lookup(SECRET_ENV)` when present
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(SECRET_ENV).filter(|s| !s.is_empty()) {
            if self.credentials.secret.is_some() {
                debug!("{} overrides the secret from the configuration file", SECRET_ENV);
            }
            self.credentials.secret = Some(Secret::new(secret));
        }
    }

    pub fn apply_args(&mut self, args: &BridgeArgs) {
        if let Some(dataset) = &args.dataset {
            self.dataset = dataset.clone();
        }
        if let Some(topic) = &args.topic {
            self.topic = topic.clone();
        }
        if let Some(interval_ms) = args.interval_ms {
            self.interval_ms = interval_ms;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.broker.host.trim().is_empty() {
            return Err(BridgeError::validation("broker.host must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(BridgeError::validation("broker.port must not be 0"));
        }
        if self.broker.keep_alive_secs == 0 {
            return Err(BridgeError::validation("broker.keep_alive_secs must be at least 1"));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(BridgeError::validation("broker.connect_timeout_secs must be at least 1"));
        }
        if self.broker.ack_timeout_secs == 0 {
            return Err(BridgeError::validation("broker.ack_timeout_secs must be at least 1"));
        }
        if self.broker.request_capacity == 0 {
            return Err(BridgeError::validation("broker.request_capacity must be at least 1"));
        }
        if self.topic.is_empty() {
            return Err(BridgeError::validation("topic must not be empty"));
        }
        if self.topic.contains(['+', '#']) {
            return Err(BridgeError::validation(format!(
                "topic '{}' must not contain wildcards",
                self.topic
            )));
        }
        if self.credentials.username.is_empty() {
            return Err(BridgeError::validation("credentials.username must not be empty"));
        }
        if self.credentials.secret.is_none() {
            return Err(BridgeError::validation(format!(
                "no broker secret: set {} or credentials.secret",
                SECRET_ENV
            )));
        }
        self.logging.level()?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn publish_settings(&self) -> PublishSettings {
        PublishSettings {
            topic: self.topic.clone(),
            interval: self.interval(),
            qos: self.qos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [broker]
        host = "broker.example.com"

        [credentials]
        username = "facility_client"
    "#;

    fn minimal() -> BridgeConfig {
        BridgeConfig::from_toml(MINIMAL).unwrap()
    }

    #[test]
    fn defaults_match_the_reference_setup() {
        let config = minimal();
        assert_eq!(config.dataset, PathBuf::from("outputs/dataset.csv"));
        assert_eq!(config.topic, "facility/office/sensors");
        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(config.qos, QualityOfService::AtLeastOnce);
        assert_eq!(config.broker.port, 8883);
        assert!(config.broker.tls);
        assert_eq!(config.broker.session_options().keep_alive, Duration::from_secs(60));
        assert_eq!(config.logging.level().unwrap(), Level::INFO);
    }

    #[test]
    fn parses_every_field() {
        let config = BridgeConfig::from_toml(
            r#"
            dataset = "data/run.csv"
            topic = "plant/line1/sensors"
            interval_ms = 250
            qos = "exactly_once"

            [broker]
            host = "localhost"
            port = 1883
            tls = false
            client_id = "replay-1"
            keep_alive_secs = 5
            clean_session = false
            ca_file = "/etc/ssl/ca.pem"
            request_capacity = 32
            connect_timeout_secs = 3
            ack_timeout_secs = 4

            [credentials]
            username = "u"
            secret = "s"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.qos, QualityOfService::ExactlyOnce);
        assert_eq!(config.broker.endpoint().to_string(), "mqtt://localhost:1883");
        assert_eq!(config.broker.connect_timeout(), Duration::from_secs(3));
        let options = config.broker.session_options();
        assert_eq!(options.client_id, "replay-1");
        assert!(!options.clean_session);
        assert_eq!(options.ack_timeout, Duration::from_secs(4));
        assert_eq!(config.credentials.secret.as_ref().map(Secret::expose), Some("s"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn secret_from_environment_wins() {
        let mut config = minimal();
        assert!(config.validate().is_err());

        config.apply_env(|key| (key == SECRET_ENV).then(|| "from-env".to_string()));
        assert_eq!(config.credentials.secret.as_ref().map(Secret::expose), Some("from-env"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn args_override_file_values() {
        let mut config = minimal();
        let args = BridgeArgs {
            dataset: Some(PathBuf::from("other.csv")),
            topic: Some("a/b".into()),
            interval_ms: Some(10),
            log_level: Some("warn".into()),
            ..Default::default()
        };
        config.apply_args(&args);

        assert_eq!(config.dataset, PathBuf::from("other.csv"));
        assert_eq!(config.publish_settings().topic, "a/b");
        assert_eq!(config.interval(), Duration::from_millis(10));
        assert_eq!(config.logging.level().unwrap(), Level::WARN);
    }

    #[test]
    fn rejects_wildcard_topics_and_empty_host() {
        let mut config = minimal();
        config.apply_env(|_| Some("s".to_string()));

        config.topic = "facility/#".into();
        assert!(matches!(config.validate(), Err(BridgeError::ConfigValidation(_))));

        config.topic = "facility/office/sensors".into();
        config.broker.host = " ".into();
        assert!(matches!(config.validate(), Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut config = minimal();
        config.apply_env(|_| Some("s".to_string()));
        assert!(config.validate().is_ok());

        config.broker.ack_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(BridgeError::ConfigValidation(_))));

        config.broker.ack_timeout_secs = 10;
        config.broker.connect_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn cli_flags_parse() {
        let args = BridgeArgs::parse_from([
            "facility-bridge",
            "--config",
            "/tmp/bridge.toml",
            "--dry-run",
            "--start-row",
            "5",
            "--limit",
            "10",
        ]);
        assert_eq!(args.config_path(), PathBuf::from("/tmp/bridge.toml"));
        assert_eq!(
            args.run_options(),
            RunOptions {
                dry_run: true,
                start_row: 5,
                limit: Some(10),
            }
        );
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let result = BridgeConfig::load("/nonexistent/bridge.toml").await;
        assert!(matches!(result, Err(BridgeError::ConfigNotFound { .. })));
    }

    #[tokio::test]
    async fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        tokio::fs::write(&path, MINIMAL).await.unwrap();

        let config = BridgeConfig::load(&path).await.unwrap();
        assert_eq!(config.broker.host, "broker.example.com");
    }
}
