use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broker address; fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Password or token; never rendered by `Debug` or `Display`
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub secret: Option<Secret>,
}

impl fmt::Display for Credentials {
    /// Renders as "user" only
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.username)
    }
}

/// Client-side knobs of a broker session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub ca_file: Option<PathBuf>,
    pub request_capacity: usize,
    pub ack_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_id: "facility-bridge".to_string(),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            ca_file: None,
            request_capacity: 10,
            ack_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_redacted() {
        let creds = Credentials {
            username: "facility_client".into(),
            secret: Some(Secret::new("hunter2")),
        };
        let rendered = format!("{:?} {}", creds, creds);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("facility_client"));
    }

    #[test]
    fn endpoint_display_reflects_tls() {
        let mut endpoint = BrokerEndpoint {
            host: "broker.local".into(),
            port: 8883,
            tls: true,
        };
        assert_eq!(endpoint.to_string(), "mqtts://broker.local:8883");
        endpoint.tls = false;
        endpoint.port = 1883;
        assert_eq!(endpoint.to_string(), "mqtt://broker.local:1883");
    }
}
