// Environment configuration. Everything the bridge needs comes from the
// process environment, with a `.env` file loaded first by `server::run()`.
// Variable names follow the deployment contract: MQTT_* for the broker
// side, MONGODB_* for the store side, HTTP_* / CORS_* for the query API.
use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be set")]
    Missing { name: &'static str },
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    /// Username and password. Authentication is only enabled when both are
    /// configured.
    pub credentials: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    pub collection_prefix: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind_addr: String,
    pub cors_origin: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub mongo: MongoConfig,
    pub http: HttpConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let broker = env_or("MQTT_BROKER", "localhost:1883");
        let (host, port) = parse_broker(&broker)?;

        let credentials = match (env::var("MQTT_USER").ok(), env::var("MQTT_PASSWORD").ok()) {
            (Some(user), Some(password)) => Some((user, password)),
            (None, None) => None,
            _ => {
                // Warn but continue unauthenticated if only one is set.
                tracing::warn!(
                    "MQTT credentials incomplete: both MQTT_USER and MQTT_PASSWORD must be set to enable auth"
                );
                None
            }
        };

        Ok(Self {
            mqtt: MqttConfig {
                host,
                port,
                client_id: env_or("MQTT_CLIENT_ID", "mqtt-mongodb-bridge"),
                topic: required("MQTT_TOPIC")?,
                credentials,
            },
            mongo: MongoConfig {
                uri: env_or("MONGODB_HOST", "mongodb://localhost:27017"),
                database: required("MONGODB_DATABASE")?,
                collection_prefix: env::var("MONGODB_COLLECTION_PREFIX").unwrap_or_default(),
            },
            http: HttpConfig {
                bind_addr: env_or("HTTP_BIND_ADDR", "0.0.0.0:3000"),
                cors_origin: env_or("CORS_ALLOWED_ORIGIN", "http://localhost:5173"),
            },
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing { name })
}

/// Parse `MQTT_BROKER` into host and port. Accepts a bare hostname, a
/// `host:port` pair, and `tcp://` / `mqtt://` URLs; the port defaults
/// to 1883.
fn parse_broker(value: &str) -> Result<(String, u16), ConfigError> {
    let rest = value
        .strip_prefix("tcp://")
        .or_else(|| value.strip_prefix("mqtt://"))
        .unwrap_or(value);

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (rest, None),
    };

    if host.is_empty() {
        return Err(ConfigError::Invalid {
            name: "MQTT_BROKER",
            reason: format!("missing broker host in {value:?}"),
        });
    }

    let port = match port {
        Some(raw) => raw.trim().parse::<u16>().map_err(|e| ConfigError::Invalid {
            name: "MQTT_BROKER",
            reason: format!("expected a port number, got {raw:?}: {e}"),
        })?,
        None => 1883,
    };

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_host_only_defaults_port() {
        assert_eq!(
            parse_broker("localhost").unwrap(),
            ("localhost".to_string(), 1883)
        );
    }

    #[test]
    fn broker_host_and_port() {
        assert_eq!(
            parse_broker("broker.lan:8883").unwrap(),
            ("broker.lan".to_string(), 8883)
        );
    }

    #[test]
    fn broker_url_schemes_are_stripped() {
        assert_eq!(
            parse_broker("tcp://10.0.0.2:1883").unwrap(),
            ("10.0.0.2".to_string(), 1883)
        );
        assert_eq!(
            parse_broker("mqtt://broker.lan").unwrap(),
            ("broker.lan".to_string(), 1883)
        );
    }

    #[test]
    fn broker_rejects_bad_input() {
        assert!(parse_broker("").is_err());
        assert!(parse_broker(":1883").is_err());
        assert!(parse_broker("broker.lan:notaport").is_err());
        assert!(parse_broker("broker.lan:").is_err());
    }
}
