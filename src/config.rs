//! Server configuration loaded from the environment.
//!
//! Every setting has a default suitable for local development, so a bare
//! `docsync` starts on port 5000 and accepts browser clients from
//! `http://localhost:3000`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_CLIENT_URL: &str = "http://localhost:3000";
/// Maximum accepted request body.
pub const BODY_LIMIT: usize = 10 * 1024 * 1024;

const DEVELOPMENT_JWT_SECRET: &str = "docsync-development-secret";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0} must be set in production")]
    Missing(&'static str),
}

/// Deployment environment, from `NODE_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn is_development(&self) -> bool {
        *self == Self::Development
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// Lifetime of issued bearer tokens.
    pub token_ttl: Duration,
    pub bcrypt_cost: u32,
}

/// Settings for the realtime collaboration channel.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// How often the server pings each connection.
    pub ping_interval: Duration,
    /// How long past a missed ping a silent connection is kept.
    pub ping_timeout: Duration,
    /// Per-room broadcast buffer; slower consumers must re-join.
    pub broadcast_capacity: usize,
    /// Revisions between automatic version snapshots.
    pub snapshot_every: u64,
    /// How often dirty documents are written back to the store.
    pub flush_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(60_000),
            broadcast_capacity: 256,
            snapshot_every: 100,
            flush_interval: Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed browser origin for CORS and the realtime channel.
    pub client_url: String,
    pub environment: Environment,
    /// SQLite file. `None` uses the platform data directory.
    pub database_path: Option<PathBuf>,
    pub auth: AuthConfig,
    pub realtime: RealtimeConfig,
    pub body_limit: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    ///
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = match get("NODE_ENV") {
            Some(value) => Environment::from_str(&value).ok_or(ConfigError::Invalid {
                key: "NODE_ENV",
                value,
            })?,
            None => Environment::Development,
        };

        let jwt_secret = match get("JWT_SECRET") {
            Some(secret) => secret,
            None if environment == Environment::Production => {
                return Err(ConfigError::Missing("JWT_SECRET"))
            }
            None => DEVELOPMENT_JWT_SECRET.to_string(),
        };

        let bcrypt_cost = parse(&get, "BCRYPT_COST", bcrypt::DEFAULT_COST)?;
        if !(4..=31).contains(&bcrypt_cost) {
            return Err(ConfigError::Invalid {
                key: "BCRYPT_COST",
                value: bcrypt_cost.to_string(),
            });
        }

        let token_days: u64 = parse(&get, "JWT_EXPIRES_IN_DAYS", 7)?;
        let token_secs = token_days
            .checked_mul(24 * 60 * 60)
            .ok_or_else(|| ConfigError::Invalid {
                key: "JWT_EXPIRES_IN_DAYS",
                value: token_days.to_string(),
            })?;
        let defaults = RealtimeConfig::default();

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse(&get, "PORT", DEFAULT_PORT)?,
            client_url: get("CLIENT_URL").unwrap_or_else(|| DEFAULT_CLIENT_URL.to_string()),
            environment,
            database_path: get("DATABASE_PATH").map(PathBuf::from),
            auth: AuthConfig {
                jwt_secret,
                token_ttl: Duration::from_secs(token_secs),
                bcrypt_cost,
            },
            realtime: RealtimeConfig {
                ping_interval: parse_millis(&get, "SOCKET_PING_INTERVAL_MS", defaults.ping_interval)?,
                ping_timeout: parse_millis(&get, "SOCKET_PING_TIMEOUT_MS", defaults.ping_timeout)?,
                snapshot_every: parse(&get, "SNAPSHOT_EVERY", defaults.snapshot_every)?.max(1),
                flush_interval: parse_millis(&get, "FLUSH_INTERVAL_MS", defaults.flush_interval)?,
                ..defaults
            },
            body_limit: BODY_LIMIT,
        })
    }

    /// Configuration for tests: cheap password hashing and a fixed secret.
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            client_url: DEFAULT_CLIENT_URL.to_string(),
            environment: Environment::Test,
            database_path: None,
            auth: AuthConfig {
                jwt_secret: "test-secret".to_string(),
                token_ttl: Duration::from_secs(60 * 60),
                bcrypt_cost: 4,
            },
            realtime: RealtimeConfig::default(),
            body_limit: BODY_LIMIT,
        }
    }

    /// True when no `JWT_SECRET` was configured.
    pub fn uses_development_secret(&self) -> bool {
        self.auth.jwt_secret == DEVELOPMENT_JWT_SECRET
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn parse_millis<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let millis: u64 = parse(get, key, default.as_millis() as u64)?;
    if millis == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: millis.to_string(),
        });
    }
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.client_url, "http://localhost:3000");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr(), "0.0.0.0:5000");
        assert_eq!(config.realtime.ping_interval, Duration::from_millis(25_000));
        assert_eq!(config.realtime.ping_timeout, Duration::from_millis(60_000));
        assert_eq!(config.body_limit, 10 * 1024 * 1024);
        assert!(config.uses_development_secret());
    }

    #[test]
    fn reads_port_and_client_url() {
        let config = config_from(&[("PORT", "8080"), ("CLIENT_URL", "https://docs.example.com")])
            .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.client_url, "https://docs.example.com");
    }

    #[test]
    fn empty_values_fall_back_to_defaults() {
        let config = config_from(&[("PORT", ""), ("CLIENT_URL", "  ")]).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.client_url, DEFAULT_CLIENT_URL);
    }

    #[test]
    fn rejects_invalid_port() {
        assert_eq!(
            config_from(&[("PORT", "not-a-port")]).unwrap_err(),
            ConfigError::Invalid {
                key: "PORT",
                value: "not-a-port".to_string()
            }
        );
    }

    #[test]
    fn production_requires_jwt_secret() {
        assert_eq!(
            config_from(&[("NODE_ENV", "production")]).unwrap_err(),
            ConfigError::Missing("JWT_SECRET")
        );

        let config = config_from(&[("NODE_ENV", "production"), ("JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.auth.jwt_secret, "s3cret");
    }

    #[test]
    fn rejects_unknown_environment() {
        assert!(config_from(&[("NODE_ENV", "staging")]).is_err());
    }

    #[test]
    fn rejects_out_of_range_bcrypt_cost() {
        assert!(config_from(&[("BCRYPT_COST", "2")]).is_err());
        assert_eq!(
            config_from(&[("BCRYPT_COST", "5")]).unwrap().auth.bcrypt_cost,
            5
        );
    }

    #[test]
    fn token_lifetime_is_checked() {
        let config = config_from(&[("JWT_EXPIRES_IN_DAYS", "2")]).unwrap();
        assert_eq!(config.auth.token_ttl, Duration::from_secs(2 * 86_400));

        let days = u64::MAX.to_string();
        assert_eq!(
            config_from(&[("JWT_EXPIRES_IN_DAYS", days.as_str())]).unwrap_err(),
            ConfigError::Invalid {
                key: "JWT_EXPIRES_IN_DAYS",
                value: days.clone()
            }
        );
    }

    #[test]
    fn realtime_timings_are_configurable() {
        let config = config_from(&[
            ("SOCKET_PING_INTERVAL_MS", "1000"),
            ("SOCKET_PING_TIMEOUT_MS", "3000"),
            ("SNAPSHOT_EVERY", "0"),
        ])
        .unwrap();
        assert_eq!(config.realtime.ping_interval, Duration::from_secs(1));
        assert_eq!(config.realtime.ping_timeout, Duration::from_secs(3));
        assert_eq!(config.realtime.snapshot_every, 1);
        assert!(config_from(&[("FLUSH_INTERVAL_MS", "0")]).is_err());
    }
}
