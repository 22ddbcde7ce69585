use crate::{ConfigError, FromEnv};
use std::env;

/// Redis connection configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl FromEnv for RedisConfig {
    /// Reads `REDIS_URL`, falling back to `REDIS_HOST`.
    ///
    /// `REDIS_HOST` may be a full URL or a bare `host[:port]`.
    fn from_env() -> Result<Self, ConfigError> {
        if let Ok(url) = env::var("REDIS_URL") {
            return Ok(Self::new(url));
        }

        match env::var("REDIS_HOST") {
            Ok(host) if host.starts_with("redis://") || host.starts_with("rediss://") => {
                Ok(Self::new(host))
            }
            Ok(host) if host.contains(':') => Ok(Self::new(format!("redis://{}", host))),
            Ok(host) => Ok(Self::new(format!("redis://{}:6379", host))),
            Err(_) => Err(ConfigError::MissingEnvVar("REDIS_URL".to_string())),
        }
    }
}
