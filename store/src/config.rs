//! Storage backend configuration types.

use serde::{Deserialize, Serialize};
use url::Url;

/// Store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process maps; state dies with the process. For tests.
    Memory,
    #[default]
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    // Redis connection URL
    // redis://[:password@]host[:port][/db]
    pub url: String,
    // Connection pool max size
    #[serde(default = "default_redis_pool_max")]
    pub pool_max: usize,
    // Prefix for every key the registry writes. Overridden in tests for
    // isolation.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_redis_pool_max() -> usize {
    16
}

fn default_key_prefix() -> String {
    "registry".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_max: default_redis_pool_max(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), String> {
        let s = self.url.trim();
        if s.is_empty() {
            return Err("redis url should not be empty".to_string());
        }

        let url = Url::parse(s).map_err(|e| format!("invalid redis url: {}", e))?;

        let scheme = url.scheme();
        if scheme != "redis" && scheme != "rediss" {
            return Err(format!("unsupported URL scheme: {}", scheme));
        }

        if url.host().is_none() {
            return Err("redis url must have a host".to_string());
        }

        if self.pool_max == 0 {
            return Err("pool_max must be greater than 0".to_string());
        }

        if self.key_prefix.is_empty() {
            return Err("key_prefix must not be empty".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RedisConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_redis_scheme() {
        let config = RedisConfig {
            url: "http://127.0.0.1:6379".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_pool() {
        let config = RedisConfig {
            pool_max: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
