#[cfg(feature = "config")]
use core_config::{ConfigError, FromEnv, env_or_default};

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Connection URL, credentials and database index included
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

/// `REDIS_URL`, defaulting to a local instance
#[cfg(feature = "config")]
impl FromEnv for RedisConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_or_default("REDIS_URL", "redis://127.0.0.1:6379");
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue {
                key: "REDIS_URL".to_string(),
                details: "expected a redis:// or rediss:// URL".to_string(),
            });
        }
        Ok(Self { url })
    }
}

#[cfg(all(test, feature = "config"))]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_from_env_default() {
        temp_env::with_var_unset("REDIS_URL", || {
            assert_eq!(RedisConfig::from_env().unwrap().url, "redis://127.0.0.1:6379");
        });
    }

    #[test]
    fn test_redis_config_rejects_other_schemes() {
        temp_env::with_var("REDIS_URL", Some("http://cache:6379"), || {
            assert!(RedisConfig::from_env().is_err());
        });
    }
}
