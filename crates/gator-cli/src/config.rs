//! Process configuration, resolved once at startup from environment
//! variables (§6). No config file format; mirrors the
//! `DbConfig::from_env()` idiom already used by the store crate.

use std::net::IpAddr;

use anyhow::{Context, Result, bail};
use gator_db::config::DbConfig;

/// Deployment environment, mostly used to tune defaults (e.g. CORS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Env {
    Development,
    Production,
    Test,
}

impl Env {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => bail!("invalid ENV {other:?}; expected development, production, or test"),
        }
    }
}

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: IpAddr,
    pub port: u16,
    pub db_config: DbConfig,
    pub log_level: String,
    pub api_token: Option<String>,
    pub env: Env,
}

impl AppConfig {
    /// Resolve every recognized environment variable (§6), falling back to
    /// documented defaults.
    pub fn from_env() -> Result<Self> {
        let host = match std::env::var("HOST") {
            Ok(v) => v.parse().with_context(|| format!("invalid HOST {v:?}"))?,
            Err(_) => IpAddr::from([127, 0, 0, 1]),
        };

        let port = match std::env::var("PORT") {
            Ok(v) => v.parse().with_context(|| format!("invalid PORT {v:?}"))?,
            Err(_) => 3000,
        };

        let db_config = DbConfig::from_env();

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let api_token = std::env::var("API_TOKEN").ok().filter(|s| !s.is_empty());

        let env = match std::env::var("ENV") {
            Ok(v) => Env::parse(&v)?,
            Err(_) => Env::Development,
        };

        Ok(Self { host, port, db_config, log_level, api_token, env })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let _lock = lock_env();
        for var in ["HOST", "PORT", "LOG_LEVEL", "API_TOKEN", "ENV", "APP_HOME"] {
            unsafe { std::env::remove_var(var) };
        }

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.host, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.api_token.is_none());
        assert_eq!(cfg.env, Env::Development);
    }

    #[test]
    fn reads_every_recognized_variable() {
        let _lock = lock_env();
        unsafe { std::env::set_var("HOST", "0.0.0.0") };
        unsafe { std::env::set_var("PORT", "8080") };
        unsafe { std::env::set_var("LOG_LEVEL", "debug") };
        unsafe { std::env::set_var("API_TOKEN", "secret-token") };
        unsafe { std::env::set_var("ENV", "production") };

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.host, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.api_token.as_deref(), Some("secret-token"));
        assert_eq!(cfg.env, Env::Production);

        for var in ["HOST", "PORT", "LOG_LEVEL", "API_TOKEN", "ENV"] {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn empty_api_token_is_treated_as_unset() {
        let _lock = lock_env();
        unsafe { std::env::set_var("API_TOKEN", "") };
        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.api_token.is_none());
        unsafe { std::env::remove_var("API_TOKEN") };
    }

    #[test]
    fn rejects_unknown_env_value() {
        let _lock = lock_env();
        unsafe { std::env::set_var("ENV", "staging") };
        let result = AppConfig::from_env();
        unsafe { std::env::remove_var("ENV") };
        assert!(result.is_err());
    }
}
