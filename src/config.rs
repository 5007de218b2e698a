// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pipeline Configuration
//!
//! Broker connection settings are read from environment variables with
//! defaults matching a local RabbitMQ (`guest:guest@127.0.0.1:5672`).
//! Retry and timeout settings for workers are plain builders, since they are
//! deployment policy chosen per worker rather than per process.

use crate::errors::ConfigError;
use std::{env, str::FromStr, time::Duration};

pub const ENV_APP_ENV: &str = "APP_ENV";
pub const ENV_RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const ENV_RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const ENV_RABBITMQ_USER: &str = "RABBITMQ_USER";
pub const ENV_RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_RABBITMQ_HEARTBEAT_SECS: &str = "RABBITMQ_HEARTBEAT_SECS";
pub const ENV_RABBITMQ_DISPATCH_CONCURRENCY: &str = "RABBITMQ_DISPATCH_CONCURRENCY";

/// Application environment, selects the log format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env_or_default(ENV_APP_ENV, "development");

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Helper to load an environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load and parse an environment variable with a default value
pub fn env_parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::ParseError {
            key: key.to_owned(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// RabbitMQ connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval negotiated with the broker, kept short so dead
    /// peers are detected within a few seconds.
    pub heartbeat_secs: u16,
    /// Maximum number of deliveries handed to callbacks concurrently across
    /// all consumers sharing one connection.
    pub dispatch_concurrency: usize,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "127.0.0.1".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            heartbeat_secs: 5,
            dispatch_concurrency: 2,
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the connection settings from the environment, falling back to
    /// the defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = RabbitMQConfigs::default();

        let cfg = RabbitMQConfigs {
            host: env_or_default(ENV_RABBITMQ_HOST, &defaults.host),
            port: env_parse_or(ENV_RABBITMQ_PORT, defaults.port)?,
            user: env_or_default(ENV_RABBITMQ_USER, &defaults.user),
            password: env_or_default(ENV_RABBITMQ_PASSWORD, &defaults.password),
            vhost: env_or_default(ENV_RABBITMQ_VHOST, &defaults.vhost),
            heartbeat_secs: env_parse_or(ENV_RABBITMQ_HEARTBEAT_SECS, defaults.heartbeat_secs)?,
            dispatch_concurrency: env_parse_or(
                ENV_RABBITMQ_DISPATCH_CONCURRENCY,
                defaults.dispatch_concurrency,
            )?,
        };

        if cfg.dispatch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "dispatch concurrency must be at least 1".to_owned(),
            ));
        }

        Ok(cfg)
    }

    /// Builds the `amqp://` URI, including the heartbeat query parameter.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            self.user, self.password, self.host, self.port, self.vhost, self.heartbeat_secs
        )
    }

    /// Same as [`RabbitMQConfigs::uri`] without the credentials, for logs.
    pub fn redacted_uri(&self) -> String {
        format!("amqp://{}:{}/{}", self.host, self.port, self.vhost)
    }
}

/// Growth function of the delay between two handler attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// `step * attempt`
    Linear { step: Duration },
    /// `base ^ attempt` seconds
    Exponential { base: f64 },
}

impl Backoff {
    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::Exponential { base } => {
                let secs = base.powi(attempt as i32);
                if secs.is_finite() && secs < Duration::MAX.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    Duration::MAX
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Linear {
            step: Duration::from_secs(5),
        }
    }
}

/// Retry and timeout settings of a worker.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicyConfig {
    /// Upper bound on handler invocations for one message
    pub max_attempts: u32,
    /// Deadline covering all the attempts of one message
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        RetryPolicyConfig {
            max_attempts: 10,
            timeout: Duration::from_secs(45),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicyConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_owned(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must not be zero".to_owned()));
        }

        if let Backoff::Exponential { base } = self.backoff {
            if base.is_nan() || base <= 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "exponential backoff base must be greater than 1, got {base}"
                )));
            }
        }

        Ok(())
    }
}
