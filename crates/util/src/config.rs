use std::{env, fmt, net::SocketAddr};

use super::server_bind_address;

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com/v1/";
pub const DEFAULT_CURRENCY: &str = "usd";
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_SUCCESS_URL: &str = "http://localhost:8080/checkout/success";
const DEFAULT_CANCEL_URL: &str = "http://localhost:8080/checkout/cancel";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub payment: PaymentConfig,
    pub max_body_bytes: usize,
}

/// Settings for the payment processor integration.
#[derive(Clone)]
pub struct PaymentConfig {
    pub secret_key: String,
    /// Shared secret for webhook signatures. The webhook rejects every delivery when unset.
    pub webhook_secret: Option<String>,
    pub api_base: String,
    pub success_url: String,
    pub cancel_url: String,
    pub default_currency: String,
    pub webhook_tolerance_secs: u64,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url = required("DATABASE_URL")?;
        let payment = PaymentConfig {
            secret_key: required("PAYMENT_SECRET_KEY")?,
            webhook_secret: optional("PAYMENT_WEBHOOK_SECRET"),
            api_base: optional("PAYMENT_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            success_url: optional("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|| DEFAULT_SUCCESS_URL.to_string()),
            cancel_url: optional("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|| DEFAULT_CANCEL_URL.to_string()),
            default_currency: optional("DEFAULT_CURRENCY")
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            webhook_tolerance_secs: parse_number(
                "WEBHOOK_TOLERANCE_SECS",
                DEFAULT_WEBHOOK_TOLERANCE_SECS,
            )?,
        };
        let max_body_bytes = parse_number("MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?;
        if max_body_bytes == 0 {
            return Err(ConfigError::InvalidNumber {
                name: "MAX_BODY_BYTES",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            payment,
            max_body_bytes,
        })
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("environment", &self.environment)
            .field("database_url", &"<redacted>")
            .field("payment", &self.payment)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl fmt::Debug for PaymentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentConfig")
            .field("secret_key", &"<redacted>")
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("api_base", &self.api_base)
            .field("success_url", &self.success_url)
            .field("cancel_url", &self.cancel_url)
            .field("default_currency", &self.default_currency)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .finish()
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn parse_number<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidNumber { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));
