use anyhow::Result;
use dotenvy::dotenv;
use secrecy::Secret;
use serde::Deserialize;
use std::env;

#[derive(Deserialize, Clone, Debug)]
pub struct SubscriptionConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub usage_reader: UsageReaderConfig,
    pub payment_provider: PaymentProviderConfig,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct UsageReaderConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PaymentProviderConfig {
    pub base_url: String,
    pub api_key: Secret<String>,
    pub timeout_ms: u64,
}

impl SubscriptionConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let host = env::var("SUBSCRIPTION_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SUBSCRIPTION_SERVICE_PORT")
            .unwrap_or_else(|_| "3006".to_string())
            .parse()?;

        let db_url =
            env::var("SUBSCRIPTION_DATABASE_URL").expect("SUBSCRIPTION_DATABASE_URL must be set");
        let max_connections = env::var("SUBSCRIPTION_DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()?;
        let min_connections = env::var("SUBSCRIPTION_DATABASE_MIN_CONNECTIONS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()?;

        let usage_base_url = env::var("USAGE_READER_URL")
            .unwrap_or_else(|_| "http://analytics-service:3020".to_string());
        let usage_timeout_ms = env::var("USAGE_READER_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()?;
        let usage_max_retries = env::var("USAGE_READER_MAX_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()?;

        let payment_base_url = env::var("PAYMENT_PROVIDER_URL")
            .unwrap_or_else(|_| "http://payment-service:3003".to_string());
        let payment_api_key =
            env::var("PAYMENT_PROVIDER_API_KEY").unwrap_or_else(|_| "dev-key".to_string());
        let payment_timeout_ms = env::var("PAYMENT_PROVIDER_TIMEOUT_MS")
            .unwrap_or_else(|_| "10000".to_string())
            .parse()?;

        let log_level = env::var("SUBSCRIPTION_LOG_LEVEL")
            .unwrap_or_else(|_| "info,subscription_service=debug".to_string());
        let otlp_endpoint = env::var("OTLP_ENDPOINT").ok();

        Ok(Self {
            server: ServerConfig { host, port },
            database: DatabaseConfig {
                url: Secret::new(db_url),
                max_connections,
                min_connections,
            },
            usage_reader: UsageReaderConfig {
                base_url: usage_base_url,
                timeout_ms: usage_timeout_ms,
                max_retries: usage_max_retries,
            },
            payment_provider: PaymentProviderConfig {
                base_url: payment_base_url,
                api_key: Secret::new(payment_api_key),
                timeout_ms: payment_timeout_ms,
            },
            service_name: "subscription-service".to_string(),
            log_level,
            otlp_endpoint,
        })
    }
}
