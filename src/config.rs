use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Secret API key for the payment gateway.
    pub gateway_secret_key: String,
    /// Base URL of the gateway API; overridable for tests.
    pub gateway_base_url: String,
    /// Bounded timeout for gateway calls, in seconds.
    pub gateway_timeout_secs: u64,
    /// ISO currency code sent with payment intents.
    pub currency: String,
    /// Shared secret for webhook signature verification. Verification is
    /// skipped when unset (local development only).
    pub webhook_secret: Option<String>,
    /// Allowed clock skew for signed webhook timestamps, in seconds.
    pub webhook_tolerance_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(3000);
        let gateway_secret_key = env::var("GATEWAY_SECRET_KEY")?;
        let gateway_base_url =
            env::var("GATEWAY_BASE_URL").unwrap_or_else(|_| "https://api.stripe.com".to_string());
        let gateway_timeout_secs = env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(10);
        let currency = env::var("CURRENCY").unwrap_or_else(|_| "usd".to_string());
        let webhook_secret = env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty());
        let webhook_tolerance_secs = env::var("WEBHOOK_TOLERANCE_SECS")
            .ok()
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(300);
        Ok(Self {
            database_url,
            host,
            port,
            gateway_secret_key,
            gateway_base_url,
            gateway_timeout_secs,
            currency,
            webhook_secret,
            webhook_tolerance_secs,
        })
    }
}
