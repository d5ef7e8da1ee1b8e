use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{GatewayError, IntentMetadata, PaymentGateway, PaymentIntent};
use crate::config::AppConfig;

/// Stripe-compatible gateway client. Talks to the `/v1/payment_intents`
/// endpoint with form-encoded bodies and bearer auth.
pub struct StripeGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: Option<GatewayErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    message: Option<String>,
}

impl StripeGateway {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.gateway_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.gateway_base_url.clone(),
            secret_key: config.gateway_secret_key.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: IntentMetadata,
    ) -> Result<PaymentIntent, GatewayError> {
        let url = format!("{}/v1/payment_intents", self.base_url);
        let params = [
            ("amount", amount_minor.to_string()),
            ("currency", currency.to_string()),
            ("metadata[user_id]", metadata.user_id.to_string()),
            (
                "metadata[correlation_id]",
                metadata.correlation_id.to_string(),
            ),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            // Retries of the same checkout attempt must not create a second
            // intent on the gateway side.
            .header("Idempotency-Key", metadata.correlation_id.to_string())
            .form(&params)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Request(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<GatewayErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error)
                .and_then(|detail| detail.message)
                .unwrap_or_else(|| format!("status {status}"));
            return Err(GatewayError::Rejected(message));
        }

        let intent: IntentResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::Request(err.to_string()))?;

        Ok(PaymentIntent {
            id: intent.id,
            client_secret: intent.client_secret,
        })
    }
}
