use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod stripe;
pub mod webhook;

pub use stripe::StripeGateway;
pub use webhook::{PaymentEvent, verify_signature};

/// A payment intent created at the gateway. The `client_secret` is opaque to
/// the server; it is handed to the buyer's client to complete authorization.
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

/// Metadata attached to an intent so gateway records can be correlated back
/// to the buyer and the checkout attempt.
#[derive(Debug, Clone)]
pub struct IntentMetadata {
    pub user_id: Uuid,
    pub correlation_id: Uuid,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway did not respond within the configured deadline. Distinct
    /// from a decline: the intent may or may not exist on the gateway side.
    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway request failed: {0}")]
    Request(String),

    /// The gateway answered with a non-success status.
    #[error("gateway rejected the request: {0}")]
    Rejected(String),
}

/// External payment processor boundary. Implemented by [`StripeGateway`] in
/// production and by counting fakes in tests.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent for `amount_minor` minor currency units
    /// (e.g. cents) and return its id plus the client completion token.
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        metadata: IntentMetadata,
    ) -> Result<PaymentIntent, GatewayError>;
}
