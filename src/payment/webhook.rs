use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Inbound payment-outcome notification, decoded into a closed set of
/// variants. Unknown event types become [`PaymentEvent::Other`] so the
/// gateway can add types without breaking us; a body that cannot be decoded
/// at all is a [`WebhookParseError`], which the caller must surface as a
/// retryable failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    Succeeded { intent_id: String },
    Failed { intent_id: String },
    Other,
}

#[derive(Debug, Error)]
pub enum WebhookParseError {
    #[error("webhook payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("webhook event `{0}` is missing the payment intent id")]
    MissingIntentId(String),
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Option<RawEventData>,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    #[serde(default)]
    object: Option<RawEventObject>,
}

#[derive(Debug, Deserialize)]
struct RawEventObject {
    #[serde(default)]
    id: Option<String>,
}

impl PaymentEvent {
    pub fn parse(body: &[u8]) -> Result<Self, WebhookParseError> {
        let raw: RawEvent = serde_json::from_slice(body)?;
        match raw.event_type.as_str() {
            "payment_intent.succeeded" => {
                let intent_id = intent_id(raw.data)
                    .ok_or(WebhookParseError::MissingIntentId(raw.event_type))?;
                Ok(PaymentEvent::Succeeded { intent_id })
            }
            "payment_intent.payment_failed" => {
                let intent_id = intent_id(raw.data)
                    .ok_or(WebhookParseError::MissingIntentId(raw.event_type))?;
                Ok(PaymentEvent::Failed { intent_id })
            }
            _ => Ok(PaymentEvent::Other),
        }
    }
}

fn intent_id(data: Option<RawEventData>) -> Option<String> {
    data?.object?.id.filter(|id| !id.is_empty())
}

/// Verify a `Stripe-Signature: t=<ts>,v1=<hex>` header against the raw body:
/// HMAC-SHA256 over `"<ts>.<body>"`, constant-time compare, bounded clock
/// skew. The body must be the exact bytes the gateway signed, so the route
/// reads it before any JSON parsing.
pub fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
) -> bool {
    let Some(header) = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
    else {
        return false;
    };

    let mut ts = "";
    let mut v1 = "";
    for part in header.split(',') {
        let mut it = part.trim().splitn(2, '=');
        match (it.next(), it.next()) {
            (Some("t"), Some(val)) => ts = val,
            (Some("v1"), Some(val)) => v1 = val,
            _ => {}
        }
    }
    if ts.is_empty() || v1.is_empty() {
        return false;
    }

    if let Ok(ts_i) = ts.parse::<i64>() {
        let now = chrono::Utc::now().timestamp();
        if (now - ts_i).unsigned_abs() > tolerance_secs {
            return false;
        }
    } else {
        return false;
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(expected.as_bytes(), v1.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.iter().zip(b) {
        res |= x ^ y;
    }
    res == 0
}
