use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use uuid::Uuid;

use crate::{
    dto::orders::{CheckoutRequest, CheckoutResponse, OrderList, OrderWithItems, WebhookAck},
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    payment::{PaymentEvent, verify_signature},
    response::ApiResponse,
    routes::params::OrderListQuery,
    services::order_service,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders))
        .route("/checkout", post(checkout))
        .route("/webhook", post(webhook))
        .route("/{id}", get(get_order))
}

#[utoipa::path(
    post,
    path = "/api/orders/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Payment intent created, order pending", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Empty or invalid cart, or missing shipping address"),
        (status = 404, description = "Referenced product does not exist"),
        (status = 409, description = "Insufficient stock"),
        (status = 502, description = "Payment gateway failure"),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CheckoutRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<CheckoutResponse>>)> {
    let resp = order_service::checkout(&state, &user, payload).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

/// Gateway webhook. The body is taken as raw bytes so signature verification
/// covers exactly what the gateway signed; only afterwards is it decoded.
/// Any non-2xx answer makes the gateway redeliver, so "nothing to do" cases
/// still acknowledge with 200.
#[utoipa::path(
    post,
    path = "/api/orders/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Event processed or safely ignored", body = WebhookAck),
        (status = 400, description = "Bad signature or unreadable payload; gateway will retry"),
    ),
    tag = "Orders"
)]
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    if let Some(secret) = state.config.webhook_secret.as_deref() {
        if !verify_signature(&headers, &body, secret, state.config.webhook_tolerance_secs) {
            tracing::warn!("webhook signature verification failed");
            return Err(AppError::BadRequest("invalid webhook signature".into()));
        }
    }

    let event = PaymentEvent::parse(&body)
        .map_err(|err| AppError::BadRequest(format!("unreadable webhook payload: {err}")))?;

    order_service::handle_payment_event(&state, event).await?;

    Ok(Json(WebhookAck { received: true }))
}

#[utoipa::path(
    get,
    path = "/api/orders",
    params(
        ("page" = Option<i64>, Query, description = "Page number, default 1"),
        ("per_page" = Option<i64>, Query, description = "Items per page, default 20"),
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("sort_order" = Option<String>, Query, description = "Sort order: asc, desc (default)")
    ),
    responses(
        (status = 200, description = "Buyer's orders, newest first", body = ApiResponse<OrderList>),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<OrderListQuery>,
) -> AppResult<Json<ApiResponse<OrderList>>> {
    let resp = order_service::list_orders(&state, &user, query).await?;
    Ok(Json(resp))
}

#[utoipa::path(
    get,
    path = "/api/orders/{id}",
    params(
        ("id" = Uuid, Path, description = "Order ID")
    ),
    responses(
        (status = 200, description = "Buyer's order with items", body = ApiResponse<OrderWithItems>),
        (status = 404, description = "Not Found"),
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<OrderWithItems>>> {
    let resp = order_service::get_order(&state, &user, id).await?;
    Ok(Json(resp))
}
