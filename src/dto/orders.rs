use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Order, OrderItem, ShippingAddress};

/// A cart line as the client sent it. Only `product_id` and `quantity` are
/// trusted; `variant` and `image` are display echoes carried onto the order
/// snapshot, and `name`/`price` are ignored in favor of the catalog row.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CartItemInput {
    pub product_id: Uuid,
    pub quantity: i32,
    pub name: Option<String>,
    pub variant: Option<String>,
    pub image: Option<String>,
    pub price: Option<Decimal>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    pub cart_items: Vec<CartItemInput>,
    pub shipping_address: Option<ShippingAddress>,
    pub payment_method: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    /// Gateway completion token for the buyer's client; opaque to us.
    pub client_secret: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderWithItems {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderList {
    pub items: Vec<Order>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}
