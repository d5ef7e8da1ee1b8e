use std::collections::HashMap;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{CartItemInput, CheckoutRequest, CheckoutResponse, OrderList, OrderWithItems},
    entity::{
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{
            ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel,
        },
        products::{Column as ProdCol, Entity as Products, Model as ProductModel},
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Order, OrderItem, OrderStatus, ShippingAddress},
    payment::{IntentMetadata, PaymentEvent},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    state::AppState,
};

/// A cart line after server-side validation: quantities checked, product
/// resolved, unit price taken from the catalog rather than the client.
#[derive(Debug, Clone)]
struct PricedLine {
    product_id: Uuid,
    name: String,
    variant: Option<String>,
    image: Option<String>,
    quantity: i32,
    unit_price: Decimal,
}

/// Convert a major-unit amount to gateway minor units (cents), rounding the
/// half case away from zero.
fn to_minor_units(amount: Decimal) -> AppResult<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("order total out of range")))
}

/// Convert gateway minor units back to a two-decimal major-unit amount. The
/// persisted total always goes through this so the ledger and the gateway
/// agree on the exact charged amount.
fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

fn effective_unit_price(product: &ProductModel) -> Decimal {
    product.discounted_price.unwrap_or(product.price)
}

/// Validate the cart against catalog rows and compute the authoritative
/// total. No side effects; all failures happen before anything is written.
fn price_cart(
    items: &[CartItemInput],
    products: &HashMap<Uuid, ProductModel>,
) -> AppResult<(Vec<PricedLine>, Decimal)> {
    // The stock check must see the summed quantity per product: the same
    // product can appear on several cart lines.
    let mut requested: HashMap<Uuid, i64> = HashMap::new();
    for item in items {
        if item.quantity <= 0 {
            return Err(AppError::InvalidCart(format!(
                "quantity must be positive for product {}",
                item.product_id
            )));
        }
        *requested.entry(item.product_id).or_default() += i64::from(item.quantity);
    }
    for (product_id, quantity) in &requested {
        let product = products
            .get(product_id)
            .ok_or(AppError::ProductNotFound(*product_id))?;
        if i64::from(product.stock) < *quantity {
            return Err(AppError::InsufficientStock(product.id));
        }
    }

    let mut lines = Vec::with_capacity(items.len());
    let mut total = Decimal::ZERO;

    for item in items {
        let product = products
            .get(&item.product_id)
            .ok_or(AppError::ProductNotFound(item.product_id))?;
        let unit_price = effective_unit_price(product);
        total += unit_price * Decimal::from(item.quantity);
        lines.push(PricedLine {
            product_id: product.id,
            name: product.name.clone(),
            variant: item.variant.clone(),
            image: item.image.clone(),
            quantity: item.quantity,
            unit_price,
        });
    }

    Ok((lines, total))
}

/// Checkout orchestration: validate the cart, compute the authoritative
/// total, create a payment intent at the gateway, then persist the pending
/// order. Stock is not touched here; it is decremented only once payment is
/// confirmed.
pub async fn checkout(
    state: &AppState,
    user: &AuthUser,
    payload: CheckoutRequest,
) -> AppResult<ApiResponse<CheckoutResponse>> {
    let CheckoutRequest {
        cart_items,
        shipping_address,
        payment_method,
    } = payload;

    let address = shipping_address
        .filter(ShippingAddress::is_complete)
        .ok_or(AppError::MissingShippingAddress)?;
    if cart_items.is_empty() {
        return Err(AppError::InvalidCart("cart is empty".into()));
    }

    let ids: Vec<Uuid> = cart_items.iter().map(|i| i.product_id).collect();
    let products: HashMap<Uuid, ProductModel> = Products::find()
        .filter(ProdCol::Id.is_in(ids))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    let (lines, total) = price_cart(&cart_items, &products)?;
    let amount_minor = to_minor_units(total)?;
    let stored_total = from_minor_units(amount_minor);

    // Gateway first: if intent creation fails, nothing has been persisted.
    let metadata = IntentMetadata {
        user_id: user.user_id,
        correlation_id: Uuid::new_v4(),
    };
    let intent = state
        .gateway
        .create_payment_intent(amount_minor, &state.config.currency, metadata)
        .await?;

    let order = match persist_pending_order(
        state,
        user,
        &intent.id,
        stored_total,
        &address,
        &payment_method,
        &lines,
    )
    .await
    {
        Ok(order) => order,
        Err(err) => {
            // Money may be held at the gateway with no order to show for
            // it. Record the intent durably so a recovery job can cancel
            // or re-attach it.
            tracing::error!(
                intent_id = %intent.id,
                user_id = %user.user_id,
                error = %err,
                "order persistence failed after intent creation; intent is orphaned"
            );
            if let Err(audit_err) = log_audit(
                &state.pool,
                Some(user.user_id),
                "orphaned_payment_intent",
                Some("orders"),
                Some(serde_json::json!({
                    "payment_intent_id": intent.id,
                    "amount_minor": amount_minor,
                })),
            )
            .await
            {
                tracing::error!(error = %audit_err, "failed to record orphaned intent");
            }
            return Err(err);
        }
    };

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "checkout",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "payment_intent_id": intent.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Payment intent created. Waiting for confirmation.",
        CheckoutResponse {
            order_id: order.id,
            client_secret: intent.client_secret,
        },
        Some(Meta::empty()),
    ))
}

async fn persist_pending_order(
    state: &AppState,
    user: &AuthUser,
    intent_id: &str,
    total: Decimal,
    address: &ShippingAddress,
    payment_method: &str,
    lines: &[PricedLine],
) -> AppResult<OrderModel> {
    let address_json =
        serde_json::to_value(address).map_err(|err| AppError::Internal(err.into()))?;

    let txn = state.orm.begin().await?;

    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.user_id),
        total_amount: Set(total),
        status: Set(OrderStatus::Pending.as_str().to_owned()),
        payment_method: Set(payment_method.to_owned()),
        payment_intent_id: Set(intent_id.to_owned()),
        shipping_address: Set(address_json),
        is_paid: Set(false),
        paid_at: Set(None),
        delivered_at: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    for line in lines {
        OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(line.product_id),
            name: Set(line.name.clone()),
            variant: Set(line.variant.clone()),
            image: Set(line.image.clone()),
            quantity: Set(line.quantity),
            unit_price: Set(line.unit_price),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
    }

    txn.commit().await?;
    Ok(order)
}

/// Payment event reconciliation. Must be idempotent: the gateway may deliver
/// the same event more than once, and events may arrive for intents we know
/// nothing about.
pub async fn handle_payment_event(state: &AppState, event: PaymentEvent) -> AppResult<()> {
    match event {
        PaymentEvent::Succeeded { intent_id } => confirm_payment(state, &intent_id).await,
        PaymentEvent::Failed { intent_id } => cancel_unpaid_order(state, &intent_id).await,
        PaymentEvent::Other => Ok(()),
    }
}

async fn confirm_payment(state: &AppState, intent_id: &str) -> AppResult<()> {
    let txn = state.orm.begin().await?;

    let order = Orders::find()
        .filter(OrderCol::PaymentIntentId.eq(intent_id))
        .lock(LockType::Update)
        .one(&txn)
        .await?;
    let order = match order {
        Some(o) => o,
        None => {
            // The event may have raced ahead of order persistence, or the
            // order may never have existed. Either way there is nothing to
            // reconcile.
            tracing::info!(%intent_id, "payment_succeeded for unknown intent; ignoring");
            return Ok(());
        }
    };
    if order.is_paid {
        tracing::debug!(order_id = %order.id, %intent_id, "payment already recorded; redelivery ignored");
        return Ok(());
    }

    let order_id = order.id;
    let user_id = order.user_id;

    let mut active: OrderActive = order.into();
    active.is_paid = Set(true);
    active.paid_at = Set(Some(Utc::now().into()));
    active.status = Set(OrderStatus::Processing.as_str().to_owned());
    active.updated_at = Set(Utc::now().into());
    active.update(&txn).await?;

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order_id))
        .all(&txn)
        .await?;

    // Conditional decrement: two confirmed orders can race past the
    // checkout-time stock check, so the guard lives in the UPDATE itself and
    // stock never goes negative.
    let mut oversold = Vec::new();
    for item in &items {
        let result = Products::update_many()
            .col_expr(
                ProdCol::Stock,
                Expr::col(ProdCol::Stock).sub(item.quantity),
            )
            .filter(
                Condition::all()
                    .add(ProdCol::Id.eq(item.product_id))
                    .add(ProdCol::Stock.gte(item.quantity)),
            )
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            oversold.push((item.product_id, item.quantity));
        }
    }

    txn.commit().await?;

    for (product_id, quantity) in oversold {
        tracing::error!(
            order_id = %order_id,
            %product_id,
            quantity,
            "confirmed order exceeds remaining stock"
        );
        if let Err(err) = log_audit(
            &state.pool,
            Some(user_id),
            "stock_oversell",
            Some("products"),
            Some(serde_json::json!({
                "order_id": order_id,
                "product_id": product_id,
                "quantity": quantity,
            })),
        )
        .await
        {
            tracing::error!(error = %err, "failed to record oversell");
        }
    }

    if let Err(err) = log_audit(
        &state.pool,
        Some(user_id),
        "payment_succeeded",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order_id, "payment_intent_id": intent_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(())
}

async fn cancel_unpaid_order(state: &AppState, intent_id: &str) -> AppResult<()> {
    let txn = state.orm.begin().await?;

    // Row lock so a concurrent success event for the same intent cannot
    // commit between our is_paid check and the cancellation write.
    let order = Orders::find()
        .filter(OrderCol::PaymentIntentId.eq(intent_id))
        .lock(LockType::Update)
        .one(&txn)
        .await?;
    let order = match order {
        Some(o) => o,
        None => {
            tracing::info!(%intent_id, "payment_failed for unknown intent; ignoring");
            return Ok(());
        }
    };
    if order.is_paid {
        // A success event was already applied; a late failure must not undo it.
        tracing::warn!(order_id = %order.id, %intent_id, "payment_failed after success; ignoring");
        return Ok(());
    }

    let order_id = order.id;
    let user_id = order.user_id;

    let mut active: OrderActive = order.into();
    active.status = Set(OrderStatus::Cancelled.as_str().to_owned());
    active.updated_at = Set(Utc::now().into());
    active.update(&txn).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user_id),
        "payment_failed",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order_id, "payment_intent_id": intent_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(())
}

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all().add(OrderCol::UserId.eq(user.user_id));
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(OrderCol::Status.eq(status.clone()));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);

    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_from_entity)
        .collect::<AppResult<Vec<_>>>()?;

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success(
        "Ok",
        OrderList { items: orders },
        Some(meta),
    ))
}

pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderWithItems>> {
    let order = Orders::find()
        .filter(
            Condition::all()
                .add(OrderCol::UserId.eq(user.user_id))
                .add(OrderCol::Id.eq(id)),
        )
        .one(&state.orm)
        .await?;
    let order = match order {
        Some(o) => order_from_entity(o)?,
        None => return Err(AppError::NotFound),
    };

    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(&state.orm)
        .await?
        .into_iter()
        .map(order_item_from_entity)
        .collect();

    Ok(ApiResponse::success(
        "OK",
        OrderWithItems { order, items },
        Some(Meta::empty()),
    ))
}

pub(crate) fn order_from_entity(model: OrderModel) -> AppResult<Order> {
    let status = OrderStatus::parse(&model.status).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("unknown order status `{}`", model.status))
    })?;
    let shipping_address =
        serde_json::from_value(model.shipping_address).map_err(|err| AppError::Internal(err.into()))?;
    Ok(Order {
        id: model.id,
        user_id: model.user_id,
        total_amount: model.total_amount,
        status,
        payment_method: model.payment_method,
        payment_intent_id: model.payment_intent_id,
        shipping_address,
        is_paid: model.is_paid,
        paid_at: model.paid_at.map(|dt| dt.with_timezone(&Utc)),
        delivered_at: model.delivered_at.map(|dt| dt.with_timezone(&Utc)),
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    })
}

pub(crate) fn order_item_from_entity(model: OrderItemModel) -> OrderItem {
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        name: model.name,
        variant: model.variant,
        image: model.image,
        quantity: model.quantity,
        unit_price: model.unit_price,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: Uuid, price: Decimal, discounted: Option<Decimal>, stock: i32) -> ProductModel {
        ProductModel {
            id,
            name: format!("product-{id}"),
            description: None,
            price,
            discounted_price: discounted,
            stock,
            created_at: Utc::now().into(),
        }
    }

    fn item(product_id: Uuid, quantity: i32) -> CartItemInput {
        CartItemInput {
            product_id,
            quantity,
            name: None,
            variant: None,
            image: None,
            price: None,
        }
    }

    #[test]
    fn prices_cart_from_catalog_with_discounts() {
        // 2 x 10.00 + 1 x 5.50 (discounted from 8.00) = 25.50.
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut products = HashMap::new();
        products.insert(a, product(a, Decimal::new(1000, 2), None, 10));
        products.insert(
            b,
            product(b, Decimal::new(800, 2), Some(Decimal::new(550, 2)), 10),
        );

        let (lines, total) = price_cart(&[item(a, 2), item(b, 1)], &products).unwrap();
        assert_eq!(total, Decimal::new(2550, 2));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].unit_price, Decimal::new(1000, 2));
        assert_eq!(lines[1].unit_price, Decimal::new(550, 2));
        assert_eq!(to_minor_units(total).unwrap(), 2550);
    }

    #[test]
    fn server_price_wins_over_client_echo() {
        let a = Uuid::new_v4();
        let mut products = HashMap::new();
        products.insert(a, product(a, Decimal::new(1000, 2), None, 5));

        let mut cheap = item(a, 1);
        cheap.price = Some(Decimal::new(1, 2));
        cheap.name = Some("definitely a yacht".into());

        let (lines, total) = price_cart(&[cheap], &products).unwrap();
        assert_eq!(total, Decimal::new(1000, 2));
        assert_eq!(lines[0].unit_price, Decimal::new(1000, 2));
        assert_eq!(lines[0].name, format!("product-{a}"));
    }

    #[test]
    fn rejects_unknown_product() {
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        let mut products = HashMap::new();
        products.insert(known, product(known, Decimal::ONE, None, 10));

        let err = price_cart(&[item(known, 1), item(unknown, 1)], &products).unwrap_err();
        assert!(matches!(err, AppError::ProductNotFound(id) if id == unknown));
    }

    #[test]
    fn rejects_insufficient_stock() {
        let a = Uuid::new_v4();
        let mut products = HashMap::new();
        products.insert(a, product(a, Decimal::ONE, None, 2));

        let err = price_cart(&[item(a, 3)], &products).unwrap_err();
        assert!(matches!(err, AppError::InsufficientStock(id) if id == a));
    }

    #[test]
    fn sums_duplicate_lines_against_stock() {
        let a = Uuid::new_v4();
        let mut products = HashMap::new();
        products.insert(a, product(a, Decimal::ONE, None, 4));

        // 3 + 3 over two lines exceeds stock 4 even though each line fits.
        let err = price_cart(&[item(a, 3), item(a, 3)], &products).unwrap_err();
        assert!(matches!(err, AppError::InsufficientStock(id) if id == a));

        let (lines, total) = price_cart(&[item(a, 2), item(a, 2)], &products).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(total, Decimal::from(4));
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let a = Uuid::new_v4();
        let mut products = HashMap::new();
        products.insert(a, product(a, Decimal::ONE, None, 10));

        assert!(matches!(
            price_cart(&[item(a, 0)], &products),
            Err(AppError::InvalidCart(_))
        ));
        assert!(matches!(
            price_cart(&[item(a, -2)], &products),
            Err(AppError::InvalidCart(_))
        ));
    }

    #[test]
    fn minor_unit_round_trip_preserves_two_decimals() {
        // 19.995 is the fractional-cent-prone case: rounds up to 2000 minor
        // units and must be stored as 20.00.
        let total = Decimal::new(19995, 3);
        let minor = to_minor_units(total).unwrap();
        assert_eq!(minor, 2000);
        assert_eq!(from_minor_units(minor), Decimal::new(2000, 2));
        assert_eq!(from_minor_units(minor).to_string(), "20.00");

        assert_eq!(to_minor_units(Decimal::new(2550, 2)).unwrap(), 2550);
        assert_eq!(from_minor_units(2550).to_string(), "25.50");
        assert_eq!(to_minor_units(Decimal::ZERO).unwrap(), 0);
    }
}
