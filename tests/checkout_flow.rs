use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, Set, Statement};
use uuid::Uuid;

use storefront_api::{
    config::AppConfig,
    db::{create_orm_conn, create_pool},
    dto::orders::{CartItemInput, CheckoutRequest},
    entity::{
        orders::Entity as Orders, products::ActiveModel as ProductActive,
        products::Entity as Products, users::ActiveModel as UserActive,
    },
    error::AppError,
    middleware::auth::AuthUser,
    models::{OrderStatus, ShippingAddress},
    payment::{GatewayError, IntentMetadata, PaymentEvent, PaymentGateway, PaymentIntent},
    services::order_service,
    state::AppState,
};

/// Gateway stand-in that records every intent request and never talks to the
/// network. Lets the tests assert that failed checkouts create no intent.
#[derive(Default)]
struct RecordingGateway {
    calls: AtomicUsize,
    last_amount: Mutex<Option<i64>>,
}

impl RecordingGateway {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_amount(&self) -> Option<i64> {
        *self.last_amount.lock().unwrap()
    }
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    async fn create_payment_intent(
        &self,
        amount_minor: i64,
        _currency: &str,
        _metadata: IntentMetadata,
    ) -> Result<PaymentIntent, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_amount.lock().unwrap() = Some(amount_minor);
        Ok(PaymentIntent {
            id: format!("pi_test_{}", Uuid::new_v4().simple()),
            client_secret: "cs_test_secret".into(),
        })
    }
}

struct TestEnv {
    state: AppState,
    gateway: Arc<RecordingGateway>,
}

// Allow skipping when no DB is configured in the environment.
async fn setup_env() -> anyhow::Result<Option<TestEnv>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration flow tests."
                );
                return Ok(None);
            }
        };

    let pool = create_pool(&database_url).await?;
    let orm = create_orm_conn(&database_url).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    // Clean tables between runs
    let backend = orm.get_database_backend();
    orm.execute(Statement::from_string(
        backend,
        "TRUNCATE TABLE order_items, orders, audit_logs, products, users RESTART IDENTITY CASCADE",
    ))
    .await?;

    let gateway = Arc::new(RecordingGateway::default());
    let config = AppConfig {
        database_url,
        host: "127.0.0.1".into(),
        port: 0,
        gateway_secret_key: "sk_test".into(),
        gateway_base_url: "http://localhost:0".into(),
        gateway_timeout_secs: 1,
        currency: "usd".into(),
        webhook_secret: None,
        webhook_tolerance_secs: 300,
    };
    let state = AppState {
        pool,
        orm,
        gateway: gateway.clone(),
        config: Arc::new(config),
    };

    Ok(Some(TestEnv { state, gateway }))
}

async fn create_user(state: &AppState, role: &str, email: &str) -> anyhow::Result<Uuid> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(email.to_string()),
        password_hash: Set("dummy".into()),
        role: Set(role.into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(user.id)
}

async fn create_product(
    state: &AppState,
    name: &str,
    price: Decimal,
    discounted: Option<Decimal>,
    stock: i32,
) -> anyhow::Result<Uuid> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(name.into()),
        description: Set(None),
        price: Set(price),
        discounted_price: Set(discounted),
        stock: Set(stock),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(product.id)
}

fn address() -> ShippingAddress {
    ShippingAddress {
        full_name: "Jane Doe".into(),
        street: "1 Main St".into(),
        city: "Springfield".into(),
        state: "IL".into(),
        zip_code: "62704".into(),
        country: "US".into(),
    }
}

fn cart_item(product_id: Uuid, quantity: i32) -> CartItemInput {
    CartItemInput {
        product_id,
        quantity,
        name: None,
        variant: None,
        image: None,
        price: None,
    }
}

async fn stock_of(state: &AppState, id: Uuid) -> anyhow::Result<i32> {
    let product = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .expect("product exists");
    Ok(product.stock)
}

// Checkout happy path plus reconciliation: a pending order, stock untouched
// until the success event, exactly one decrement across redeliveries.
#[tokio::test]
async fn checkout_and_webhook_reconciliation_flow() -> anyhow::Result<()> {
    let Some(env) = setup_env().await? else {
        return Ok(());
    };
    let TestEnv { state, gateway } = env;

    let user_id = create_user(&state, "user", "buyer@example.com").await?;
    let auth_user = AuthUser {
        user_id,
        role: "user".into(),
    };

    // 2 x 10.00 + 1 x 5.50 (discounted from 8.00) = 25.50
    let product_a = create_product(&state, "Plain Widget", Decimal::new(1000, 2), None, 10).await?;
    let product_b = create_product(
        &state,
        "Discounted Widget",
        Decimal::new(800, 2),
        Some(Decimal::new(550, 2)),
        4,
    )
    .await?;

    let resp = order_service::checkout(
        &state,
        &auth_user,
        CheckoutRequest {
            cart_items: vec![cart_item(product_a, 2), cart_item(product_b, 1)],
            shipping_address: Some(address()),
            payment_method: "card".into(),
        },
    )
    .await?;
    let checkout = resp.data.unwrap();
    assert_eq!(checkout.client_secret, "cs_test_secret");
    assert_eq!(gateway.calls(), 1);
    assert_eq!(gateway.last_amount(), Some(2550));

    // Order is pending with the server-computed total; stock is untouched.
    let order = Orders::find_by_id(checkout.order_id)
        .one(&state.orm)
        .await?
        .expect("order persisted");
    assert_eq!(order.status, OrderStatus::Pending.as_str());
    assert!(!order.is_paid);
    assert_eq!(order.total_amount, Decimal::new(2550, 2));
    assert_eq!(stock_of(&state, product_a).await?, 10);
    assert_eq!(stock_of(&state, product_b).await?, 4);

    // Line items carry the catalog price, not any client echo.
    let history = order_service::get_order(&state, &auth_user, checkout.order_id).await?;
    let with_items = history.data.unwrap();
    let line_b = with_items
        .items
        .iter()
        .find(|i| i.product_id == product_b)
        .expect("line item for discounted product");
    assert_eq!(line_b.unit_price, Decimal::new(550, 2));
    assert_eq!(line_b.name, "Discounted Widget");

    // First success event: paid, processing, stock decremented.
    let intent_id = order.payment_intent_id.clone();
    order_service::handle_payment_event(
        &state,
        PaymentEvent::Succeeded {
            intent_id: intent_id.clone(),
        },
    )
    .await?;

    let order = Orders::find_by_id(checkout.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert!(order.is_paid);
    assert!(order.paid_at.is_some());
    assert_eq!(order.status, OrderStatus::Processing.as_str());
    assert_eq!(stock_of(&state, product_a).await?, 8);
    assert_eq!(stock_of(&state, product_b).await?, 3);
    let first_paid_at = order.paid_at;

    // Redelivery is absorbed: no second decrement, no timestamp change.
    order_service::handle_payment_event(&state, PaymentEvent::Succeeded { intent_id }).await?;

    let order = Orders::find_by_id(checkout.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(order.paid_at, first_paid_at);
    assert_eq!(stock_of(&state, product_a).await?, 8);
    assert_eq!(stock_of(&state, product_b).await?, 3);

    Ok(())
}

#[tokio::test]
async fn failed_checkouts_create_no_order_and_no_intent() -> anyhow::Result<()> {
    let Some(env) = setup_env().await? else {
        return Ok(());
    };
    let TestEnv { state, gateway } = env;

    let user_id = create_user(&state, "user", "buyer2@example.com").await?;
    let auth_user = AuthUser {
        user_id,
        role: "user".into(),
    };
    let product = create_product(&state, "Scarce Widget", Decimal::new(500, 2), None, 1).await?;

    // Insufficient stock.
    let err = order_service::checkout(
        &state,
        &auth_user,
        CheckoutRequest {
            cart_items: vec![cart_item(product, 3)],
            shipping_address: Some(address()),
            payment_method: "card".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InsufficientStock(id) if id == product));

    // Unknown product.
    let ghost = Uuid::new_v4();
    let err = order_service::checkout(
        &state,
        &auth_user,
        CheckoutRequest {
            cart_items: vec![cart_item(ghost, 1)],
            shipping_address: Some(address()),
            payment_method: "card".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::ProductNotFound(id) if id == ghost));

    // Empty cart and missing address.
    let err = order_service::checkout(
        &state,
        &auth_user,
        CheckoutRequest {
            cart_items: vec![],
            shipping_address: Some(address()),
            payment_method: "card".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::InvalidCart(_)));

    let err = order_service::checkout(
        &state,
        &auth_user,
        CheckoutRequest {
            cart_items: vec![cart_item(product, 1)],
            shipping_address: None,
            payment_method: "card".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::MissingShippingAddress));

    // None of the failures reached the gateway or persisted anything.
    assert_eq!(gateway.calls(), 0);
    assert_eq!(Orders::find().all(&state.orm).await?.len(), 0);
    assert_eq!(stock_of(&state, product).await?, 1);

    Ok(())
}

#[tokio::test]
async fn events_for_unknown_intents_are_ignored() -> anyhow::Result<()> {
    let Some(env) = setup_env().await? else {
        return Ok(());
    };
    let TestEnv { state, .. } = env;

    order_service::handle_payment_event(
        &state,
        PaymentEvent::Failed {
            intent_id: "pi_never_seen".into(),
        },
    )
    .await?;

    order_service::handle_payment_event(
        &state,
        PaymentEvent::Succeeded {
            intent_id: "pi_never_seen".into(),
        },
    )
    .await?;

    order_service::handle_payment_event(&state, PaymentEvent::Other).await?;

    assert_eq!(Orders::find().all(&state.orm).await?.len(), 0);

    Ok(())
}

// Two confirmed orders race past the checkout-time stock check; the guarded
// decrement floors stock and the shortfall lands in the audit trail while
// both orders still become paid.
#[tokio::test]
async fn oversold_confirmation_records_shortfall() -> anyhow::Result<()> {
    let Some(env) = setup_env().await? else {
        return Ok(());
    };
    let TestEnv { state, .. } = env;

    let user_id = create_user(&state, "user", "buyer4@example.com").await?;
    let auth_user = AuthUser {
        user_id,
        role: "user".into(),
    };
    let product = create_product(&state, "Oversold Widget", Decimal::new(700, 2), None, 3).await?;

    let mut order_ids = Vec::new();
    for _ in 0..2 {
        let resp = order_service::checkout(
            &state,
            &auth_user,
            CheckoutRequest {
                cart_items: vec![cart_item(product, 2)],
                shipping_address: Some(address()),
                payment_method: "card".into(),
            },
        )
        .await?;
        order_ids.push(resp.data.unwrap().order_id);
    }

    for order_id in &order_ids {
        let order = Orders::find_by_id(*order_id).one(&state.orm).await?.unwrap();
        order_service::handle_payment_event(
            &state,
            PaymentEvent::Succeeded {
                intent_id: order.payment_intent_id,
            },
        )
        .await?;
    }

    // First confirmation takes 2 of 3; the second finds only 1 left, skips
    // the decrement, and records the shortfall.
    assert_eq!(stock_of(&state, product).await?, 1);
    for order_id in &order_ids {
        let order = Orders::find_by_id(*order_id).one(&state.orm).await?.unwrap();
        assert!(order.is_paid);
        assert_eq!(order.status, OrderStatus::Processing.as_str());
    }

    let (oversells,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM audit_logs WHERE action = 'stock_oversell' AND user_id = $1",
    )
    .bind(user_id)
    .fetch_one(&state.pool)
    .await?;
    assert_eq!(oversells, 1);

    Ok(())
}

// A failure event that arrives after the success event must not undo it.
#[tokio::test]
async fn late_failure_does_not_undo_a_paid_order() -> anyhow::Result<()> {
    let Some(env) = setup_env().await? else {
        return Ok(());
    };
    let TestEnv { state, .. } = env;

    let user_id = create_user(&state, "user", "buyer5@example.com").await?;
    let auth_user = AuthUser {
        user_id,
        role: "user".into(),
    };
    let product = create_product(&state, "Settled Widget", Decimal::new(1200, 2), None, 5).await?;

    let resp = order_service::checkout(
        &state,
        &auth_user,
        CheckoutRequest {
            cart_items: vec![cart_item(product, 1)],
            shipping_address: Some(address()),
            payment_method: "card".into(),
        },
    )
    .await?;
    let checkout = resp.data.unwrap();

    let order = Orders::find_by_id(checkout.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    let intent_id = order.payment_intent_id;

    order_service::handle_payment_event(
        &state,
        PaymentEvent::Succeeded {
            intent_id: intent_id.clone(),
        },
    )
    .await?;
    order_service::handle_payment_event(&state, PaymentEvent::Failed { intent_id }).await?;

    let order = Orders::find_by_id(checkout.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert!(order.is_paid);
    assert_eq!(order.status, OrderStatus::Processing.as_str());
    assert_eq!(stock_of(&state, product).await?, 4);

    Ok(())
}

#[tokio::test]
async fn failed_payment_cancels_pending_order() -> anyhow::Result<()> {
    let Some(env) = setup_env().await? else {
        return Ok(());
    };
    let TestEnv { state, .. } = env;

    let user_id = create_user(&state, "user", "buyer3@example.com").await?;
    let auth_user = AuthUser {
        user_id,
        role: "user".into(),
    };
    let product = create_product(&state, "Cancelled Widget", Decimal::new(999, 2), None, 5).await?;

    let resp = order_service::checkout(
        &state,
        &auth_user,
        CheckoutRequest {
            cart_items: vec![cart_item(product, 1)],
            shipping_address: Some(address()),
            payment_method: "card".into(),
        },
    )
    .await?;
    let checkout = resp.data.unwrap();

    let order = Orders::find_by_id(checkout.order_id)
        .one(&state.orm)
        .await?
        .unwrap();

    order_service::handle_payment_event(
        &state,
        PaymentEvent::Failed {
            intent_id: order.payment_intent_id,
        },
    )
    .await?;

    let order = Orders::find_by_id(checkout.order_id)
        .one(&state.orm)
        .await?
        .unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled.as_str());
    assert!(!order.is_paid);
    // No stock was ever reserved, so none comes back.
    assert_eq!(stock_of(&state, product).await?, 5);

    Ok(())
}
