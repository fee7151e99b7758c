//! course-checkout HTTP Server
//!
//! Axum-based server for course checkout and Stripe webhook reconciliation.

mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use course_payments::{
    CheckoutService, EnrollmentStore, LockManager, MemoryCourseCatalog, MemoryEnrollmentStore,
    MemoryLockManager, PaymentsConfig, ReconciliationEngine, RedisLockManager, StripeClient,
};

use crate::handlers::{check_payment, create_checkout, health_check, payment_status, stripe_webhook};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PaymentsConfig::from_env()?;

    // Storage
    let store: Arc<dyn EnrollmentStore> = Arc::new(MemoryEnrollmentStore::new());

    let catalog = match &config.course_catalog_path {
        Some(path) => MemoryCourseCatalog::from_json_file(path)?,
        None => {
            tracing::warn!("⚠ COURSE_CATALOG not set - no courses can be purchased");
            MemoryCourseCatalog::default()
        }
    };
    tracing::info!("Loaded {} courses", catalog.len());

    // Webhook locks
    let locks: Arc<dyn LockManager> = match &config.redis_url {
        Some(url) => {
            let locks = RedisLockManager::connect(url).await?;
            tracing::info!("✓ Using Redis webhook locks");
            Arc::new(locks)
        }
        None => {
            tracing::warn!("⚠ REDIS_URL not set - webhook locks are per-process only");
            Arc::new(MemoryLockManager::new())
        }
    };

    // Initialize payments
    let stripe = StripeClient::from_config(&config).ok().map(Arc::new);

    let state = match stripe {
        Some(stripe) => {
            tracing::info!("✓ Stripe configured");
            if config.webhook_secret.is_none() {
                tracing::warn!("⚠ STRIPE_WEBHOOK_SECRET not set - webhook signatures are not checked");
            }

            let checkout = CheckoutService::new(
                stripe.clone(),
                Arc::new(catalog),
                store.clone(),
                &config,
            );
            let reconciler = ReconciliationEngine::new(store.clone(), locks, stripe.clone())
                .with_timeouts(config.lock_ttl, config.resolve_timeout)?
                .with_signing_secret(config.webhook_secret.clone());

            AppState {
                store,
                checkout: Some(Arc::new(checkout)),
                reconciler: Some(Arc::new(reconciler)),
                resolver: Some(stripe),
            }
        }
        None => {
            tracing::warn!("⚠ Stripe not configured - payments disabled");
            tracing::warn!("  Set STRIPE_SECRET_KEY (and STRIPE_WEBHOOK_SECRET) in .env");
            AppState {
                store,
                checkout: None,
                reconciler: None,
                resolver: None,
            }
        }
    };

    let app = app(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🚀 course-server running on http://{}", addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                         - Health check");
    tracing::info!("  POST /api/checkout                   - Create Stripe checkout");
    tracing::info!("  POST /api/check-payment/{{session}}    - Is the enrollment paid");
    tracing::info!("  GET  /api/payment-status?session_id= - Live Stripe status");
    tracing::info!("  POST /stripe/webhook                 - Stripe webhook");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the router
fn app(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        // Payments
        .route("/api/checkout", post(create_checkout))
        .route("/api/check-payment/{session_id}", post(check_payment))
        .route("/api/payment-status", get(payment_status))
        .route("/stripe/webhook", post(stripe_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
