//! # course-payments
//!
//! Course checkout with Stripe and webhook-driven enrollment reconciliation.
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────┐  create_checkout  ┌─────────────────┐   pay   ┌─────────────┐
//! │  Frontend   │──────────────────▶│  Stripe Hosted  │────────▶│  Frontend   │
//! │  (course)   │  pending row      │  Checkout Page  │         │  (success)  │
//! └─────────────┘                   └────────┬────────┘         └─────────────┘
//!                                            │ checkout.session.completed
//!                                            ▼
//!                                  ┌───────────────────┐  retrieve  ┌────────┐
//!                                  │ ReconciliationEng │───────────▶│ Stripe │
//!                                  │ lock ▸ resolve ▸  │            └────────┘
//!                                  │ update ▸ release  │
//!                                  └───────────────────┘
//! ```
//!
//! Webhook payloads are only a trigger. The enrollment's status is always
//! re-read from Stripe, so replayed or forged events can at worst cause an
//! extra lookup.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use course_payments::{
//!     MemoryEnrollmentStore, MemoryLockManager, PaymentsConfig, ReconciliationEngine,
//!     StripeClient,
//! };
//!
//! let config = PaymentsConfig::from_env()?;
//! let stripe = Arc::new(StripeClient::from_config(&config)?);
//! let engine = ReconciliationEngine::new(
//!     Arc::new(MemoryEnrollmentStore::new()),
//!     Arc::new(MemoryLockManager::new()),
//!     stripe,
//! )
//! .with_timeouts(config.lock_ttl, config.resolve_timeout)?
//! .with_signing_secret(config.webhook_secret.clone());
//!
//! let outcome = engine.handle(&body, signature_header).await?;
//! // respond 200 with outcome.response_body()
//! ```

mod checkout;
mod config;
mod course;
mod enrollment;
mod error;
mod lock;
mod money;
mod resolver;
mod webhook;

#[cfg(feature = "test-util")]
pub use checkout::MockCheckoutProvider;
pub use checkout::{CheckoutProvider, CheckoutService, CheckoutSession, SessionRequest, StripeClient};
pub use config::{DEFAULT_RESOLVE_TIMEOUT, PaymentsConfig};
pub use course::{Course, CourseCatalog, MemoryCourseCatalog};
pub use enrollment::{Enrollment, EnrollmentStore, MemoryEnrollmentStore, PaymentStatus};
pub use error::{PaymentError, Result};
#[cfg(feature = "redis")]
pub use lock::RedisLockManager;
pub use lock::{
    DEFAULT_LOCK_TTL, Lock, LockGuard, LockManager, MemoryLockManager, WEBHOOK_LOCK_PREFIX,
    webhook_lock_key,
};
pub use money::{from_minor, minor_unit_exponent, to_minor};
#[cfg(feature = "test-util")]
pub use resolver::MockResolver;
pub use resolver::{PaymentStatusResolver, ResolvedPayment};
pub use webhook::{
    CHECKOUT_SESSION_COMPLETED, ReconciliationEngine, WebhookEvent, WebhookOutcome, parse_event,
};
