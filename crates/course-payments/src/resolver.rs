//! Payment Status Resolution
//!
//! The webhook body only tells us *that* something happened to a session.
//! What the session's payment status actually is always comes from a fresh,
//! authenticated read against Stripe.

#[cfg(any(test, feature = "test-util"))]
mod mock;

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockResolver;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stripe::{CheckoutSession as StripeCheckoutSession, CheckoutSessionId};

use crate::checkout::StripeClient;
use crate::enrollment::PaymentStatus;
use crate::error::{PaymentError, Result};
use crate::money;

/// Authoritative payment state of a checkout session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPayment {
    /// Checkout session id
    pub id: String,

    pub status: PaymentStatus,

    /// Total in major units (`49.99`, not `4999`)
    pub amount_total: Option<Decimal>,

    /// Lowercase ISO currency code
    pub currency: Option<String>,

    /// Payment intent id, once one exists
    pub payment_id: Option<String>,
}

impl ResolvedPayment {
    /// Build from provider values, converting the minor-unit amount
    pub fn from_provider(
        id: impl Into<String>,
        status: PaymentStatus,
        amount_total_minor: Option<i64>,
        currency: Option<String>,
        payment_id: Option<String>,
    ) -> Self {
        let amount_total = match (amount_total_minor, currency.as_deref()) {
            (Some(minor), Some(code)) => Some(money::from_minor(minor, code)),
            (Some(minor), None) => Some(money::from_minor(minor, "usd")),
            (None, _) => None,
        };

        Self {
            id: id.into(),
            status,
            amount_total,
            currency,
            payment_id,
        }
    }
}

/// Source of truth for "is this session paid"
#[async_trait]
pub trait PaymentStatusResolver: Send + Sync {
    async fn resolve(&self, session_id: &str) -> Result<ResolvedPayment>;
}

#[async_trait]
impl PaymentStatusResolver for StripeClient {
    async fn resolve(&self, session_id: &str) -> Result<ResolvedPayment> {
        let id = session_id
            .parse::<CheckoutSessionId>()
            .map_err(|e| PaymentError::InvalidSessionId(format!("{session_id}: {e}")))?;

        let deadline = self.resolve_timeout();
        let session = tokio::time::timeout(
            deadline,
            StripeCheckoutSession::retrieve(self.inner(), &id, &[]),
        )
        .await
        .map_err(|_| PaymentError::ResolveTimeout(deadline))??;

        let resolved = ResolvedPayment::from_provider(
            session.id.to_string(),
            PaymentStatus::from(session.payment_status.as_str()),
            session.amount_total,
            session.currency.map(|c| c.to_string()),
            session.payment_intent.as_ref().map(|p| p.id().to_string()),
        );

        tracing::debug!(
            session_id,
            status = %resolved.status,
            amount = ?resolved.amount_total,
            "Resolved checkout session"
        );

        Ok(resolved)
    }
}
