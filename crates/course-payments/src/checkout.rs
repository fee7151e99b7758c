//! Stripe Checkout Integration
//!
//! Creates hosted Checkout sessions for one-off course purchases and records
//! the buyer's pending enrollment.

#[cfg(any(test, feature = "test-util"))]
mod mock;

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockCheckoutProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stripe::{
    CheckoutSession as StripeCheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, CreateCheckoutSessionPaymentMethodTypes,
    Currency,
};

use crate::config::PaymentsConfig;
use crate::course::{Course, CourseCatalog};
use crate::enrollment::EnrollmentStore;
use crate::error::{PaymentError, Result};
use crate::money;

/// Stripe client wrapper
pub struct StripeClient {
    client: Client,
    resolve_timeout: Duration,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(secret_key: &str, resolve_timeout: Duration) -> Self {
        Self {
            client: Client::new(secret_key),
            resolve_timeout,
        }
    }

    /// Create from configuration; fails if no secret key is set
    pub fn from_config(config: &PaymentsConfig) -> Result<Self> {
        Ok(Self::new(config.require_secret_key()?, config.resolve_timeout))
    }

    /// Deadline for session lookups
    pub fn resolve_timeout(&self) -> Duration {
        self.resolve_timeout
    }

    /// Get the underlying Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Request to open a checkout session for one course
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRequest {
    pub course: Course,

    /// Buyer, recorded in session metadata
    pub user_id: i64,

    /// URL to redirect after successful payment
    pub success_url: String,

    /// URL to redirect if checkout is cancelled
    pub cancel_url: String,
}

/// Result of creating a checkout session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Stripe session ID
    pub id: String,

    /// URL to redirect user to
    pub url: String,
}

/// Anything that can open a hosted checkout page
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn create_session(&self, request: &SessionRequest) -> Result<CheckoutSession>;
}

#[async_trait]
impl CheckoutProvider for StripeClient {
    async fn create_session(&self, request: &SessionRequest) -> Result<CheckoutSession> {
        let unit_amount = money::to_minor(request.course.price, &Currency::USD.to_string())?;

        let mut params = CreateCheckoutSession::new();
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.mode = Some(CheckoutSessionMode::Payment);
        params.payment_method_types = Some(vec![CreateCheckoutSessionPaymentMethodTypes::Card]);

        // Add metadata for tracking
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), request.user_id.to_string());
        metadata.insert("course_id".to_string(), request.course.id.to_string());
        params.metadata = Some(metadata);

        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            quantity: Some(1),
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: Currency::USD,
                unit_amount: Some(unit_amount),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: request.course.title.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let session = StripeCheckoutSession::create(&self.client, params).await?;

        let url = session
            .url
            .ok_or_else(|| PaymentError::Stripe("No checkout URL returned".into()))?;

        Ok(CheckoutSession {
            id: session.id.to_string(),
            url,
        })
    }
}

/// Checkout flow: course lookup, provider session, pending enrollment
pub struct CheckoutService {
    provider: Arc<dyn CheckoutProvider>,
    catalog: Arc<dyn CourseCatalog>,
    store: Arc<dyn EnrollmentStore>,
    success_url: String,
    cancel_url: String,
}

impl CheckoutService {
    pub fn new(
        provider: Arc<dyn CheckoutProvider>,
        catalog: Arc<dyn CourseCatalog>,
        store: Arc<dyn EnrollmentStore>,
        config: &PaymentsConfig,
    ) -> Self {
        Self {
            provider,
            catalog,
            store,
            success_url: config.success_url(),
            cancel_url: config.cancel_url(),
        }
    }

    /// Open a Stripe checkout for `course_id` and record a pending enrollment
    ///
    /// Returns the hosted checkout URL to redirect the user to. Repeated calls
    /// create repeated sessions and enrollments.
    pub async fn create_checkout(&self, user_id: i64, course_id: i64) -> Result<CheckoutSession> {
        let course = self
            .catalog
            .find(course_id)
            .await?
            .ok_or(PaymentError::CourseNotFound(course_id))?;

        let request = SessionRequest {
            course,
            user_id,
            success_url: self.success_url.clone(),
            cancel_url: self.cancel_url.clone(),
        };
        let session = self.provider.create_session(&request).await?;

        let enrollment = self
            .store
            .create_pending(user_id, course_id, &session.id)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    session_id = %session.id,
                    user_id,
                    course_id,
                    error = %e,
                    "Checkout session created but enrollment was not recorded"
                );
            })?;

        tracing::info!(
            session_id = %session.id,
            enrollment_id = enrollment.id,
            user_id,
            course_id,
            "Created checkout session"
        );

        Ok(session)
    }

    /// Whether the session's enrollment has been marked paid
    pub async fn is_payment_success(&self, session_id: &str) -> Result<bool> {
        self.store.is_paid(session_id).await
    }
}
