//! Application State

use std::sync::Arc;

use course_payments::{
    CheckoutService, EnrollmentStore, PaymentStatusResolver, ReconciliationEngine,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Enrollment records (always available)
    pub store: Arc<dyn EnrollmentStore>,

    /// Checkout flow (None if Stripe is not configured)
    pub checkout: Option<Arc<CheckoutService>>,

    /// Webhook reconciliation (None if Stripe is not configured)
    pub reconciler: Option<Arc<ReconciliationEngine>>,

    /// Direct session lookups for the payment-status endpoint
    pub resolver: Option<Arc<dyn PaymentStatusResolver>>,
}
