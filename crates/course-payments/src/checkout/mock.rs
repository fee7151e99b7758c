//! Mock Checkout Provider
//!
//! Records every request and hands back synthetic `cs_test_*` sessions.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{CheckoutProvider, CheckoutSession, SessionRequest};
use crate::error::{PaymentError, Result};

#[derive(Default)]
pub struct MockCheckoutProvider {
    requests: Mutex<Vec<SessionRequest>>,
    counter: AtomicU64,
    failing: AtomicBool,
}

impl MockCheckoutProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Requests received so far
    pub async fn requests(&self) -> Vec<SessionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl CheckoutProvider for MockCheckoutProvider {
    async fn create_session(&self, request: &SessionRequest) -> Result<CheckoutSession> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PaymentError::Stripe("mock: card_declined".into()));
        }

        self.requests.lock().await.push(request.clone());

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("cs_test_{n}");
        Ok(CheckoutSession {
            url: format!("https://checkout.example.test/pay/{id}"),
            id,
        })
    }
}
