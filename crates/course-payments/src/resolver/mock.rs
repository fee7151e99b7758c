//! Mock Payment Status Resolver
//!
//! For tests and local runs without Stripe credentials. Sessions are seeded
//! by hand; an optional gate holds `resolve` open so tests can overlap
//! deliveries deterministically.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, RwLock, Semaphore};

use super::{PaymentStatusResolver, ResolvedPayment};
use crate::error::{PaymentError, Result};

#[derive(Default)]
pub struct MockResolver {
    sessions: RwLock<HashMap<String, ResolvedPayment>>,
    failing: AtomicBool,
    calls: AtomicUsize,
    entered: Notify,
    gate: Option<Arc<Semaphore>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block every `resolve` until the semaphore hands out a permit
    pub fn with_gate(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub async fn insert(&self, payment: ResolvedPayment) {
        self.sessions.write().await.insert(payment.id.clone(), payment);
    }

    /// Make every call fail as if Stripe were unreachable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `resolve` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Completes once some call has entered `resolve`
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }
}

#[async_trait]
impl PaymentStatusResolver for MockResolver {
    async fn resolve(&self, session_id: &str) -> Result<ResolvedPayment> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| PaymentError::Stripe("mock gate closed".into()))?;
            permit.forget();
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(PaymentError::Stripe("mock: connection refused".into()));
        }

        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| PaymentError::Stripe(format!("No such checkout.session: {session_id}")))
    }
}
