//! Enrollment Records
//!
//! An enrollment links a user, a course and the Stripe checkout session that
//! pays for it. Rows are created `pending` before any money moves and are only
//! ever mutated by webhook reconciliation.
//!
//! Duplicate `(user_id, course_id)` rows are allowed: two quick checkout
//! clicks produce two pending rows, each tied to its own session. Readers that
//! need one enrollment per user and course go through
//! [`EnrollmentStore::find_for_user_course`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::RwLock;

use crate::error::{PaymentError, Result};

/// Payment status of an enrollment
///
/// Mirrors Stripe's checkout session `payment_status`, plus the local
/// `pending` state rows start in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Unpaid,
    NoPaymentRequired,
    /// Any status the provider reports that we don't model
    Other(String),
}

impl PaymentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::NoPaymentRequired => "no_payment_required",
            PaymentStatus::Other(s) => s,
        }
    }

    pub fn is_paid(&self) -> bool {
        *self == PaymentStatus::Paid
    }
}

impl From<&str> for PaymentStatus {
    fn from(s: &str) -> Self {
        match s {
            "pending" => PaymentStatus::Pending,
            "paid" => PaymentStatus::Paid,
            "unpaid" => PaymentStatus::Unpaid,
            "no_payment_required" => PaymentStatus::NoPaymentRequired,
            other => PaymentStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for PaymentStatus {
    fn from(s: String) -> Self {
        PaymentStatus::from(s.as_str())
    }
}

impl From<PaymentStatus> for String {
    fn from(status: PaymentStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enrollment record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Surrogate id, assigned in creation order
    pub id: u64,

    pub user_id: i64,

    pub course_id: i64,

    /// Stripe checkout session id, the join key for webhooks
    pub stripe_session_id: Option<String>,

    pub payment_status: PaymentStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Enrollment storage trait
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Insert a new `pending` enrollment. Never fails on duplicates.
    async fn create_pending(
        &self,
        user_id: i64,
        course_id: i64,
        session_id: &str,
    ) -> Result<Enrollment>;

    /// First enrollment carrying `session_id`.
    ///
    /// If several rows share a session id, the one with the lowest `id`
    /// (earliest created) wins.
    async fn find_by_session_id(&self, session_id: &str) -> Result<Option<Enrollment>>;

    /// Overwrite the payment status. Repeating the same status is a no-op
    /// apart from `updated_at`.
    async fn update_status(
        &self,
        enrollment: &Enrollment,
        status: PaymentStatus,
    ) -> Result<Enrollment>;

    /// True iff some enrollment with this session id is exactly `paid`
    async fn is_paid(&self, session_id: &str) -> Result<bool>;

    /// Deduplicated view of a user's enrollment in a course: a paid row if
    /// there is one, otherwise the most recently created.
    async fn find_for_user_course(&self, user_id: i64, course_id: i64)
    -> Result<Option<Enrollment>>;
}

#[derive(Default)]
struct Rows {
    next_id: u64,
    enrollments: Vec<Enrollment>,
}

/// In-memory enrollment store (for development and tests)
#[derive(Default)]
pub struct MemoryEnrollmentStore {
    rows: RwLock<Rows>,
}

impl MemoryEnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row in creation order
    pub async fn snapshot(&self) -> Vec<Enrollment> {
        self.rows.read().await.enrollments.clone()
    }
}

#[async_trait]
impl EnrollmentStore for MemoryEnrollmentStore {
    async fn create_pending(
        &self,
        user_id: i64,
        course_id: i64,
        session_id: &str,
    ) -> Result<Enrollment> {
        let mut rows = self.rows.write().await;
        rows.next_id += 1;

        let now = Utc::now();
        let enrollment = Enrollment {
            id: rows.next_id,
            user_id,
            course_id,
            stripe_session_id: Some(session_id.to_string()),
            payment_status: PaymentStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        rows.enrollments.push(enrollment.clone());

        tracing::debug!(
            enrollment_id = enrollment.id,
            user_id,
            course_id,
            session_id,
            "Created pending enrollment"
        );

        Ok(enrollment)
    }

    async fn find_by_session_id(&self, session_id: &str) -> Result<Option<Enrollment>> {
        let rows = self.rows.read().await;
        // rows are kept in id order, so the first hit is the lowest id
        Ok(rows
            .enrollments
            .iter()
            .find(|e| e.stripe_session_id.as_deref() == Some(session_id))
            .cloned())
    }

    async fn update_status(
        &self,
        enrollment: &Enrollment,
        status: PaymentStatus,
    ) -> Result<Enrollment> {
        let mut rows = self.rows.write().await;
        let row = rows
            .enrollments
            .iter_mut()
            .find(|e| e.id == enrollment.id)
            .ok_or_else(|| PaymentError::EnrollmentNotFound(enrollment.id.to_string()))?;

        row.payment_status = status;
        row.updated_at = Utc::now();

        Ok(row.clone())
    }

    async fn is_paid(&self, session_id: &str) -> Result<bool> {
        let rows = self.rows.read().await;
        Ok(rows.enrollments.iter().any(|e| {
            e.stripe_session_id.as_deref() == Some(session_id) && e.payment_status.is_paid()
        }))
    }

    async fn find_for_user_course(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<Option<Enrollment>> {
        let rows = self.rows.read().await;
        let mut matching = rows
            .enrollments
            .iter()
            .filter(|e| e.user_id == user_id && e.course_id == course_id);

        let preferred = matching
            .clone()
            .find(|e| e.payment_status.is_paid())
            .or_else(|| matching.next_back());

        Ok(preferred.cloned())
    }
}
