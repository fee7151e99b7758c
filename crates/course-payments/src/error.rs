//! Payment Error Types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Payment-related errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Stripe API error
    #[error("Stripe error: {0}")]
    Stripe(String),

    /// Stripe did not answer within the configured deadline
    #[error("Stripe request timed out after {0:?}")]
    ResolveTimeout(std::time::Duration),

    /// Not a checkout session identifier
    #[error("Invalid checkout session id: {0}")]
    InvalidSessionId(String),

    /// Webhook signature verification failed
    #[error("Webhook signature invalid: {0}")]
    WebhookSignature(String),

    /// Webhook payload parsing failed
    #[error("Webhook parse error: {0}")]
    WebhookParse(String),

    /// Lock backend unavailable
    #[error("Lock backend error: {0}")]
    LockBackend(String),

    /// Enrollment not found
    #[error("Enrollment not found: {0}")]
    EnrollmentNotFound(String),

    /// Course not found
    #[error("Course not found: {0}")]
    CourseNotFound(i64),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl PaymentError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::Stripe(_)
                | PaymentError::ResolveTimeout(_)
                | PaymentError::LockBackend(_)
                | PaymentError::Storage(_)
        )
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> &str {
        match self {
            PaymentError::Stripe(_) | PaymentError::ResolveTimeout(_) => {
                "Payment processing failed. Please try again."
            }
            PaymentError::InvalidSessionId(_) => "Unknown checkout session.",
            PaymentError::CourseNotFound(_) => "Course not found.",
            PaymentError::Config(_) => "Service configuration error.",
            PaymentError::LockBackend(_) | PaymentError::Storage(_) => {
                "Service temporarily unavailable."
            }
            _ => "An error occurred processing your request.",
        }
    }
}

impl From<stripe::StripeError> for PaymentError {
    fn from(err: stripe::StripeError) -> Self {
        PaymentError::Stripe(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for PaymentError {
    fn from(err: redis::RedisError) -> Self {
        PaymentError::LockBackend(err.to_string())
    }
}
