//! Payments Configuration
//!
//! Everything the payment components need from the process environment,
//! read once at startup and passed in explicitly.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PaymentError, Result};
use crate::lock::DEFAULT_LOCK_TTL;

/// Default deadline for a single Stripe session lookup
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_FRONTEND_URL: &str = "http://localhost:5173";

#[derive(Clone, Debug)]
pub struct PaymentsConfig {
    /// `STRIPE_SECRET_KEY`; payments are disabled without it
    pub stripe_secret_key: Option<String>,

    /// `STRIPE_WEBHOOK_SECRET`; enables webhook signature checks
    pub webhook_secret: Option<String>,

    /// `FRONTEND_URL`, base for checkout success/cancel redirects
    pub frontend_url: String,

    /// `WEBHOOK_LOCK_TTL_SECS`
    pub lock_ttl: Duration,

    /// `STRIPE_RESOLVE_TIMEOUT_SECS`
    pub resolve_timeout: Duration,

    /// `REDIS_URL`; selects the Redis lock backend when set
    pub redis_url: Option<String>,

    /// `COURSE_CATALOG`, path to a JSON array of courses
    pub course_catalog_path: Option<PathBuf>,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            stripe_secret_key: None,
            webhook_secret: None,
            frontend_url: DEFAULT_FRONTEND_URL.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            redis_url: None,
            course_catalog_path: None,
        }
    }
}

impl PaymentsConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let frontend_url = get("FRONTEND_URL")
            .unwrap_or_else(|| DEFAULT_FRONTEND_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !frontend_url.starts_with("http://") && !frontend_url.starts_with("https://") {
            return Err(PaymentError::Config(format!(
                "FRONTEND_URL must be an http(s) URL, got {frontend_url}"
            )));
        }

        let lock_ttl = secs(get("WEBHOOK_LOCK_TTL_SECS"), "WEBHOOK_LOCK_TTL_SECS")?
            .unwrap_or(DEFAULT_LOCK_TTL);
        let resolve_timeout = secs(
            get("STRIPE_RESOLVE_TIMEOUT_SECS"),
            "STRIPE_RESOLVE_TIMEOUT_SECS",
        )?
        .unwrap_or(DEFAULT_RESOLVE_TIMEOUT);
        check_timeouts(lock_ttl, resolve_timeout)?;

        Ok(Self {
            stripe_secret_key: get("STRIPE_SECRET_KEY"),
            webhook_secret: get("STRIPE_WEBHOOK_SECRET"),
            frontend_url,
            lock_ttl,
            resolve_timeout,
            redis_url: get("REDIS_URL"),
            course_catalog_path: get("COURSE_CATALOG").map(PathBuf::from),
        })
    }

    /// Secret key, or a configuration error if payments are disabled
    pub fn require_secret_key(&self) -> Result<&str> {
        self.stripe_secret_key
            .as_deref()
            .ok_or_else(|| PaymentError::Config("STRIPE_SECRET_KEY not set".into()))
    }

    pub fn success_url(&self) -> String {
        format!(
            "{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.frontend_url
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/checkout/cancel", self.frontend_url)
    }
}

/// A Stripe lookup must finish while the webhook lock is still held
pub(crate) fn check_timeouts(lock_ttl: Duration, resolve_timeout: Duration) -> Result<()> {
    if resolve_timeout >= lock_ttl {
        return Err(PaymentError::Config(format!(
            "STRIPE_RESOLVE_TIMEOUT_SECS ({}s) must be shorter than WEBHOOK_LOCK_TTL_SECS ({}s)",
            resolve_timeout.as_secs(),
            lock_ttl.as_secs()
        )));
    }
    Ok(())
}

fn secs(value: Option<String>, name: &str) -> Result<Option<Duration>> {
    value
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .ok()
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    PaymentError::Config(format!("{name} must be a positive integer, got {v}"))
                })
        })
        .transpose()
}
