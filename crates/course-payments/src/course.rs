//! Course Catalog
//!
//! Checkout needs a course's title and price; where courses live is not this
//! crate's business, so lookups go through [`CourseCatalog`].

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{PaymentError, Result};

/// A purchasable course
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub title: String,
    /// Price in USD major units
    pub price: Decimal,
}

#[async_trait]
pub trait CourseCatalog: Send + Sync {
    async fn find(&self, course_id: i64) -> Result<Option<Course>>;
}

/// Static in-memory catalog
#[derive(Default)]
pub struct MemoryCourseCatalog {
    courses: HashMap<i64, Course>,
}

impl MemoryCourseCatalog {
    pub fn new(courses: impl IntoIterator<Item = Course>) -> Self {
        Self {
            courses: courses.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    /// Load a JSON array of courses
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PaymentError::Config(format!("cannot read course catalog {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let courses: Vec<Course> = serde_json::from_str(raw)
            .map_err(|e| PaymentError::Config(format!("invalid course catalog: {e}")))?;
        if let Some(bad) = courses.iter().find(|c| c.price.is_sign_negative()) {
            return Err(PaymentError::Config(format!(
                "course {} has a negative price",
                bad.id
            )));
        }
        Ok(Self::new(courses))
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }
}

#[async_trait]
impl CourseCatalog for MemoryCourseCatalog {
    async fn find(&self, course_id: i64) -> Result<Option<Course>> {
        Ok(self.courses.get(&course_id).cloned())
    }
}
