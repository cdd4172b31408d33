//! Cohorts: named groups of properties written together

use std::fmt;
use std::sync::Arc;

/// A named group of properties with similar update rates.
///
/// Cohorts carry no data and compare by name; clones are cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cohort {
    name: Arc<str>,
}

impl Cohort {
    pub fn new(name: &str) -> Self {
        Self { name: Arc::from(name) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cohort({})", self.name)
    }
}

impl fmt::Display for Cohort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Ordered set of cohorts used for a read
pub type CohortList = Vec<Cohort>;
