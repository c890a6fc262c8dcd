//! Bounded `domain` label values

use std::collections::HashSet;

use dashmap::DashSet;

/// Label used once the domain cardinality limit is exhausted
pub const OTHER_DOMAIN: &str = "other";

/// Tracks which domains have been given their own label
#[derive(Debug)]
pub struct DomainLabels {
    seen: DashSet<String>,
    max: usize,
    high_priority: HashSet<String>,
}

impl DomainLabels {
    #[must_use]
    pub fn new(max: usize, high_priority: Vec<String>) -> Self {
        Self {
            seen: DashSet::new(),
            max,
            high_priority: high_priority
                .into_iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        }
    }

    /// The label to attach for `domain`
    ///
    /// The limit is soft under concurrent first sightings; it may be overshot by
    /// the number of racing callers.
    #[must_use]
    pub fn label(&self, domain: &str) -> String {
        if self.high_priority.contains(domain) || self.seen.contains(domain) {
            return domain.to_string();
        }

        if self.seen.len() < self.max {
            self.seen.insert(domain.to_string());
            return domain.to_string();
        }

        OTHER_DOMAIN.to_string()
    }
}
