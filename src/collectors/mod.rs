//! Metric sources polled once per collection cycle.
//!
//! Collectors never return errors. A source that could not be read reports
//! [`Collection::Failed`] and the cycle carries on with the other sources.

pub mod access_log;
pub mod health;
pub mod violations;

pub use access_log::{AccessLogTailer, LogBatch, parse_timestamp};
pub use health::{HealthAnalysis, HealthProber, OverallHealth, analyze_health};
pub use violations::{RateLimitKey, ViolationScanner, parse_rate_limit_key};

/// Outcome of polling one source.
#[derive(Debug, Clone, PartialEq)]
pub enum Collection<T> {
    /// At least one record was read.
    Found(Vec<T>),
    /// The source was reachable but had nothing new.
    Empty,
    /// The source could not be read; nothing was collected.
    Failed { reason: String },
}

impl<T> Collection<T> {
    /// `Found` for a non-empty vector, `Empty` otherwise.
    pub fn from_items(items: Vec<T>) -> Self {
        if items.is_empty() {
            Collection::Empty
        } else {
            Collection::Found(items)
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Collection::Failed {
            reason: reason.into(),
        }
    }

    /// The collected records; empty for `Empty` and `Failed`.
    pub fn items(&self) -> &[T] {
        match self {
            Collection::Found(items) => items,
            _ => &[],
        }
    }

    pub fn into_items(self) -> Vec<T> {
        match self {
            Collection::Found(items) => items,
            _ => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Collection::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_items() {
        assert_eq!(Collection::<i32>::from_items(vec![]), Collection::Empty);
        assert_eq!(Collection::from_items(vec![1, 2]).len(), 2);
    }

    #[test]
    fn test_failed_degrades_to_empty() {
        let failed: Collection<i32> = Collection::failed("timeout");
        assert!(failed.is_failed());
        assert!(failed.is_empty());
        assert!(failed.into_items().is_empty());
    }
}
