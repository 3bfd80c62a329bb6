//! Health reporting for sync runtimes
//!
//! A runtime reports one [`HealthCheck`] per component (push channel, cache,
//! durable store) and folds them into a [`HealthReport`].

use crate::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health status for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Operational with reduced freshness (e.g. polling-only)
    Degraded,
    /// Component is not operational
    Unhealthy,
    /// Not yet checked
    Unknown,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }

    /// The more severe of two statuses.
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Health of a single component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub component: String,
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl HealthCheck {
    fn with_status(status: HealthStatus, component: String, message: Option<String>) -> Self {
        Self {
            status,
            component,
            message,
            metadata: HashMap::new(),
        }
    }

    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, component.into(), None)
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(
            HealthStatus::Degraded,
            component.into(),
            Some(message.into()),
        )
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(
            HealthStatus::Unhealthy,
            component.into(),
            Some(message.into()),
        )
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Aggregate health of a runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub checked_at: Timestamp,
}

impl HealthReport {
    /// Fold component checks; an empty report is `Unknown`.
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .reduce(HealthStatus::worst)
            .unwrap_or(HealthStatus::Unknown);
        Self {
            status,
            checks,
            checked_at: Utc::now(),
        }
    }

    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_takes_worst_status() {
        let report = HealthReport::from_checks(vec![
            HealthCheck::healthy("cache"),
            HealthCheck::degraded("push", "polling only"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(
            report.check("push").and_then(|c| c.message.as_deref()),
            Some("polling only")
        );
    }

    #[test]
    fn test_empty_report_is_unknown() {
        assert_eq!(
            HealthReport::from_checks(Vec::new()).status,
            HealthStatus::Unknown
        );
    }

    #[test]
    fn test_check_metadata_serializes() {
        let check = HealthCheck::unhealthy("durable_store", "read-only filesystem")
            .with_metadata("entries", json!(0));
        let value = serde_json::to_value(&check).expect("check should serialize");
        assert_eq!(value["status"], "unhealthy");
        assert_eq!(value["metadata"]["entries"], 0);
    }
}
