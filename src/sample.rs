use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single telemetry measurement submitted for recording.
///
/// The required fields identify the measured resource, the metric
/// stream, and the caller. Anything else in the submitted JSON is kept
/// in `extra` and is visible to attribute extraction rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub resource_id: String,
    pub counter_name: String,
    pub project_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub counter_volume: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Sample {
    /// JSON view of the sample, used by attribute extraction lookups.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A single point shipped to the metrics store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}
