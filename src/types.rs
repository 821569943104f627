use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metrics::MetricKind;
use crate::threshold::ThresholdResult;

/// Environment overrides, read with the `STRESS_` prefix.
#[derive(Deserialize, Debug, Default)]
pub struct EnvConfig {
    pub base_url: Option<String>,
    pub bearer_token: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct MetricSummary {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub values: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub thresholds: BTreeMap<String, bool>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub group: String,
    pub name: String,
    pub passes: u64,
    pub fails: u64,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct ScenarioReport {
    pub name: String,
    pub executor: String,
    pub iterations_completed: u64,
    pub iterations_interrupted: u64,
    pub iteration_errors: u64,
    pub dropped_iterations: u64,
    /// False when the run was stopped before the scenario's start time.
    pub started: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct RunSummary {
    pub duration_ms: f64,
    pub passed: bool,
    /// Why the run stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub checks: Vec<CheckSummary>,
    pub thresholds: Vec<ThresholdResult>,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunSummary {
    pub fn failed_checks(&self) -> u64 {
        self.checks.iter().map(|c| c.fails).sum()
    }

    pub fn passed_checks(&self) -> u64 {
        self.checks.iter().map(|c| c.passes).sum()
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    pub fn metric_value(&self, metric: &str, stat: &str) -> Option<f64> {
        self.metrics.get(metric)?.values.get(stat).copied()
    }

    pub fn scenario(&self, name: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|s| s.name == name)
    }
}
