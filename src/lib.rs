//! Scenario-driven HTTP load generation.
//!
//! A run executes a [`Workload`] under one or more [`Scenario`]s, collects
//! samples into a run-scoped [`MetricsRegistry`] and judges the result with
//! [`Threshold`]s.

pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod plan;
pub mod scenario;
pub mod scheduler;
pub mod summary;
pub mod tags;
pub mod threshold;
pub mod types;
pub mod vu;

pub use config::{OptionsConfig, RunOptions};
pub use engine::{Engine, RunOutcome};
pub use error::{EngineError, HttpError, WorkloadError};
pub use http::{HttpClient, HttpOptions, HttpRequest, HttpResponse, ReqwestClient};
pub use metrics::{Metric, MetricKind, MetricsRegistry, Stat};
pub use scenario::{Executor, Scenario, Stage};
pub use tags::TagSet;
pub use threshold::{Threshold, ThresholdResult};
pub use types::{EnvConfig, RunSummary};
pub use vu::{VuContext, Workload};
