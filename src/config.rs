use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::EngineError;
use crate::http::HttpOptions;
use crate::metrics::{MetricKind, Stat};
use crate::scenario::{
    Executor, Scenario, Stage, DEFAULT_GRACEFUL_RAMP_DOWN, DEFAULT_GRACEFUL_STOP,
    MAX_SCENARIO_SPAN,
};
use crate::threshold::Threshold;

pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
/// Upper bound for a scenario defined only by an iteration count.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(600);

/// A duration given as a string ("30s", "1m30s", "250ms") or a number of seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl<'de> serde::de::Visitor<'de> for V {
            type Value = DurationValue;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 30s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(DurationValue(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(DurationValue(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Duration::try_from_secs_f64(v)
                    .map(DurationValue)
                    .map_err(|_| E::custom("duration must be a non-negative number of seconds in range"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let v = v.trim();
                if v == "0" {
                    return Ok(DurationValue(Duration::ZERO));
                }
                humantime::parse_duration(v)
                    .map(DurationValue)
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(V)
    }
}

fn dur(value: Option<DurationValue>, default: Duration) -> Duration {
    value.map(|d| d.0).unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub duration: DurationValue,
    pub target: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    pub executor: String,
    pub vus: Option<u64>,
    pub duration: Option<DurationValue>,
    pub iterations: Option<u64>,
    #[serde(rename = "startVUs")]
    pub start_vus: Option<u64>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    pub start_rate: Option<u64>,
    pub time_unit: Option<DurationValue>,
    #[serde(rename = "preAllocatedVUs")]
    pub pre_allocated_vus: Option<u64>,
    #[serde(rename = "maxVUs")]
    pub max_vus: Option<u64>,
    pub start_time: Option<DurationValue>,
    pub graceful_stop: Option<DurationValue>,
    pub graceful_ramp_down: Option<DurationValue>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    #[serde(rename_all = "camelCase")]
    Object {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        delay_abort_eval: Option<DurationValue>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ThresholdList {
    One(ThresholdEntry),
    Many(Vec<ThresholdEntry>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsConfig {
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioConfig>,
    pub vus: Option<u64>,
    pub duration: Option<DurationValue>,
    pub iterations: Option<u64>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, ThresholdList>,
    #[serde(default)]
    pub no_connection_reuse: bool,
    pub user_agent: Option<String>,
    pub batch: Option<usize>,
    pub batch_per_host: Option<usize>,
    pub http_timeout: Option<DurationValue>,
    pub setup_timeout: Option<DurationValue>,
    pub teardown_timeout: Option<DurationValue>,
    pub summary_trend_stats: Option<Vec<String>>,
    pub threshold_interval: Option<DurationValue>,
    pub tick: Option<DurationValue>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub scenarios: Vec<Scenario>,
    pub thresholds: Vec<Threshold>,
    pub http: HttpOptions,
    pub setup_timeout: Duration,
    pub teardown_timeout: Duration,
    pub summary_trend_stats: Vec<Stat>,
    pub threshold_interval: Duration,
    /// Granularity at which ramping-vus scenarios converge on their target.
    pub tick: Duration,
    /// Where summary artifacts are written.
    pub output_dir: PathBuf,
}

impl RunOptions {
    pub fn new(scenarios: Vec<Scenario>) -> Self {
        Self {
            scenarios,
            thresholds: Vec::new(),
            http: HttpOptions::default(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            summary_trend_stats: default_trend_stats(),
            threshold_interval: DEFAULT_THRESHOLD_INTERVAL,
            tick: DEFAULT_TICK,
            output_dir: PathBuf::from("."),
        }
    }

    pub fn with_thresholds(mut self, thresholds: Vec<Threshold>) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn planned_duration(&self) -> Duration {
        self.scenarios
            .iter()
            .map(Scenario::end_offset)
            .max()
            .unwrap_or_default()
    }
}

pub fn default_trend_stats() -> Vec<Stat> {
    vec![
        Stat::Avg,
        Stat::Min,
        Stat::Med,
        Stat::Max,
        Stat::Percentile(90.0),
        Stat::Percentile(95.0),
    ]
}

impl OptionsConfig {
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }

    pub fn resolve(&self) -> Result<RunOptions, EngineError> {
        let scenarios = self.resolve_scenarios()?;

        let mut thresholds = Vec::new();
        for (selector, list) in &self.thresholds {
            let entries = match list {
                ThresholdList::One(entry) => std::slice::from_ref(entry),
                ThresholdList::Many(entries) => entries.as_slice(),
            };
            for entry in entries {
                let threshold = match entry {
                    ThresholdEntry::Expr(expr) => Threshold::parse(selector, expr)?,
                    ThresholdEntry::Object {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => {
                        let parsed = Threshold::parse(selector, threshold)?;
                        if *abort_on_fail {
                            parsed.aborting(dur(*delay_abort_eval, Duration::ZERO))
                        } else {
                            parsed
                        }
                    }
                };
                thresholds.push(threshold);
            }
        }

        let summary_trend_stats = match &self.summary_trend_stats {
            None => default_trend_stats(),
            Some(raw) => raw
                .iter()
                .map(|s| {
                    let stat: Stat = s.parse().map_err(EngineError::Config)?;
                    if !MetricKind::Trend.supports(&stat) {
                        return Err(EngineError::config(format!(
                            "summaryTrendStats: `{}` is not a trend statistic",
                            s
                        )));
                    }
                    Ok(stat)
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        let mut http = HttpOptions {
            no_connection_reuse: self.no_connection_reuse,
            ..HttpOptions::default()
        };
        if let Some(ua) = &self.user_agent {
            http.user_agent = ua.clone();
        }
        if let Some(batch) = self.batch {
            http.batch = batch;
        }
        if let Some(per_host) = self.batch_per_host {
            http.batch_per_host = per_host;
        }
        if let Some(timeout) = self.http_timeout {
            http.timeout = timeout.0;
        }
        if http.batch == 0 {
            return Err(EngineError::config("batch must be at least 1"));
        }

        let tick = dur(self.tick, DEFAULT_TICK);
        if tick.is_zero() {
            return Err(EngineError::config("tick must be greater than zero"));
        }
        let threshold_interval = dur(self.threshold_interval, DEFAULT_THRESHOLD_INTERVAL);
        if threshold_interval.is_zero() {
            return Err(EngineError::config(
                "thresholdInterval must be greater than zero",
            ));
        }

        Ok(RunOptions {
            scenarios,
            thresholds,
            http,
            setup_timeout: dur(self.setup_timeout, DEFAULT_SETUP_TIMEOUT),
            teardown_timeout: dur(self.teardown_timeout, DEFAULT_TEARDOWN_TIMEOUT),
            summary_trend_stats,
            threshold_interval,
            tick,
            output_dir: PathBuf::from("."),
        })
    }

    fn resolve_scenarios(&self) -> Result<Vec<Scenario>, EngineError> {
        let shorthand = self.vus.is_some()
            || self.duration.is_some()
            || self.iterations.is_some()
            || !self.stages.is_empty();

        if !self.scenarios.is_empty() {
            if shorthand {
                return Err(EngineError::config(
                    "`scenarios` cannot be combined with top-level vus/duration/iterations/stages",
                ));
            }
            return self
                .scenarios
                .iter()
                .map(|(name, cfg)| resolve_scenario(name, cfg))
                .collect();
        }

        let cfg = if !self.stages.is_empty() {
            ScenarioConfig {
                executor: "ramping-vus".to_string(),
                start_vus: self.vus,
                stages: self.stages.clone(),
                iterations: self.iterations,
                ..ScenarioConfig::default()
            }
        } else {
            ScenarioConfig {
                executor: "constant-vus".to_string(),
                vus: self.vus,
                duration: self.duration,
                iterations: Some(self.iterations.unwrap_or(1)).filter(|_| {
                    self.iterations.is_some() || self.duration.is_none()
                }),
                ..ScenarioConfig::default()
            }
        };
        Ok(vec![resolve_scenario("default", &cfg)?])
    }
}

fn validate_scenario_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::config("scenario name cannot be empty"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_alphanumeric() && !matches!(c, '_' | '-' | '.'))
    {
        return Err(EngineError::config(format!(
            "scenario name `{}` contains invalid character `{}`",
            name, c
        )));
    }
    Ok(())
}

fn resolve_stages(name: &str, stages: &[StageConfig]) -> Result<Vec<Stage>, EngineError> {
    if stages.is_empty() {
        return Err(EngineError::config(format!(
            "scenario `{}` needs at least one stage",
            name
        )));
    }
    Ok(stages
        .iter()
        .map(|s| Stage::new(s.duration.0, s.target))
        .collect())
}

pub fn resolve_scenario(name: &str, cfg: &ScenarioConfig) -> Result<Scenario, EngineError> {
    validate_scenario_name(name)?;
    let executor = match cfg.executor.as_str() {
        "constant-vus" => {
            let duration = match (cfg.duration, cfg.iterations) {
                (Some(d), _) => d.0,
                (None, Some(_)) => DEFAULT_MAX_DURATION,
                (None, None) => {
                    return Err(EngineError::config(format!(
                        "scenario `{}`: constant-vus needs a duration",
                        name
                    )))
                }
            };
            if !cfg.stages.is_empty() {
                warn!(scenario = name, "stages are ignored by constant-vus");
            }
            Executor::ConstantVus {
                vus: cfg.vus.unwrap_or(1),
                duration,
            }
        }
        "ramping-vus" => Executor::RampingVus {
            start_vus: cfg.start_vus.unwrap_or(1),
            stages: resolve_stages(name, &cfg.stages)?,
            graceful_ramp_down: dur(cfg.graceful_ramp_down, DEFAULT_GRACEFUL_RAMP_DOWN),
        },
        "ramping-arrival-rate" => {
            let pre_allocated_vus = cfg.pre_allocated_vus.ok_or_else(|| {
                EngineError::config(format!(
                    "scenario `{}`: ramping-arrival-rate needs preAllocatedVUs",
                    name
                ))
            })?;
            let max_vus = cfg.max_vus.unwrap_or(pre_allocated_vus);
            if max_vus < pre_allocated_vus {
                return Err(EngineError::config(format!(
                    "scenario `{}`: maxVUs ({}) is lower than preAllocatedVUs ({})",
                    name, max_vus, pre_allocated_vus
                )));
            }
            let time_unit = dur(cfg.time_unit, Duration::from_secs(1));
            if time_unit.is_zero() {
                return Err(EngineError::config(format!(
                    "scenario `{}`: timeUnit must be greater than zero",
                    name
                )));
            }
            if cfg.iterations.is_some() {
                warn!(scenario = name, "iterations are ignored by ramping-arrival-rate");
            }
            Executor::RampingArrivalRate {
                start_rate: cfg.start_rate.unwrap_or(0),
                time_unit,
                pre_allocated_vus,
                max_vus,
                stages: resolve_stages(name, &cfg.stages)?,
            }
        }
        other => {
            return Err(EngineError::config(format!(
                "scenario `{}`: unknown executor `{}`",
                name, other
            )))
        }
    };

    let scenario = Scenario {
        name: name.to_string(),
        executor,
        start_time: dur(cfg.start_time, Duration::ZERO),
        graceful_stop: dur(cfg.graceful_stop, DEFAULT_GRACEFUL_STOP),
        tags: cfg.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
        iterations: cfg.iterations,
    };
    check_span(&scenario)?;
    Ok(scenario)
}

pub fn check_span(scenario: &Scenario) -> Result<(), EngineError> {
    if scenario.span() > MAX_SCENARIO_SPAN {
        return Err(EngineError::config(format!(
            "scenario `{}` would run for {}, longer than the {} limit",
            scenario.name,
            humantime::format_duration(scenario.span()),
            humantime::format_duration(MAX_SCENARIO_SPAN)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADVANCED: &str = r#"{
        "scenarios": {
            "smoke_test": {
                "executor": "constant-vus", "vus": 1, "duration": "30s",
                "startTime": "0s", "tags": { "test_type": "smoke" }
            },
            "load_test": {
                "executor": "ramping-vus", "startVUs": 0,
                "stages": [
                    { "duration": "2m", "target": 50 },
                    { "duration": "5m", "target": 50 },
                    { "duration": "2m", "target": 0 }
                ],
                "startTime": "30s", "gracefulRampDown": "30s",
                "tags": { "test_type": "load" }
            },
            "stress_test": {
                "executor": "ramping-arrival-rate", "startRate": 50, "timeUnit": "1s",
                "preAllocatedVUs": 50, "maxVUs": 500,
                "stages": [ { "duration": "2m", "target": 50 }, { "duration": "10m", "target": 0 } ],
                "startTime": "18m", "tags": { "test_type": "stress" }
            }
        },
        "thresholds": {
            "http_req_duration": ["p(95)<500", "p(99)<1000"],
            "http_req_duration{test_type:smoke}": ["p(95)<200"],
            "http_req_failed": ["rate<0.05"],
            "errors": [{ "threshold": "count<100", "abortOnFail": true, "delayAbortEval": "10s" }],
            "http_reqs": "rate>100"
        },
        "noConnectionReuse": false,
        "userAgent": "K6LoadTest/1.0",
        "batch": 10,
        "batchPerHost": 5
    }"#;

    #[test]
    fn resolves_multi_scenario_document() {
        let options = OptionsConfig::from_json(ADVANCED).unwrap().resolve().unwrap();
        assert_eq!(options.scenarios.len(), 3);

        let load = options
            .scenarios
            .iter()
            .find(|s| s.name == "load_test")
            .unwrap();
        assert_eq!(load.start_time, Duration::from_secs(30));
        assert_eq!(load.tags.get("test_type"), Some("load"));
        match &load.executor {
            Executor::RampingVus {
                start_vus,
                stages,
                graceful_ramp_down,
            } => {
                assert_eq!(*start_vus, 0);
                assert_eq!(stages.len(), 3);
                assert_eq!(stages[0].duration, Duration::from_secs(120));
                assert_eq!(*graceful_ramp_down, Duration::from_secs(30));
            }
            other => panic!("unexpected executor {other:?}"),
        }

        let stress = options
            .scenarios
            .iter()
            .find(|s| s.name == "stress_test")
            .unwrap();
        assert_eq!(stress.start_time, Duration::from_secs(18 * 60));
        assert_eq!(stress.executor.max_vus(), 500);

        assert_eq!(options.thresholds.len(), 6);
        let abort = options
            .thresholds
            .iter()
            .find(|t| t.selector.metric == "errors")
            .unwrap();
        assert!(abort.abort_on_fail);
        assert_eq!(abort.delay_abort_eval, Duration::from_secs(10));

        assert_eq!(options.http.user_agent, "K6LoadTest/1.0");
        assert_eq!(options.http.batch, 10);
        assert_eq!(options.http.batch_per_host, 5);
        assert_eq!(options.planned_duration(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn top_level_stages_become_default_scenario() {
        let raw = r#"{
            "stages": [ { "duration": "30s", "target": 10 }, { "duration": "30s", "target": 0 } ],
            "thresholds": { "http_req_failed": ["rate<0.1"] }
        }"#;
        let options = OptionsConfig::from_json(raw).unwrap().resolve().unwrap();
        assert_eq!(options.scenarios.len(), 1);
        assert_eq!(options.scenarios[0].name, "default");
        assert_eq!(options.scenarios[0].executor.kind(), "ramping-vus");
        assert_eq!(options.scenarios[0].executor.vus_at(Duration::ZERO), 1);
    }

    #[test]
    fn empty_document_runs_one_iteration() {
        let options = OptionsConfig::from_json("{}").unwrap().resolve().unwrap();
        let scenario = &options.scenarios[0];
        assert_eq!(scenario.iterations, Some(1));
        assert_eq!(scenario.executor.max_vus(), 1);
    }

    #[test]
    fn durations_accept_numbers_and_strings() {
        let raw = r#"{ "vus": 2, "duration": 1.5, "setupTimeout": "2m", "tick": "100ms" }"#;
        let options = OptionsConfig::from_json(raw).unwrap().resolve().unwrap();
        assert_eq!(options.scenarios[0].executor.duration(), Duration::from_millis(1500));
        assert_eq!(options.scenarios[0].iterations, None);
        assert_eq!(options.setup_timeout, Duration::from_secs(120));
        assert_eq!(options.tick, Duration::from_millis(100));
    }

    #[test]
    fn rejects_invalid_documents() {
        let cases = [
            r#"{ "scenarios": { "a": { "executor": "per-vu-iterations" } } }"#,
            r#"{ "scenarios": { "a": { "executor": "ramping-vus" } } }"#,
            r#"{ "scenarios": { "a b": { "executor": "constant-vus", "duration": "1s" } } }"#,
            r#"{ "scenarios": { "a": { "executor": "ramping-arrival-rate", "stages": [{ "duration": "1s", "target": 1 }] } } }"#,
            r#"{ "scenarios": { "a": { "executor": "ramping-arrival-rate", "preAllocatedVUs": 5, "maxVUs": 2, "stages": [{ "duration": "1s", "target": 1 }] } } }"#,
            r#"{ "scenarios": { "a": { "executor": "constant-vus", "duration": "1s" } }, "vus": 3 }"#,
            r#"{ "thresholds": { "http_req_duration": ["p95<500"] } }"#,
            r#"{ "summaryTrendStats": ["count"] }"#,
        ];
        for raw in cases {
            let result = OptionsConfig::from_json(raw).and_then(|c| c.resolve());
            assert!(result.is_err(), "accepted: {raw}");
        }
        assert!(OptionsConfig::from_json(r#"{ "duration": "soon" }"#).is_err());
        assert!(OptionsConfig::from_json(r#"{ "duration": -1 }"#).is_err());
    }

    #[test]
    fn out_of_range_durations_are_config_errors() {
        assert!(OptionsConfig::from_json(r#"{ "duration": 1e20 }"#).is_err());
        assert!(OptionsConfig::from_json(r#"{ "duration": 1e300 }"#).is_err());

        let far_start = r#"{ "scenarios": { "late": {
            "executor": "constant-vus", "duration": "1s", "startTime": "100000000h"
        } } }"#;
        let result = OptionsConfig::from_json(far_start).unwrap().resolve();
        assert!(matches!(result, Err(EngineError::Config(_))), "{result:?}");

        let long_stages = r#"{ "stages": [
            { "duration": "50000000h", "target": 1 },
            { "duration": "50000000h", "target": 0 }
        ] }"#;
        let result = OptionsConfig::from_json(long_stages).unwrap().resolve();
        assert!(matches!(result, Err(EngineError::Config(_))), "{result:?}");
    }
}
