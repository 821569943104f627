// End-to-end runs of the engine on virtual time, with an in-process HTTP client.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use scenario_stress::scenario::DEFAULT_GRACEFUL_STOP;
use scenario_stress::{
    Engine, EngineError, Executor, HttpClient, HttpError, HttpRequest, HttpResponse, RunOptions,
    RunSummary, Scenario, Stage, TagSet, Threshold, VuContext, Workload, WorkloadError,
};

struct Ok200;

#[async_trait]
impl HttpClient for Ok200 {
    async fn send(&self, _request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        Ok(HttpResponse::new(200).with_elapsed(Duration::from_millis(10)))
    }
}

#[derive(Default)]
struct Recorder {
    iteration_sleep: Duration,
    check_passes: bool,
    fail_setup: bool,
    setup_delay: Duration,
    export_json: bool,
    iterations: Arc<AtomicU64>,
    teardown_ran: Arc<AtomicBool>,
    starts: Arc<Mutex<Vec<(String, Duration)>>>,
}

impl Recorder {
    fn sleeping(iteration_sleep: Duration) -> Self {
        Self {
            iteration_sleep,
            check_passes: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Workload for Recorder {
    type Data = String;

    async fn setup(&self, _ctx: &mut VuContext) -> Result<String, WorkloadError> {
        tokio::time::sleep(self.setup_delay).await;
        if self.fail_setup {
            return Err("auth service unreachable".into());
        }
        Ok("token-123".to_string())
    }

    async fn iteration(&self, vu: &mut VuContext, data: &String) -> Result<(), WorkloadError> {
        if data != "token-123" {
            return Err("setup data did not reach the iteration".into());
        }
        self.iterations.fetch_add(1, Ordering::SeqCst);
        self.starts
            .lock()
            .push((vu.scenario().to_string(), vu.elapsed()));
        let response = vu.get("http://api.test/items").await;
        vu.check("status is 200", self.check_passes && response.status == 200);
        vu.sleep(self.iteration_sleep).await;
        Ok(())
    }

    async fn teardown(&self, _ctx: &mut VuContext, data: &String) -> Result<(), WorkloadError> {
        assert_eq!(data, "token-123");
        self.teardown_ran.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn handle_summary(&self, summary: &RunSummary) -> Option<BTreeMap<String, String>> {
        if !self.export_json {
            return None;
        }
        let json = serde_json::to_string_pretty(summary).ok()?;
        Some(BTreeMap::from([
            ("reports/summary.json".to_string(), json),
            ("stdout".to_string(), "summary exported\n".to_string()),
        ]))
    }
}

fn constant(name: &str, vus: u64, secs: u64) -> Scenario {
    Scenario::new(
        name,
        Executor::ConstantVus {
            vus,
            duration: Duration::from_secs(secs),
        },
    )
}

fn engine(options: RunOptions, recorder: Recorder) -> Engine<Recorder> {
    Engine::with_http_client(options, recorder, Arc::new(Ok200))
}

#[tokio::test(start_paused = true)]
async fn failing_check_fails_verdict_but_run_completes() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder {
        iteration_sleep: Duration::from_millis(1500),
        check_passes: false,
        ..Recorder::default()
    };
    let teardown_ran = recorder.teardown_ran.clone();
    let options = RunOptions::new(vec![constant("default", 1, 1)])
        .with_thresholds(vec![Threshold::parse("checks", "rate==1").unwrap()])
        .with_output_dir(dir.path());

    let outcome = engine(options, recorder).run().await.unwrap();

    assert_eq!(outcome.summary.failed_checks(), 1);
    assert_eq!(outcome.summary.passed_checks(), 0);
    assert!(!outcome.passed());
    assert!(teardown_ran.load(Ordering::SeqCst));
    let report = outcome.summary.scenario("default").unwrap();
    assert_eq!(report.iterations_completed, 1);
    assert_eq!(report.iteration_errors, 0);
    assert_eq!(outcome.summary.metric_value("http_reqs", "count"), Some(1.0));
    assert!(outcome.artifacts.contains_key("stdout"));
}

#[tokio::test(start_paused = true)]
async fn setup_failure_starts_no_vus_and_skips_teardown() {
    let recorder = Recorder {
        fail_setup: true,
        ..Recorder::sleeping(Duration::from_millis(100))
    };
    let iterations = recorder.iterations.clone();
    let teardown_ran = recorder.teardown_ran.clone();
    let engine = engine(RunOptions::new(vec![constant("default", 5, 10)]), recorder);
    let registry = engine.registry().clone();

    let err = engine.run().await.unwrap_err();

    assert!(matches!(err, EngineError::Setup(_)));
    assert!(err.is_fatal());
    assert_eq!(iterations.load(Ordering::SeqCst), 0);
    assert!(!teardown_ran.load(Ordering::SeqCst));
    assert!(!registry.has_samples("vus"));
    assert!(!registry.has_samples("iterations"));
}

#[tokio::test(start_paused = true)]
async fn setup_timeout_is_fatal() {
    let recorder = Recorder {
        setup_delay: Duration::from_secs(10),
        ..Recorder::sleeping(Duration::ZERO)
    };
    let mut options = RunOptions::new(vec![constant("default", 1, 1)]);
    options.setup_timeout = Duration::from_secs(1);

    let err = engine(options, recorder).run().await.unwrap_err();
    assert!(matches!(err, EngineError::SetupTimeout(d) if d == Duration::from_secs(1)));
}

#[tokio::test(start_paused = true)]
async fn saturated_arrival_rate_drops_iterations() {
    let recorder = Recorder::sleeping(Duration::from_millis(500));
    let scenario = Scenario::new(
        "spike",
        Executor::RampingArrivalRate {
            start_rate: 10,
            time_unit: Duration::from_secs(1),
            pre_allocated_vus: 1,
            max_vus: 1,
            stages: vec![Stage::new(Duration::from_secs(1), 10)],
        },
    );

    let outcome = engine(RunOptions::new(vec![scenario]), recorder).run().await.unwrap();

    let report = outcome.summary.scenario("spike").unwrap();
    assert!(report.dropped_iterations >= 1, "{:?}", report);
    assert_eq!(report.iterations_completed + report.dropped_iterations, 10);
    assert_eq!(
        outcome.summary.metric_value("dropped_iterations", "count"),
        Some(report.dropped_iterations as f64)
    );
    assert_eq!(outcome.summary.metric_value("vus_max", "max"), Some(1.0));
}

fn ramp_down(graceful_ramp_down: Duration) -> Scenario {
    Scenario::new(
        "ramp",
        Executor::RampingVus {
            start_vus: 1,
            stages: vec![
                Stage::new(Duration::from_secs(1), 1),
                Stage::new(Duration::from_secs(1), 0),
            ],
            graceful_ramp_down,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn ramp_down_lets_iteration_finish_within_budget() {
    let recorder = Recorder::sleeping(Duration::from_millis(1250));
    let options = RunOptions::new(vec![ramp_down(Duration::from_secs(5))])
        .with_tick(Duration::from_millis(100));

    let outcome = engine(options, recorder).run().await.unwrap();

    let report = outcome.summary.scenario("ramp").unwrap();
    assert_eq!(report.iterations_completed, 2);
    assert_eq!(report.iterations_interrupted, 0);
}

#[tokio::test(start_paused = true)]
async fn ramp_down_cancels_iteration_past_budget() {
    let recorder = Recorder::sleeping(Duration::from_millis(1250));
    let options = RunOptions::new(vec![ramp_down(Duration::from_millis(300))])
        .with_tick(Duration::from_millis(100));

    let outcome = engine(options, recorder).run().await.unwrap();

    let report = outcome.summary.scenario("ramp").unwrap();
    assert_eq!(report.iterations_completed, 1);
    assert_eq!(report.iterations_interrupted, 1);
    assert!(outcome.summary.duration_ms < 2500.0);
}

#[tokio::test(start_paused = true)]
async fn overlapping_scenarios_share_one_clock() {
    let recorder = Recorder::sleeping(Duration::from_millis(300));
    let starts = recorder.starts.clone();
    let late = constant("late", 1, 2)
        .starting_at(Duration::from_secs(1))
        .with_tag("test_type", "load");
    let options = RunOptions::new(vec![constant("early", 1, 2), late]);

    let outcome = engine(options, recorder).run().await.unwrap();

    let starts = starts.lock().clone();
    let of = |name: &str| -> Vec<Duration> {
        starts
            .iter()
            .filter(|(s, _)| s == name)
            .map(|(_, t)| *t)
            .collect()
    };
    let early = of("early");
    let late = of("late");
    assert_eq!(early.len(), 7);
    assert_eq!(late.len(), 7);
    assert!(late.iter().all(|t| *t >= Duration::from_secs(1)));
    // Both populations were active between 1s and 2s.
    assert!(early.iter().any(|t| *t > late[0]));

    let registry_count = outcome.summary.scenario("late").unwrap().iterations_completed;
    assert_eq!(registry_count, 7);
    assert!(outcome.summary.duration_ms >= 3000.0);
}

#[tokio::test(start_paused = true)]
async fn abort_on_fail_threshold_stops_the_run() {
    let recorder = Recorder {
        iteration_sleep: Duration::from_millis(100),
        check_passes: false,
        ..Recorder::default()
    };
    let teardown_ran = recorder.teardown_ran.clone();
    let threshold = Threshold::parse("checks", "rate>0.9")
        .unwrap()
        .aborting(Duration::from_secs(1));
    let options =
        RunOptions::new(vec![constant("default", 2, 60)]).with_thresholds(vec![threshold]);

    let outcome = engine(options, recorder).run().await.unwrap();

    assert!(outcome.summary.aborted.is_some());
    assert!(!outcome.passed());
    assert!(teardown_ran.load(Ordering::SeqCst));
    assert!(outcome.summary.duration_ms < 3000.0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_signal_stops_gracefully() {
    let recorder = Recorder::sleeping(Duration::from_millis(200));
    let teardown_ran = recorder.teardown_ran.clone();
    let options = RunOptions::new(vec![
        constant("now", 1, 60),
        constant("later", 1, 60).starting_at(Duration::from_secs(30)),
    ]);

    let outcome = engine(options, recorder)
        .run_with_shutdown(tokio::time::sleep(Duration::from_secs(1)))
        .await
        .unwrap();

    assert_eq!(outcome.summary.aborted.as_deref(), Some("interrupted"));
    assert!(outcome.passed());
    assert!(teardown_ran.load(Ordering::SeqCst));
    assert!(!outcome.summary.scenario("later").unwrap().started);
    assert_eq!(outcome.summary.scenario("now").unwrap().iterations_interrupted, 0);
}

#[tokio::test(start_paused = true)]
async fn iteration_cap_ends_scenario_early_and_summary_is_exported() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder {
        export_json: true,
        ..Recorder::sleeping(Duration::from_millis(10))
    };
    let scenario = constant("capped", 2, 30).with_iterations(3);
    let options = RunOptions::new(vec![scenario])
        .with_thresholds(vec![
            Threshold::parse("http_req_duration{scenario:capped}", "p(95)<500").unwrap(),
        ])
        .with_output_dir(dir.path());

    let outcome = engine(options, recorder).run().await.unwrap();

    assert!(outcome.passed());
    assert_eq!(outcome.summary.scenario("capped").unwrap().iterations_completed, 3);
    assert!(outcome.summary.duration_ms < DEFAULT_GRACEFUL_STOP.as_millis() as f64);
    assert_eq!(
        outcome.artifacts.get("stdout").map(String::as_str),
        Some("summary exported\n")
    );

    let written = std::fs::read_to_string(dir.path().join("reports/summary.json")).unwrap();
    let json: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(json["passed"], true);
    assert_eq!(json["metrics"]["iterations"]["values"]["count"], 3.0);
    assert!(json["metrics"]["http_req_duration{scenario:capped}"]["thresholds"]["p(95)<500"]
        .as_bool()
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn duplicate_scenario_names_are_rejected() {
    let options = RunOptions::new(vec![constant("same", 1, 1), constant("same", 1, 1)]);
    let err = engine(options, Recorder::default()).run().await.unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn custom_metric_thresholds_see_workload_samples() {
    struct Custom {
        latency: scenario_stress::Metric,
    }

    #[async_trait]
    impl Workload for Custom {
        type Data = ();

        async fn setup(&self, _ctx: &mut VuContext) -> Result<(), WorkloadError> {
            Ok(())
        }

        async fn iteration(&self, vu: &mut VuContext, _data: &()) -> Result<(), WorkloadError> {
            vu.add_tagged(&self.latency, 250.0, &TagSet::new().with("endpoint", "login"));
            vu.sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }

    let registry = Arc::new(scenario_stress::MetricsRegistry::new());
    let latency = registry.trend("api_latency").unwrap();
    let options = RunOptions::new(vec![constant("default", 1, 1)]).with_thresholds(vec![
        Threshold::parse("api_latency{endpoint:login}", "avg<200").unwrap(),
        Threshold::parse("api_latency", "max<=250").unwrap(),
        Threshold::parse("never_registered", "count<1").unwrap(),
    ]);

    let outcome = Engine::with_http_client(options, Custom { latency }, Arc::new(Ok200))
        .with_registry(registry)
        .run()
        .await
        .unwrap();

    let verdicts: Vec<bool> = outcome.summary.thresholds.iter().map(|t| t.passed).collect();
    assert_eq!(verdicts, [false, true, false]);
    assert!(outcome.summary.thresholds[2].error.is_some());
}

#[tokio::test(start_paused = true)]
async fn non_finite_trend_samples_do_not_break_thresholds() {
    struct Ratios {
        ratio: scenario_stress::Metric,
    }

    #[async_trait]
    impl Workload for Ratios {
        type Data = ();

        async fn setup(&self, _ctx: &mut VuContext) -> Result<(), WorkloadError> {
            Ok(())
        }

        async fn iteration(&self, vu: &mut VuContext, _data: &()) -> Result<(), WorkloadError> {
            let (served, requested) = (0.0_f64, 0.0_f64);
            vu.add(&self.ratio, served / requested);
            vu.add(&self.ratio, 0.25);
            vu.sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    let registry = Arc::new(scenario_stress::MetricsRegistry::new());
    let ratio = registry.trend("ratio").unwrap();
    let options = RunOptions::new(vec![constant("default", 2, 1)])
        .with_thresholds(vec![Threshold::parse("ratio", "p(95)<1").unwrap()]);

    let outcome = Engine::with_http_client(options, Ratios { ratio }, Arc::new(Ok200))
        .with_registry(registry)
        .run()
        .await
        .unwrap();

    assert!(outcome.passed());
    let p95 = outcome.summary.metric_value("ratio", "p(95)").unwrap();
    assert!((p95 - 0.25).abs() < 1e-3, "p(95) = {p95}");
}

#[tokio::test(start_paused = true)]
async fn scenario_starting_out_of_range_is_a_config_error() {
    let late = constant("late", 1, 1).starting_at(Duration::from_secs(u64::MAX / 2));
    let recorder = Recorder::sleeping(Duration::from_millis(100));
    let iterations = recorder.iterations.clone();

    let err = engine(RunOptions::new(vec![late]), recorder).run().await.unwrap_err();

    assert!(matches!(err, EngineError::Config(_)), "{err:?}");
    assert_eq!(iterations.load(Ordering::SeqCst), 0);
}
