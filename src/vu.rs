use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::WorkloadError;
use crate::http::{self, HttpClient, HttpOptions, HttpRequest, HttpResponse};
use crate::metrics::{Metric, MetricsRegistry, Sample};
use crate::tags::TagSet;
use crate::types::RunSummary;

/// User-supplied load: a setup step, an iteration body and a teardown step.
///
/// `setup` runs once without a VU and its result is shared read-only with
/// every iteration and with `teardown`.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    type Data: Send + Sync + 'static;

    async fn setup(&self, ctx: &mut VuContext) -> Result<Self::Data, WorkloadError>;

    async fn iteration(&self, vu: &mut VuContext, data: &Self::Data) -> Result<(), WorkloadError>;

    async fn teardown(&self, _ctx: &mut VuContext, _data: &Self::Data) -> Result<(), WorkloadError> {
        Ok(())
    }

    /// Maps the final summary to output artifacts (name -> content).
    /// `None` keeps the default text summary on stdout.
    fn handle_summary(&self, _summary: &RunSummary) -> Option<BTreeMap<String, String>> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn origin(&self) -> Instant {
        self.start
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

pub struct RunContext {
    pub registry: Arc<MetricsRegistry>,
    pub http: Arc<dyn HttpClient>,
    pub http_options: HttpOptions,
    pub clock: Clock,
    active_vus: AtomicI64,
    peak_vus: AtomicI64,
    next_vu_id: AtomicU64,
}

impl RunContext {
    pub fn new(
        registry: Arc<MetricsRegistry>,
        http: Arc<dyn HttpClient>,
        http_options: HttpOptions,
        clock: Clock,
    ) -> Self {
        Self {
            registry,
            http,
            http_options,
            clock,
            active_vus: AtomicI64::new(0),
            peak_vus: AtomicI64::new(0),
            next_vu_id: AtomicU64::new(1),
        }
    }

    pub fn emit(&self, metric: &Metric, value: f64, tags: TagSet) {
        self.registry.ingest(Sample {
            metric: metric.clone(),
            value,
            tags,
            time: self.clock.elapsed(),
        });
    }

    pub fn active_vus(&self) -> i64 {
        self.active_vus.load(Ordering::SeqCst)
    }

    fn vu_started(&self) {
        let now = self.active_vus.fetch_add(1, Ordering::SeqCst) + 1;
        let peak = self.peak_vus.fetch_max(now, Ordering::SeqCst).max(now);
        let builtin = self.registry.builtin();
        self.emit(&builtin.vus, now as f64, TagSet::new());
        self.emit(&builtin.vus_max, peak as f64, TagSet::new());
    }

    fn vu_stopped(&self) {
        let now = self.active_vus.fetch_sub(1, Ordering::SeqCst) - 1;
        self.emit(&self.registry.builtin().vus, now as f64, TagSet::new());
    }
}

/// Keeps the run-wide VU count in step with live contexts.
struct VuGuard {
    run: Arc<RunContext>,
}

impl Drop for VuGuard {
    fn drop(&mut self) {
        self.run.vu_stopped();
    }
}

pub struct VuContext {
    id: u64,
    scenario: Arc<str>,
    iteration: u64,
    scenario_tags: TagSet,
    groups: Vec<(String, Instant)>,
    group_path: String,
    state: HashMap<String, String>,
    run: Arc<RunContext>,
    _guard: Option<VuGuard>,
}

impl VuContext {
    pub fn new(run: Arc<RunContext>, scenario: &str, scenario_tags: TagSet) -> Self {
        run.vu_started();
        let id = run.next_vu_id.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            scenario: Arc::from(scenario),
            iteration: 0,
            scenario_tags,
            groups: Vec::new(),
            group_path: String::new(),
            state: HashMap::new(),
            _guard: Some(VuGuard { run: run.clone() }),
            run,
        }
    }

    /// Context for setup and teardown: no VU, samples tagged with `group`.
    pub fn lifecycle(run: Arc<RunContext>, stage: &str) -> Self {
        Self {
            id: 0,
            scenario: Arc::from(""),
            iteration: 0,
            scenario_tags: TagSet::new(),
            groups: Vec::new(),
            group_path: format!("::{}", stage),
            state: HashMap::new(),
            _guard: None,
            run,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn group(&self) -> &str {
        &self.group_path
    }

    /// Scratch state that lives as long as the VU (auth tokens, ids).
    pub fn state(&self) -> &HashMap<String, String> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.state
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.run.registry
    }

    pub fn elapsed(&self) -> Duration {
        self.run.clock.elapsed()
    }

    fn tags(&self) -> TagSet {
        let tags = self.scenario_tags.clone();
        if self.group_path.is_empty() {
            tags
        } else {
            tags.with("group", self.group_path.clone())
        }
    }

    pub fn add(&self, metric: &Metric, value: f64) {
        self.run.emit(metric, value, self.tags());
    }

    pub fn add_tagged(&self, metric: &Metric, value: f64, tags: &TagSet) {
        self.run.emit(metric, value, self.tags().merged(tags));
    }

    pub fn add_bool(&self, metric: &Metric, value: bool) {
        self.add(metric, if value { 1.0 } else { 0.0 });
    }

    pub fn check(&self, name: &str, passed: bool) -> bool {
        let tags = self.tags().with("check", name);
        self.run
            .emit(&self.run.registry.builtin().checks, if passed { 1.0 } else { 0.0 }, tags);
        passed
    }

    pub fn checks(&self, checks: &[(&str, bool)]) -> bool {
        checks
            .iter()
            .fold(true, |all, (name, passed)| self.check(name, *passed) && all)
    }

    pub fn enter_group(&mut self, name: &str) {
        self.group_path.push_str("::");
        self.group_path.push_str(name);
        self.groups.push((name.to_string(), Instant::now()));
    }

    /// Leaves the innermost group and records its `group_duration`.
    pub fn leave_group(&mut self) {
        let Some((name, started)) = self.groups.pop() else {
            warn!(vu = self.id, "leave_group called outside of any group");
            return;
        };
        let elapsed = started.elapsed();
        let tags = self.tags();
        self.group_path
            .truncate(self.group_path.len() - name.len() - 2);
        self.run.emit(
            &self.run.registry.builtin().group_duration,
            millis(elapsed),
            tags,
        );
    }

    fn reset_groups(&mut self) {
        while !self.groups.is_empty() {
            self.leave_group();
        }
    }

    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn request_tags(&self, request: &HttpRequest, response: &HttpResponse) -> TagSet {
        let mut tags = self.tags();
        tags.insert("name", request.url.clone());
        tags.insert("method", request.method.as_str());
        tags.insert("status", response.status.to_string());
        tags.insert("expected_response", response.is_expected().to_string());
        tags.merged(&request.tags)
    }

    fn record_request(&self, request: &HttpRequest, response: &HttpResponse) {
        let builtin = self.run.registry.builtin();
        let tags = self.request_tags(request, response);
        self.run.emit(&builtin.http_reqs, 1.0, tags.clone());
        self.run
            .emit(&builtin.http_req_duration, millis(response.elapsed), tags.clone());
        self.run.emit(
            &builtin.http_req_failed,
            if response.is_expected() { 0.0 } else { 1.0 },
            tags.clone(),
        );
        self.run
            .emit(&builtin.data_sent, request.approx_size() as f64, tags.clone());
        self.run
            .emit(&builtin.data_received, response.approx_size() as f64, tags);
        if let Some(err) = &response.error {
            debug!(vu = self.id, url = %request.url, error = %err, "Request failed");
        }
    }

    pub async fn request(&self, request: HttpRequest) -> HttpResponse {
        let response = http::execute(self.run.http.as_ref(), &request).await;
        self.record_request(&request, &response);
        response
    }

    pub async fn get(&self, url: &str) -> HttpResponse {
        self.request(HttpRequest::get(url)).await
    }

    pub async fn post(&self, url: &str, body: impl Into<Vec<u8>>) -> HttpResponse {
        self.request(HttpRequest::post(url).body(body)).await
    }

    pub async fn put(&self, url: &str, body: impl Into<Vec<u8>>) -> HttpResponse {
        self.request(HttpRequest::put(url).body(body)).await
    }

    pub async fn patch(&self, url: &str, body: impl Into<Vec<u8>>) -> HttpResponse {
        self.request(HttpRequest::patch(url).body(body)).await
    }

    pub async fn del(&self, url: &str) -> HttpResponse {
        self.request(HttpRequest::delete(url)).await
    }

    /// Issues `requests` concurrently within the `batch`/`batchPerHost` limits.
    pub async fn batch(&self, requests: Vec<HttpRequest>) -> Vec<HttpResponse> {
        let options = &self.run.http_options;
        let responses = http::execute_batch(
            self.run.http.as_ref(),
            &requests,
            options.batch,
            options.batch_per_host,
        )
        .await;
        for (request, response) in requests.iter().zip(&responses) {
            self.record_request(request, response);
        }
        responses
    }
}

pub(crate) fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    Failed,
}

/// Runs one iteration. Errors and panics are logged and counted, never propagated.
pub async fn run_iteration<W: Workload>(
    vu: &mut VuContext,
    workload: &W,
    data: &W::Data,
) -> IterationOutcome {
    let started = Instant::now();
    let result = AssertUnwindSafe(workload.iteration(vu, data))
        .catch_unwind()
        .await;
    vu.reset_groups();

    let outcome = match result {
        Ok(Ok(())) => IterationOutcome::Completed,
        Ok(Err(err)) => {
            warn!(
                scenario = %vu.scenario,
                vu = vu.id,
                iteration = vu.iteration,
                error = %err,
                "Iteration failed"
            );
            IterationOutcome::Failed
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                scenario = %vu.scenario,
                vu = vu.id,
                iteration = vu.iteration,
                panic = %message,
                "Iteration panicked"
            );
            IterationOutcome::Failed
        }
    };

    let builtin = vu.run.registry.builtin();
    let tags = vu.scenario_tags.clone();
    if outcome == IterationOutcome::Failed {
        vu.run.emit(&builtin.iteration_errors, 1.0, tags.clone());
    }
    vu.run.emit(&builtin.iterations, 1.0, tags.clone());
    vu.run
        .emit(&builtin.iteration_duration, millis(started.elapsed()), tags);
    vu.iteration += 1;
    outcome
}

/// Shared cap on iterations across all VUs of a scenario.
#[derive(Debug)]
pub struct IterationBudget {
    remaining: AtomicU64,
}

impl IterationBudget {
    pub fn new(total: u64) -> Self {
        Self {
            remaining: AtomicU64::new(total),
        }
    }

    pub fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn exhausted(&self) -> bool {
        self.remaining.load(Ordering::SeqCst) == 0
    }
}

#[derive(Debug, Default)]
pub struct ScenarioStats {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub interrupted: AtomicU64,
    pub dropped: AtomicU64,
}

impl ScenarioStats {
    pub fn record(&self, outcome: IterationOutcome) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if outcome == IterationOutcome::Failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Loops iterations in one VU until `stop` is raised or the budget runs out.
/// A raised `stop` lets the current iteration finish.
pub async fn run_vu_loop<W: Workload>(
    mut vu: VuContext,
    workload: Arc<W>,
    data: Arc<W::Data>,
    stop: watch::Receiver<bool>,
    budget: Option<Arc<IterationBudget>>,
    stats: Arc<ScenarioStats>,
) {
    debug!(scenario = %vu.scenario, vu = vu.id, "VU started");
    loop {
        if *stop.borrow() {
            break;
        }
        if let Some(budget) = &budget {
            if !budget.take() {
                break;
            }
        }
        let outcome = run_iteration(&mut vu, workload.as_ref(), data.as_ref()).await;
        stats.record(outcome);
    }
    debug!(scenario = %vu.scenario, vu = vu.id, iterations = vu.iteration, "VU stopped");
}
