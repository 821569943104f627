use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{check_span, RunOptions};
use crate::error::EngineError;
use crate::http::{HttpClient, ReqwestClient};
use crate::metrics::MetricsRegistry;
use crate::scenario::MAX_SCENARIO_SPAN;
use crate::scheduler::ScenarioRunner;
use crate::summary;
use crate::threshold::{abort_check, evaluate_all, ThresholdResult};
use crate::types::RunSummary;
use crate::vu::{Clock, RunContext, VuContext, Workload};

#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub artifacts: BTreeMap<String, String>,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.summary.passed
    }
}

pub struct Engine<W: Workload> {
    options: RunOptions,
    workload: Arc<W>,
    registry: Arc<MetricsRegistry>,
    http: Arc<dyn HttpClient>,
}

impl<W: Workload> Engine<W> {
    pub fn new(options: RunOptions, workload: W) -> Result<Self, EngineError> {
        let http = Arc::new(ReqwestClient::new(&options.http)?);
        Ok(Self::with_http_client(options, workload, http))
    }

    pub fn with_http_client(options: RunOptions, workload: W, http: Arc<dyn HttpClient>) -> Self {
        Self {
            options,
            workload: Arc::new(workload),
            registry: Arc::new(MetricsRegistry::new()),
            http,
        }
    }

    pub fn with_registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub async fn run(self) -> Result<RunOutcome, EngineError> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Runs to completion; resolving `shutdown` stops every scenario
    /// gracefully, after which teardown and summary export still happen.
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> Result<RunOutcome, EngineError>
    where
        F: Future<Output = ()>,
    {
        validate(&self.options)?;
        let options = &self.options;
        info!(
            scenarios = options.scenarios.len(),
            thresholds = options.thresholds.len(),
            planned = ?options.planned_duration(),
            "Run starting"
        );

        let setup_run = Arc::new(RunContext::new(
            self.registry.clone(),
            self.http.clone(),
            options.http.clone(),
            Clock::start(),
        ));
        let mut setup_ctx = VuContext::lifecycle(setup_run, "setup");
        let setup = AssertUnwindSafe(self.workload.setup(&mut setup_ctx)).catch_unwind();
        let data = match timeout(options.setup_timeout, setup).await {
            Ok(Ok(Ok(data))) => Arc::new(data),
            Ok(Ok(Err(err))) => {
                error!(error = %err, "Setup failed, no scenario will run");
                return Err(EngineError::Setup(err));
            }
            Ok(Err(_)) => {
                error!("Setup panicked, no scenario will run");
                return Err(EngineError::Setup("setup panicked".into()));
            }
            Err(_) => {
                error!(timeout = ?options.setup_timeout, "Setup timed out, no scenario will run");
                return Err(EngineError::SetupTimeout(options.setup_timeout));
            }
        };
        info!("Setup finished");

        let run = Arc::new(RunContext::new(
            self.registry.clone(),
            self.http.clone(),
            options.http.clone(),
            Clock::start(),
        ));
        let (abort_tx, abort_rx) = watch::channel(false);
        let runners = options.scenarios.iter().map(|scenario| {
            ScenarioRunner::new(
                Arc::new(scenario.clone()),
                run.clone(),
                self.workload.clone(),
                data.clone(),
                abort_rx.clone(),
                options.tick,
            )
            .run()
        });
        let scenarios = join_all(runners);
        tokio::pin!(scenarios);
        tokio::pin!(shutdown);

        let watch_thresholds = options.thresholds.iter().any(|t| t.abort_on_fail);
        let interval = options.threshold_interval;
        let mut ticker = interval_at(run.clock.origin() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut aborted: Option<String> = None;
        let mut tripped: Option<ThresholdResult> = None;
        let reports = loop {
            tokio::select! {
                reports = &mut scenarios => break reports,
                _ = &mut shutdown, if aborted.is_none() => {
                    warn!("Interrupted, stopping scenarios");
                    aborted = Some("interrupted".to_string());
                    let _ = abort_tx.send(true);
                }
                _ = ticker.tick(), if watch_thresholds && aborted.is_none() => {
                    let elapsed = run.clock.elapsed();
                    if let Some(result) = abort_check(&options.thresholds, &self.registry, elapsed) {
                        warn!(
                            selector = %result.selector,
                            expression = %result.expression,
                            observed = ?result.observed,
                            "Threshold crossed, aborting run"
                        );
                        aborted = Some(format!(
                            "threshold `{}` on {} crossed",
                            result.expression, result.selector
                        ));
                        tripped = Some(result);
                        let _ = abort_tx.send(true);
                    } else {
                        debug!(?elapsed, "Abort thresholds hold");
                    }
                }
            }
        };

        let mut teardown_ctx = VuContext::lifecycle(run.clone(), "teardown");
        let teardown =
            AssertUnwindSafe(self.workload.teardown(&mut teardown_ctx, data.as_ref())).catch_unwind();
        match timeout(options.teardown_timeout, teardown).await {
            Ok(Ok(Ok(()))) => info!("Teardown finished"),
            Ok(Ok(Err(err))) => warn!(error = %err, "Teardown failed"),
            Ok(Err(_)) => error!("Teardown panicked"),
            Err(_) => warn!(timeout = ?options.teardown_timeout, "Teardown timed out"),
        }

        let elapsed = run.clock.elapsed();
        let mut results = evaluate_all(&options.thresholds, &self.registry, elapsed);
        if let Some(tripped) = &tripped {
            for result in results.iter_mut().filter(|r| {
                r.selector == tripped.selector && r.expression == tripped.expression
            }) {
                result.passed = false;
            }
        }
        let summary = summary::build(
            &self.registry,
            &options.thresholds,
            results,
            &options.summary_trend_stats,
            reports,
            elapsed,
            aborted,
        );
        info!(
            passed = summary.passed,
            failed_thresholds = summary.failed_thresholds().count(),
            failed_checks = summary.failed_checks(),
            samples = self.registry.samples_ingested(),
            "Run finished"
        );

        let artifacts = self.export(&summary).await;
        Ok(RunOutcome { summary, artifacts })
    }

    async fn export(&self, summary: &RunSummary) -> BTreeMap<String, String> {
        let workload = self.workload.clone();
        let custom = std::panic::catch_unwind(AssertUnwindSafe(|| workload.handle_summary(summary)))
            .unwrap_or_else(|_| {
                error!("Summary handler panicked, falling back to the text summary");
                None
            });
        let artifacts = custom.unwrap_or_else(|| {
            BTreeMap::from([("stdout".to_string(), summary::render_text(summary))])
        });
        write_artifacts(&artifacts, &self.options.output_dir).await;
        artifacts
    }
}

fn validate(options: &RunOptions) -> Result<(), EngineError> {
    if options.scenarios.is_empty() {
        return Err(EngineError::config("no scenario to run"));
    }
    let mut names = HashSet::new();
    for scenario in &options.scenarios {
        check_span(scenario)?;
        if !names.insert(scenario.name.as_str()) {
            return Err(EngineError::config(format!(
                "duplicate scenario name `{}`",
                scenario.name
            )));
        }
    }
    if options.tick.is_zero() || options.threshold_interval.is_zero() {
        return Err(EngineError::config("tick and thresholdInterval must be positive"));
    }
    if options.threshold_interval > MAX_SCENARIO_SPAN {
        return Err(EngineError::config("thresholdInterval is out of range"));
    }
    Ok(())
}

/// `stdout` and `stderr` are printed; every other name is a path under `dir`.
/// Write failures are logged and do not fail the run.
pub async fn write_artifacts(artifacts: &BTreeMap<String, String>, dir: &Path) {
    for (name, content) in artifacts {
        match name.as_str() {
            "stdout" => print!("{}", content),
            "stderr" => eprint!("{}", content),
            _ => {
                let path = dir.join(name);
                if let Some(parent) = path.parent() {
                    if let Err(err) = tokio::fs::create_dir_all(parent).await {
                        error!(path = %parent.display(), error = %err, "Failed to create output directory");
                        continue;
                    }
                }
                match tokio::fs::write(&path, content).await {
                    Ok(()) => info!(path = %path.display(), "Summary written"),
                    Err(err) => error!(path = %path.display(), error = %err, "Failed to write summary"),
                }
            }
        }
    }
}
