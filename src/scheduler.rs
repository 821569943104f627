use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::scenario::{ArrivalSchedule, Executor, Scenario, Stage};
use crate::tags::TagSet;
use crate::types::ScenarioReport;
use crate::vu::{
    run_iteration, run_vu_loop, IterationBudget, IterationOutcome, RunContext, ScenarioStats,
    VuContext, Workload,
};

/// Resolves once the run-level stop flag is raised.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // Sender gone without raising the flag: never resolve.
        std::future::pending::<()>().await;
    }
}

/// `start + offset`, saturating at roughly thirty years from now.
fn deadline(start: Instant, offset: Duration) -> Instant {
    start
        .checked_add(offset)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400 * 365 * 30))
}

struct LoopingVu {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ScenarioRunner<W: Workload> {
    scenario: Arc<Scenario>,
    run: Arc<RunContext>,
    workload: Arc<W>,
    data: Arc<W::Data>,
    abort: watch::Receiver<bool>,
    tick: Duration,
    stats: Arc<ScenarioStats>,
    tags: TagSet,
}

impl<W: Workload> ScenarioRunner<W> {
    pub fn new(
        scenario: Arc<Scenario>,
        run: Arc<RunContext>,
        workload: Arc<W>,
        data: Arc<W::Data>,
        abort: watch::Receiver<bool>,
        tick: Duration,
    ) -> Self {
        let tags = scenario.sample_tags();
        Self {
            scenario,
            run,
            workload,
            data,
            abort,
            tick,
            stats: Arc::new(ScenarioStats::default()),
            tags,
        }
    }

    fn report(&self, started: bool) -> ScenarioReport {
        ScenarioReport {
            name: self.scenario.name.clone(),
            executor: self.scenario.executor.kind().to_string(),
            iterations_completed: self.stats.completed.load(Ordering::Relaxed),
            iterations_interrupted: self.stats.interrupted.load(Ordering::Relaxed),
            iteration_errors: self.stats.failed.load(Ordering::Relaxed),
            dropped_iterations: self.stats.dropped.load(Ordering::Relaxed),
            started,
        }
    }

    fn new_vu(&self) -> VuContext {
        VuContext::new(self.run.clone(), &self.scenario.name, self.tags.clone())
    }

    fn spawn_looping(&self, budget: &Option<Arc<IterationBudget>>) -> LoopingVu {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_vu_loop(
            self.new_vu(),
            self.workload.clone(),
            self.data.clone(),
            stop_rx,
            budget.clone(),
            self.stats.clone(),
        ));
        LoopingVu { stop, handle }
    }

    /// Asks `vu` to stop after its current iteration; hard-cancels it once
    /// `grace` has passed. The returned task yields true if it had to cancel.
    fn retire(vu: LoopingVu, grace: Duration, retiring: &mut JoinSet<bool>) {
        let LoopingVu { stop, mut handle } = vu;
        let _ = stop.send(true);
        retiring.spawn(async move {
            if timeout(grace, &mut handle).await.is_ok() {
                return false;
            }
            handle.abort();
            matches!(handle.await, Err(err) if err.is_cancelled())
        });
    }

    async fn collect_retired(&self, retiring: &mut JoinSet<bool>) {
        while let Some(result) = retiring.join_next().await {
            if matches!(result, Ok(true)) {
                self.stats.interrupted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub async fn run(mut self) -> ScenarioReport {
        let Some(start) = self.run.clock.origin().checked_add(self.scenario.start_time) else {
            warn!(
                scenario = %self.scenario.name,
                start_time = ?self.scenario.start_time,
                "Start time out of range, skipping scenario"
            );
            return self.report(false);
        };
        let mut abort = self.abort.clone();
        tokio::select! {
            _ = sleep_until(start) => {}
            _ = stopped(&mut abort) => {
                info!(scenario = %self.scenario.name, "Run stopped before scenario start");
                return self.report(false);
            }
        }

        info!(
            scenario = %self.scenario.name,
            executor = self.scenario.executor.kind(),
            duration = ?self.scenario.executor.duration(),
            "Scenario started"
        );
        let executor = self.scenario.executor.clone();
        match executor {
            Executor::ConstantVus { vus, duration } => self.constant_vus(start, vus, duration).await,
            Executor::RampingVus {
                graceful_ramp_down, ..
            } => self.ramping_vus(start, graceful_ramp_down).await,
            Executor::RampingArrivalRate {
                start_rate,
                time_unit,
                pre_allocated_vus,
                max_vus,
                stages,
            } => {
                self.arrival_rate(start, start_rate, time_unit, pre_allocated_vus, max_vus, &stages)
                    .await
            }
        }

        let report = self.report(true);
        info!(
            scenario = %report.name,
            iterations = report.iterations_completed,
            interrupted = report.iterations_interrupted,
            errors = report.iteration_errors,
            dropped = report.dropped_iterations,
            "Scenario finished"
        );
        report
    }

    fn budget(&self) -> Option<Arc<IterationBudget>> {
        self.scenario
            .iterations
            .map(|n| Arc::new(IterationBudget::new(n)))
    }

    async fn constant_vus(&mut self, start: Instant, vus: u64, duration: Duration) {
        let budget = self.budget();
        let looping: Vec<LoopingVu> = (0..vus).map(|_| self.spawn_looping(&budget)).collect();

        let poll = self.tick.min(Duration::from_millis(100));
        let all_done = async {
            while looping.iter().any(|vu| !vu.handle.is_finished()) {
                tokio::time::sleep(poll).await;
            }
        };
        let mut abort = self.abort.clone();
        tokio::select! {
            _ = sleep_until(deadline(start, duration)) => {}
            _ = all_done => debug!(scenario = %self.scenario.name, "All VUs finished early"),
            _ = stopped(&mut abort) => {}
        }

        let mut retiring = JoinSet::new();
        for vu in looping {
            Self::retire(vu, self.scenario.graceful_stop, &mut retiring);
        }
        self.collect_retired(&mut retiring).await;
    }

    async fn ramping_vus(&mut self, start: Instant, graceful_ramp_down: Duration) {
        let budget = self.budget();
        let total = self.scenario.executor.duration();
        let mut active: Vec<LoopingVu> = Vec::new();
        let mut retiring = JoinSet::new();
        let mut ticker = interval_at(start, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped(&mut self.abort) => break,
            }
            let elapsed = Instant::now().saturating_duration_since(start);
            if elapsed >= total {
                break;
            }
            if let Some(budget) = &budget {
                if budget.exhausted() && active.iter().all(|vu| vu.handle.is_finished()) {
                    debug!(scenario = %self.scenario.name, "Iteration budget spent");
                    break;
                }
            }

            let target = self.scenario.executor.vus_at(elapsed) as usize;
            if target != active.len() {
                debug!(
                    scenario = %self.scenario.name,
                    from = active.len(),
                    to = target,
                    "Adjusting VUs"
                );
            }
            while active.len() < target {
                active.push(self.spawn_looping(&budget));
            }
            while active.len() > target {
                if let Some(vu) = active.pop() {
                    Self::retire(vu, graceful_ramp_down, &mut retiring);
                }
            }
        }

        for vu in active {
            Self::retire(vu, self.scenario.graceful_stop, &mut retiring);
        }
        self.collect_retired(&mut retiring).await;
    }

    fn record_arrival(&self, result: Result<IterationOutcome, JoinError>) {
        match result {
            Ok(outcome) => self.stats.record(outcome),
            Err(err) if err.is_cancelled() => {
                self.stats.interrupted.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => warn!(scenario = %self.scenario.name, error = %err, "Iteration task failed"),
        }
    }

    async fn arrival_rate(
        &mut self,
        start: Instant,
        start_rate: u64,
        time_unit: Duration,
        pre_allocated_vus: u64,
        max_vus: u64,
        stages: &[Stage],
    ) {
        let idle: Arc<Mutex<Vec<VuContext>>> = Arc::new(Mutex::new(
            (0..pre_allocated_vus).map(|_| self.new_vu()).collect(),
        ));
        let mut allocated = pre_allocated_vus;
        let mut in_flight: JoinSet<IterationOutcome> = JoinSet::new();
        let builtin = self.run.registry.builtin().clone();

        for offset in ArrivalSchedule::new(start_rate, time_unit, stages) {
            tokio::select! {
                _ = sleep_until(deadline(start, offset)) => {}
                _ = stopped(&mut self.abort) => break,
            }
            while let Some(result) = in_flight.try_join_next() {
                self.record_arrival(result);
            }

            let vu = idle.lock().pop();
            let vu = match vu {
                Some(vu) => Some(vu),
                None if allocated < max_vus => {
                    allocated += 1;
                    debug!(scenario = %self.scenario.name, allocated, "Initializing extra VU");
                    Some(self.new_vu())
                }
                None => None,
            };
            let Some(mut vu) = vu else {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.run
                    .emit(&builtin.dropped_iterations, 1.0, self.tags.clone());
                debug!(scenario = %self.scenario.name, ?offset, "Dropped iteration, no free VU");
                continue;
            };

            let workload = self.workload.clone();
            let data = self.data.clone();
            let idle = idle.clone();
            in_flight.spawn(async move {
                let outcome = run_iteration(&mut vu, workload.as_ref(), data.as_ref()).await;
                idle.lock().push(vu);
                outcome
            });
        }

        let grace = self.scenario.graceful_stop;
        let drained = timeout(grace, async {
            while let Some(result) = in_flight.join_next().await {
                self.record_arrival(result);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                scenario = %self.scenario.name,
                remaining = in_flight.len(),
                "Graceful stop expired, cancelling iterations"
            );
            in_flight.abort_all();
            while let Some(result) = in_flight.join_next().await {
                self.record_arrival(result);
            }
        }
        idle.lock().clear();
    }
}
