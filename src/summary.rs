use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use crate::metrics::{Aggregate, MetricsRegistry, Stat};
use crate::tags::TagSet;
use crate::threshold::{Threshold, ThresholdResult};
use crate::types::{CheckSummary, MetricSummary, RunSummary, ScenarioReport};
use crate::vu::millis;

fn metric_values(agg: &Aggregate, trend_stats: &[Stat], elapsed: Duration) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();
    let mut put = |stat: Stat| {
        if let Some(v) = agg.stat(&stat, elapsed) {
            values.insert(stat.to_string(), v);
        }
    };
    match agg {
        Aggregate::Counter(_) => {
            put(Stat::Count);
            put(Stat::Rate);
        }
        Aggregate::Gauge(_) => {
            put(Stat::Value);
            put(Stat::Min);
            put(Stat::Max);
        }
        Aggregate::Rate(r) => {
            put(Stat::Rate);
            values.insert("passes".to_string(), r.passes as f64);
            values.insert("fails".to_string(), r.fails() as f64);
        }
        Aggregate::Trend(_) => {
            for stat in trend_stats {
                put(*stat);
            }
        }
    }
    values
}

pub fn build(
    registry: &MetricsRegistry,
    thresholds: &[Threshold],
    results: Vec<ThresholdResult>,
    trend_stats: &[Stat],
    scenarios: Vec<ScenarioReport>,
    elapsed: Duration,
    aborted: Option<String>,
) -> RunSummary {
    let mut metrics = BTreeMap::new();
    for metric in registry.metrics() {
        let referenced = thresholds.iter().any(|t| t.selector.metric == metric.name());
        if !registry.has_samples(metric.name()) && !referenced {
            continue;
        }
        if let Some(agg) = registry.aggregate(metric.name(), &TagSet::new()) {
            metrics.insert(
                metric.name().to_string(),
                MetricSummary {
                    kind: metric.kind(),
                    values: metric_values(&agg, trend_stats, elapsed),
                    thresholds: BTreeMap::new(),
                },
            );
        }
    }

    // Tag-scoped thresholds get their own sub-metric entry.
    for threshold in thresholds.iter().filter(|t| !t.selector.tags.is_empty()) {
        let key = threshold.selector.to_string();
        if metrics.contains_key(&key) {
            continue;
        }
        let Some(metric) = registry.get(&threshold.selector.metric) else {
            continue;
        };
        if let Some(agg) = registry.aggregate(metric.name(), &threshold.selector.tags) {
            metrics.insert(
                key,
                MetricSummary {
                    kind: metric.kind(),
                    values: metric_values(&agg, trend_stats, elapsed),
                    thresholds: BTreeMap::new(),
                },
            );
        }
    }

    for result in &results {
        if let Some(entry) = metrics.get_mut(&result.selector) {
            entry
                .thresholds
                .insert(result.expression.clone(), result.passed);
        }
    }

    let mut checks: BTreeMap<(String, String), CheckSummary> = BTreeMap::new();
    for (tags, agg) in registry.buckets("checks") {
        let Aggregate::Rate(rate) = agg else { continue };
        let group = tags.get("group").unwrap_or_default().to_string();
        let name = tags.get("check").unwrap_or_default().to_string();
        let entry = checks
            .entry((group.clone(), name.clone()))
            .or_insert_with(|| CheckSummary {
                group,
                name,
                passes: 0,
                fails: 0,
            });
        entry.passes += rate.passes;
        entry.fails += rate.fails();
    }

    RunSummary {
        duration_ms: millis(elapsed),
        passed: results.iter().all(|r| r.passed),
        aborted,
        metrics,
        checks: checks.into_values().collect(),
        thresholds: results,
        scenarios,
    }
}

fn format_value(metric: &str, stat: &str, value: f64) -> String {
    if metric.ends_with("_duration") && stat != "count" && stat != "rate" {
        if value >= 1000.0 {
            format!("{:.2}s", value / 1000.0)
        } else {
            format!("{:.2}ms", value)
        }
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.4}", value)
    }
}

const NAME_WIDTH: usize = 36;

/// Human-readable summary, printed to stdout when the workload has no
/// summary handler of its own.
pub fn render_text(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    for scenario in &summary.scenarios {
        let _ = writeln!(
            out,
            "  scenario {} ({}): {} iterations, {} interrupted, {} errors, {} dropped",
            scenario.name,
            scenario.executor,
            scenario.iterations_completed,
            scenario.iterations_interrupted,
            scenario.iteration_errors,
            scenario.dropped_iterations
        );
    }
    let _ = writeln!(out);

    if !summary.checks.is_empty() {
        let mut current_group: Option<&str> = None;
        for check in &summary.checks {
            if current_group != Some(check.group.as_str()) {
                current_group = Some(check.group.as_str());
                if !check.group.is_empty() {
                    let _ = writeln!(out, "  █ {}", check.group.trim_start_matches("::").replace("::", " > "));
                }
            }
            let mark = if check.fails == 0 { "✓" } else { "✗" };
            let _ = write!(out, "    {} {}", mark, check.name);
            if check.fails > 0 {
                let total = check.passes + check.fails;
                let pct = check.passes as f64 / total as f64 * 100.0;
                let _ = write!(out, " ({:.0}% ✓ {} / ✗ {})", pct, check.passes, check.fails);
            }
            let _ = writeln!(out);
        }
        let _ = writeln!(out);
    }

    for (name, metric) in &summary.metrics {
        let mark = if metric.thresholds.is_empty() {
            " "
        } else if metric.thresholds.values().all(|p| *p) {
            "✓"
        } else {
            "✗"
        };
        let dots = NAME_WIDTH.saturating_sub(name.len());
        let values = metric
            .values
            .iter()
            .map(|(stat, v)| format!("{}={}", stat, format_value(name, stat, *v)))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(out, "  {} {}{}: {}", mark, name, ".".repeat(dots), values);
    }

    let _ = writeln!(out);
    let verdict = if summary.passed { "PASSED" } else { "FAILED" };
    let _ = writeln!(
        out,
        "  thresholds: {} ({} of {} crossed), run time {:.1}s",
        verdict,
        summary.failed_thresholds().count(),
        summary.thresholds.len(),
        summary.duration_ms / 1000.0
    );
    if let Some(reason) = &summary.aborted {
        let _ = writeln!(out, "  run aborted: {}", reason);
    }
    out
}
