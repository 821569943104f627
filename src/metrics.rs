use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::warn;

use crate::error::EngineError;
use crate::tags::TagSet;

/// Trend values are stored in the histogram scaled by this factor, giving
/// three decimal places of resolution (microseconds for millisecond trends).
const TREND_SCALE: f64 = 1000.0;
const TREND_SIGFIG: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        }
    }

    pub fn supports(&self, stat: &Stat) -> bool {
        match self {
            MetricKind::Counter => matches!(stat, Stat::Count | Stat::Rate),
            MetricKind::Gauge => matches!(stat, Stat::Value | Stat::Min | Stat::Max),
            MetricKind::Rate => matches!(stat, Stat::Rate),
            MetricKind::Trend => matches!(
                stat,
                Stat::Avg | Stat::Min | Stat::Max | Stat::Med | Stat::Percentile(_)
            ),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    Count,
    Rate,
    Value,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl FromStr for Stat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let stat = match s {
            "count" => Stat::Count,
            "rate" => Stat::Rate,
            "value" => Stat::Value,
            "avg" => Stat::Avg,
            "min" => Stat::Min,
            "max" => Stat::Max,
            "med" => Stat::Med,
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation `{}`", s))?;
                let pct: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile `{}`", inner))?;
                if !(0.0..=100.0).contains(&pct) {
                    return Err(format!("percentile {} is outside 0..=100", pct));
                }
                Stat::Percentile(pct)
            }
        };
        Ok(stat)
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stat::Count => f.write_str("count"),
            Stat::Rate => f.write_str("rate"),
            Stat::Value => f.write_str("value"),
            Stat::Avg => f.write_str("avg"),
            Stat::Min => f.write_str("min"),
            Stat::Max => f.write_str("max"),
            Stat::Med => f.write_str("med"),
            Stat::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CounterAgg {
    pub sum: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RateAgg {
    pub passes: u64,
    pub total: u64,
}

impl RateAgg {
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passes as f64 / self.total as f64
        }
    }

    pub fn fails(&self) -> u64 {
        self.total - self.passes
    }
}

#[derive(Debug, Clone, Default)]
pub struct GaugeAgg {
    pub last: f64,
    pub last_at: Option<Duration>,
    pub min: f64,
    pub max: f64,
}

/// Trend distribution. Values below zero are kept in a second histogram
/// keyed on their magnitude, so both signs get the same relative precision.
#[derive(Debug, Clone)]
pub struct TrendAgg {
    positive: Histogram<u64>,
    negative: Histogram<u64>,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

fn histogram() -> Histogram<u64> {
    Histogram::new(TREND_SIGFIG).expect("3 significant figures is a valid precision")
}

impl Default for TrendAgg {
    fn default() -> Self {
        Self {
            positive: histogram(),
            negative: histogram(),
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }
}

/// Value of the `rank`-th smallest recorded entry (1-based).
fn value_at_rank(histogram: &Histogram<u64>, rank: u64) -> u64 {
    let mut seen = 0;
    for step in histogram.iter_recorded() {
        seen += step.count_at_value();
        if seen >= rank {
            return step.value_iterated_to();
        }
    }
    histogram.max()
}

impl TrendAgg {
    fn record(&mut self, value: f64) {
        if !value.is_finite() {
            warn!("Ignoring non-finite trend value {}", value);
            return;
        }
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        let (histogram, magnitude) = if value < 0.0 {
            (&mut self.negative, -value)
        } else {
            (&mut self.positive, value)
        };
        let scaled = (magnitude * TREND_SCALE).round().min(u64::MAX as f64) as u64;
        if let Err(e) = histogram.record(scaled) {
            warn!("Failed to record trend value {}: {}", value, e);
        }
    }

    fn merge(&mut self, other: &TrendAgg) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
        self.sum += other.sum;
        for (mine, theirs) in [
            (&mut self.positive, &other.positive),
            (&mut self.negative, &other.negative),
        ] {
            if let Err(e) = mine.add(theirs) {
                warn!("Failed to merge trend histograms: {}", e);
            }
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Quantile estimate, accurate to three significant figures, bounded by
    /// the exact observed range.
    pub fn percentile(&self, pct: f64) -> f64 {
        let recorded = self.positive.len() + self.negative.len();
        if recorded == 0 {
            return 0.0;
        }
        let rank = ((pct / 100.0 * recorded as f64).ceil() as u64).clamp(1, recorded);
        let below = self.negative.len();
        let raw = if rank <= below {
            // Negatives in ascending value order are descending in magnitude.
            -(value_at_rank(&self.negative, below - rank + 1) as f64) / TREND_SCALE
        } else {
            value_at_rank(&self.positive, rank - below) as f64 / TREND_SCALE
        };
        raw.max(self.min).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub enum Aggregate {
    Counter(CounterAgg),
    Gauge(GaugeAgg),
    Rate(RateAgg),
    Trend(TrendAgg),
}

impl Aggregate {
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Aggregate::Counter(CounterAgg::default()),
            MetricKind::Gauge => Aggregate::Gauge(GaugeAgg::default()),
            MetricKind::Rate => Aggregate::Rate(RateAgg::default()),
            MetricKind::Trend => Aggregate::Trend(TrendAgg::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Aggregate::Counter(_) => MetricKind::Counter,
            Aggregate::Gauge(_) => MetricKind::Gauge,
            Aggregate::Rate(_) => MetricKind::Rate,
            Aggregate::Trend(_) => MetricKind::Trend,
        }
    }

    fn add(&mut self, value: f64, time: Duration) {
        match self {
            Aggregate::Counter(c) => c.sum += value,
            Aggregate::Rate(r) => {
                r.total += 1;
                if value != 0.0 {
                    r.passes += 1;
                }
            }
            Aggregate::Gauge(g) => {
                if g.last_at.is_none() {
                    g.min = value;
                    g.max = value;
                } else {
                    g.min = g.min.min(value);
                    g.max = g.max.max(value);
                }
                if g.last_at.map_or(true, |at| time >= at) {
                    g.last = value;
                    g.last_at = Some(time);
                }
            }
            Aggregate::Trend(t) => t.record(value),
        }
    }

    /// Folds `other` into `self`. Both must be of the same kind.
    fn merge(&mut self, other: &Aggregate) {
        match (self, other) {
            (Aggregate::Counter(a), Aggregate::Counter(b)) => a.sum += b.sum,
            (Aggregate::Rate(a), Aggregate::Rate(b)) => {
                a.passes += b.passes;
                a.total += b.total;
            }
            (Aggregate::Gauge(a), Aggregate::Gauge(b)) => {
                let Some(b_at) = b.last_at else { return };
                match a.last_at {
                    None => *a = b.clone(),
                    Some(a_at) => {
                        a.min = a.min.min(b.min);
                        a.max = a.max.max(b.max);
                        if b_at > a_at {
                            a.last = b.last;
                            a.last_at = b.last_at;
                        }
                    }
                }
            }
            (Aggregate::Trend(a), Aggregate::Trend(b)) => {
                if b.count == 0 {
                    return;
                }
                if a.count == 0 {
                    *a = b.clone();
                    return;
                }
                a.merge(b);
            }
            (a, b) => warn!(
                "Ignoring merge of a {} aggregate into a {}",
                b.kind(),
                a.kind()
            ),
        }
    }

    /// Reads `stat`, or `None` when the statistic does not apply to this kind.
    /// `elapsed` is the run time used for per-second counter rates.
    pub fn stat(&self, stat: &Stat, elapsed: Duration) -> Option<f64> {
        let value = match (self, stat) {
            (Aggregate::Counter(c), Stat::Count) => c.sum,
            (Aggregate::Counter(c), Stat::Rate) => {
                let secs = elapsed.as_secs_f64();
                if secs > 0.0 {
                    c.sum / secs
                } else {
                    0.0
                }
            }
            (Aggregate::Rate(r), Stat::Rate) => r.rate(),
            (Aggregate::Gauge(g), Stat::Value) => g.last,
            (Aggregate::Gauge(g), Stat::Min) => g.min,
            (Aggregate::Gauge(g), Stat::Max) => g.max,
            (Aggregate::Trend(t), Stat::Avg) => t.avg(),
            (Aggregate::Trend(t), Stat::Min) => t.min,
            (Aggregate::Trend(t), Stat::Max) => t.max,
            (Aggregate::Trend(t), Stat::Med) => t.percentile(50.0),
            (Aggregate::Trend(t), Stat::Percentile(p)) => t.percentile(*p),
            _ => return None,
        };
        Some(value)
    }

    /// Number of samples (or the summed value, for counters).
    pub fn count(&self) -> f64 {
        match self {
            Aggregate::Counter(c) => c.sum,
            Aggregate::Rate(r) => r.total as f64,
            Aggregate::Gauge(g) => g.last_at.map_or(0.0, |_| 1.0),
            Aggregate::Trend(t) => t.count as f64,
        }
    }
}

#[derive(Debug)]
struct MetricEntry {
    name: String,
    kind: MetricKind,
    buckets: RwLock<HashMap<TagSet, Arc<Mutex<Aggregate>>>>,
}

impl MetricEntry {
    fn add(&self, value: f64, tags: TagSet, time: Duration) {
        let bucket = self.buckets.read().get(&tags).cloned();
        let bucket = match bucket {
            Some(bucket) => bucket,
            None => self
                .buckets
                .write()
                .entry(tags)
                .or_insert_with(|| Arc::new(Mutex::new(Aggregate::empty(self.kind))))
                .clone(),
        };
        bucket.lock().add(value, time);
    }
}

#[derive(Debug, Clone)]
pub struct Metric(Arc<MetricEntry>);

impl Metric {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> MetricKind {
        self.0.kind
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: Metric,
    pub value: f64,
    pub tags: TagSet,
    pub time: Duration,
}

#[derive(Debug, Clone)]
pub struct BuiltinMetrics {
    pub vus: Metric,
    pub vus_max: Metric,
    pub iterations: Metric,
    pub iteration_duration: Metric,
    pub iteration_errors: Metric,
    pub dropped_iterations: Metric,
    pub checks: Metric,
    pub group_duration: Metric,
    pub http_reqs: Metric,
    pub http_req_duration: Metric,
    pub http_req_failed: Metric,
    pub data_sent: Metric,
    pub data_received: Metric,
}

pub const BUILTIN_METRICS: &[(&str, MetricKind)] = &[
    ("vus", MetricKind::Gauge),
    ("vus_max", MetricKind::Gauge),
    ("iterations", MetricKind::Counter),
    ("iteration_duration", MetricKind::Trend),
    ("iteration_errors", MetricKind::Counter),
    ("dropped_iterations", MetricKind::Counter),
    ("checks", MetricKind::Rate),
    ("group_duration", MetricKind::Trend),
    ("http_reqs", MetricKind::Counter),
    ("http_req_duration", MetricKind::Trend),
    ("http_req_failed", MetricKind::Rate),
    ("data_sent", MetricKind::Counter),
    ("data_received", MetricKind::Counter),
];

pub fn builtin_kind(name: &str) -> Option<MetricKind> {
    BUILTIN_METRICS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, kind)| *kind)
}

/// Aggregated state of one run. Created at run start and injected into every
/// component; there is no process-global registry.
#[derive(Debug)]
pub struct MetricsRegistry {
    metrics: RwLock<BTreeMap<String, Metric>>,
    builtin: BuiltinMetrics,
    samples: AtomicU64,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut metrics = BTreeMap::new();
        let mut define = |name: &str, kind: MetricKind| {
            let metric = Metric(Arc::new(MetricEntry {
                name: name.to_string(),
                kind,
                buckets: RwLock::new(HashMap::new()),
            }));
            metrics.insert(name.to_string(), metric.clone());
            metric
        };
        let builtin = BuiltinMetrics {
            vus: define("vus", MetricKind::Gauge),
            vus_max: define("vus_max", MetricKind::Gauge),
            iterations: define("iterations", MetricKind::Counter),
            iteration_duration: define("iteration_duration", MetricKind::Trend),
            iteration_errors: define("iteration_errors", MetricKind::Counter),
            dropped_iterations: define("dropped_iterations", MetricKind::Counter),
            checks: define("checks", MetricKind::Rate),
            group_duration: define("group_duration", MetricKind::Trend),
            http_reqs: define("http_reqs", MetricKind::Counter),
            http_req_duration: define("http_req_duration", MetricKind::Trend),
            http_req_failed: define("http_req_failed", MetricKind::Rate),
            data_sent: define("data_sent", MetricKind::Counter),
            data_received: define("data_received", MetricKind::Counter),
        };
        Self {
            metrics: RwLock::new(metrics),
            builtin,
            samples: AtomicU64::new(0),
        }
    }

    pub fn builtin(&self) -> &BuiltinMetrics {
        &self.builtin
    }

    /// Returns the metric called `name`, registering it if needed.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<Metric, EngineError> {
        if name.is_empty() {
            return Err(EngineError::config("metric name cannot be empty"));
        }
        if let Some(existing) = self.metrics.read().get(name) {
            return Self::check_kind(existing, kind);
        }
        let mut metrics = self.metrics.write();
        let metric = metrics
            .entry(name.to_string())
            .or_insert_with(|| {
                Metric(Arc::new(MetricEntry {
                    name: name.to_string(),
                    kind,
                    buckets: RwLock::new(HashMap::new()),
                }))
            })
            .clone();
        Self::check_kind(&metric, kind)
    }

    fn check_kind(metric: &Metric, kind: MetricKind) -> Result<Metric, EngineError> {
        if metric.kind() == kind {
            Ok(metric.clone())
        } else {
            Err(EngineError::MetricKind {
                name: metric.name().to_string(),
                existing: metric.kind().as_str(),
                requested: kind.as_str(),
            })
        }
    }

    pub fn counter(&self, name: &str) -> Result<Metric, EngineError> {
        self.register(name, MetricKind::Counter)
    }

    pub fn gauge(&self, name: &str) -> Result<Metric, EngineError> {
        self.register(name, MetricKind::Gauge)
    }

    pub fn rate(&self, name: &str) -> Result<Metric, EngineError> {
        self.register(name, MetricKind::Rate)
    }

    pub fn trend(&self, name: &str) -> Result<Metric, EngineError> {
        self.register(name, MetricKind::Trend)
    }

    pub fn get(&self, name: &str) -> Option<Metric> {
        self.metrics.read().get(name).cloned()
    }

    /// Non-finite values are dropped with a warning.
    pub fn ingest(&self, sample: Sample) {
        if !sample.value.is_finite() {
            warn!(metric = %sample.metric.name(), value = sample.value, "Dropping non-finite sample");
            return;
        }
        self.samples.fetch_add(1, Ordering::Relaxed);
        sample.metric.0.add(sample.value, sample.tags, sample.time);
    }

    pub fn samples_ingested(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.metrics.read().values().cloned().collect()
    }

    pub fn aggregate_exact(&self, name: &str, tags: &TagSet) -> Option<Aggregate> {
        let metric = self.get(name)?;
        let buckets = metric.0.buckets.read();
        let bucket = buckets.get(tags)?;
        let agg = bucket.lock().clone();
        Some(agg)
    }

    /// Merge of every bucket whose tags include `filter`. An empty filter
    /// yields the metric's overall aggregate. Returns an empty aggregate when
    /// nothing matched, and `None` only for unknown metrics.
    pub fn aggregate(&self, name: &str, filter: &TagSet) -> Option<Aggregate> {
        let metric = self.get(name)?;
        let mut out = Aggregate::empty(metric.kind());
        let buckets = metric.0.buckets.read();
        for (tags, bucket) in buckets.iter() {
            if tags.contains_all(filter) {
                out.merge(&bucket.lock());
            }
        }
        Some(out)
    }

    pub fn buckets(&self, name: &str) -> Vec<(TagSet, Aggregate)> {
        let Some(metric) = self.get(name) else {
            return Vec::new();
        };
        let buckets = metric.0.buckets.read();
        buckets
            .iter()
            .map(|(tags, bucket)| (tags.clone(), bucket.lock().clone()))
            .collect()
    }

    pub fn has_samples(&self, name: &str) -> bool {
        self.get(name)
            .map(|m| !m.0.buckets.read().is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(metric: &Metric, value: f64, tags: TagSet) -> Sample {
        Sample {
            metric: metric.clone(),
            value,
            tags,
            time: Duration::ZERO,
        }
    }

    #[test]
    fn trend_percentiles_are_close_to_exact_ranks() {
        let registry = MetricsRegistry::new();
        let trend = registry.trend("latency").unwrap();
        for v in 1..=1000 {
            registry.ingest(sample(&trend, v as f64, TagSet::new()));
        }
        let agg = registry.aggregate("latency", &TagSet::new()).unwrap();
        let elapsed = Duration::from_secs(1);
        let p50 = agg.stat(&Stat::Percentile(50.0), elapsed).unwrap();
        let p95 = agg.stat(&Stat::Percentile(95.0), elapsed).unwrap();
        assert!((p50 - 500.0).abs() <= 5.0, "p50 = {p50}");
        assert!((p95 - 950.0).abs() <= 9.5, "p95 = {p95}");
        assert_eq!(agg.stat(&Stat::Min, elapsed), Some(1.0));
        assert_eq!(agg.stat(&Stat::Max, elapsed), Some(1000.0));
        assert_eq!(agg.stat(&Stat::Avg, elapsed), Some(500.5));
    }

    #[test]
    fn non_finite_trend_values_are_dropped() {
        let registry = MetricsRegistry::new();
        let ratio = registry.trend("ratio").unwrap();
        registry.ingest(sample(&ratio, 0.5, TagSet::new()));
        registry.ingest(sample(&ratio, f64::NAN, TagSet::new()));
        registry.ingest(sample(&ratio, f64::INFINITY, TagSet::new()));
        registry.ingest(sample(&ratio, f64::NEG_INFINITY, TagSet::new()));
        assert_eq!(registry.samples_ingested(), 1);

        let agg = registry.aggregate("ratio", &TagSet::new()).unwrap();
        let p95 = agg.stat(&Stat::Percentile(95.0), Duration::ZERO).unwrap();
        assert!((p95 - 0.5).abs() < 1e-3, "p95 = {p95}");

        let mut direct = TrendAgg::default();
        direct.record(f64::NAN);
        assert_eq!(direct.count, 0);
        assert_eq!(direct.percentile(95.0), 0.0);
    }

    #[test]
    fn negative_trend_values_keep_their_sign() {
        let registry = MetricsRegistry::new();
        let delta = registry.trend("delta").unwrap();
        for v in [-5.0, -3.0, -1.0] {
            registry.ingest(sample(&delta, v, TagSet::new()));
        }
        let agg = registry.aggregate("delta", &TagSet::new()).unwrap();
        let at = |stat: Stat| agg.stat(&stat, Duration::ZERO).unwrap();
        assert!((at(Stat::Med) + 3.0).abs() < 0.01, "med = {}", at(Stat::Med));
        assert!((at(Stat::Percentile(10.0)) + 5.0).abs() < 0.01);
        assert_eq!(at(Stat::Percentile(100.0)), -1.0);
        assert_eq!(at(Stat::Min), -5.0);
        assert_eq!(at(Stat::Avg), -3.0);

        let mixed = registry.trend("mixed").unwrap();
        for v in [-20.0, -10.0, 0.0, 10.0, 20.0] {
            registry.ingest(sample(&mixed, v, TagSet::new()));
        }
        let agg = registry.aggregate("mixed", &TagSet::new()).unwrap();
        let p = |pct: f64| agg.stat(&Stat::Percentile(pct), Duration::ZERO).unwrap();
        assert!((p(20.0) + 20.0).abs() < 0.05, "p20 = {}", p(20.0));
        assert!((p(40.0) + 10.0).abs() < 0.05, "p40 = {}", p(40.0));
        assert!(p(60.0).abs() < 0.05, "p60 = {}", p(60.0));
        assert!((p(100.0) - 20.0).abs() < 0.05);
    }

    #[test]
    fn rate_counts_true_fraction() {
        let registry = MetricsRegistry::new();
        let failed = registry.builtin().http_req_failed.clone();
        for _ in 0..100 {
            registry.ingest(sample(&failed, 0.0, TagSet::new()));
        }
        for _ in 0..5 {
            registry.ingest(sample(&failed, 1.0, TagSet::new()));
        }
        let agg = registry.aggregate("http_req_failed", &TagSet::new()).unwrap();
        let rate = agg.stat(&Stat::Rate, Duration::ZERO).unwrap();
        assert!((rate - 5.0 / 105.0).abs() < 1e-12);
        assert_eq!(registry.samples_ingested(), 105);
    }

    #[test]
    fn counter_rate_is_per_second() {
        let registry = MetricsRegistry::new();
        let errors = registry.counter("errors").unwrap();
        registry.ingest(sample(&errors, 3.0, TagSet::new()));
        registry.ingest(sample(&errors, 1.0, TagSet::new()));
        let agg = registry.aggregate("errors", &TagSet::new()).unwrap();
        assert_eq!(agg.stat(&Stat::Count, Duration::from_secs(2)), Some(4.0));
        assert_eq!(agg.stat(&Stat::Rate, Duration::from_secs(2)), Some(2.0));
        assert_eq!(agg.stat(&Stat::Avg, Duration::from_secs(2)), None);
    }

    #[test]
    fn gauge_keeps_latest_by_timestamp() {
        let registry = MetricsRegistry::new();
        let active = registry.gauge("active_users").unwrap();
        let at = |value: f64, secs: u64| Sample {
            metric: active.clone(),
            value,
            tags: TagSet::new(),
            time: Duration::from_secs(secs),
        };
        registry.ingest(at(5.0, 2));
        registry.ingest(at(9.0, 1));
        let agg = registry.aggregate("active_users", &TagSet::new()).unwrap();
        assert_eq!(agg.stat(&Stat::Value, Duration::ZERO), Some(5.0));
        assert_eq!(agg.stat(&Stat::Max, Duration::ZERO), Some(9.0));
        assert_eq!(agg.stat(&Stat::Min, Duration::ZERO), Some(5.0));
    }

    #[test]
    fn tag_filtered_aggregate_merges_matching_buckets() {
        let registry = MetricsRegistry::new();
        let duration = registry.builtin().http_req_duration.clone();
        let smoke = TagSet::new().with("test_type", "smoke");
        registry.ingest(sample(&duration, 100.0, smoke.clone().with("name", "a")));
        registry.ingest(sample(&duration, 300.0, smoke.clone().with("name", "b")));
        registry.ingest(sample(&duration, 900.0, TagSet::new().with("test_type", "load")));

        let filtered = registry.aggregate("http_req_duration", &smoke).unwrap();
        assert_eq!(filtered.count(), 2.0);
        assert_eq!(filtered.stat(&Stat::Max, Duration::ZERO), Some(300.0));

        let all = registry.aggregate("http_req_duration", &TagSet::new()).unwrap();
        assert_eq!(all.count(), 3.0);

        let exact = registry
            .aggregate_exact("http_req_duration", &smoke.clone().with("name", "a"))
            .unwrap();
        assert_eq!(exact.count(), 1.0);
        assert!(registry.aggregate_exact("http_req_duration", &smoke).is_none());
    }

    #[test]
    fn kind_conflicts_are_rejected() {
        let registry = MetricsRegistry::new();
        registry.counter("errors").unwrap();
        assert!(registry.counter("errors").is_ok());
        let err = registry.trend("errors").unwrap_err();
        assert!(matches!(err, EngineError::MetricKind { .. }));
        assert!(registry.rate("http_req_duration").is_err());
    }

    #[test]
    fn concurrent_ingest_loses_nothing() {
        let registry = Arc::new(MetricsRegistry::new());
        let iterations = registry.builtin().iterations.clone();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                let iterations = iterations.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        registry.ingest(Sample {
                            metric: iterations.clone(),
                            value: 1.0,
                            tags: TagSet::new().with("vu", (i % 2).to_string()),
                            time: Duration::ZERO,
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let agg = registry.aggregate("iterations", &TagSet::new()).unwrap();
        assert_eq!(agg.stat(&Stat::Count, Duration::ZERO), Some(8000.0));
    }

    #[test]
    fn stat_parsing() {
        assert_eq!("p(95)".parse::<Stat>(), Ok(Stat::Percentile(95.0)));
        assert_eq!("p(99.9)".parse::<Stat>(), Ok(Stat::Percentile(99.9)));
        assert_eq!("med".parse::<Stat>(), Ok(Stat::Med));
        assert!("p(101)".parse::<Stat>().is_err());
        assert!("median".parse::<Stat>().is_err());
        assert_eq!(Stat::Percentile(95.0).to_string(), "p(95)");
    }
}
