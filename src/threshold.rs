use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::error::EngineError;
use crate::metrics::{builtin_kind, MetricsRegistry, Stat};
use crate::tags::TagSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Gt => lhs > rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Eq => lhs == rhs,
            Comparison::Ne => lhs != rhs,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        })
    }
}

/// `metric` or `metric{tag:value,...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub metric: String,
    pub tags: TagSet,
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let Some(open) = raw.find('{') else {
            if raw.is_empty() {
                return Err("empty metric name".to_string());
            }
            return Ok(Selector {
                metric: raw.to_string(),
                tags: TagSet::new(),
            });
        };
        let metric = raw[..open].trim();
        let body = raw[open + 1..]
            .strip_suffix('}')
            .ok_or_else(|| "missing closing `}`".to_string())?;
        if metric.is_empty() {
            return Err("empty metric name".to_string());
        }
        let mut tags = TagSet::new();
        for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| format!("tag filter `{}` is not `key:value`", pair))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(format!("tag filter `{}` has an empty key", pair));
            }
            tags.insert(key, value.trim());
        }
        Ok(Selector {
            metric: metric.to_string(),
            tags,
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tags.is_empty() {
            f.write_str(&self.metric)
        } else {
            write!(f, "{}{}", self.metric, self.tags)
        }
    }
}

/// `stat op bound`, e.g. `p(95)<500` or `rate<0.1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub stat: Stat,
    pub op: Comparison,
    pub bound: f64,
}

impl Expression {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let pos = raw
            .find(|c| matches!(c, '<' | '>' | '=' | '!'))
            .ok_or_else(|| "missing comparison operator".to_string())?;
        let (stat, rest) = raw.split_at(pos);
        let (op, bound) = [
            ("===", Comparison::Eq),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ]
        .iter()
        .find_map(|(token, op)| rest.strip_prefix(token).map(|bound| (*op, bound)))
        .ok_or_else(|| format!("unknown operator in `{}`", rest))?;
        let stat: Stat = stat.parse()?;
        let bound: f64 = bound
            .trim()
            .parse()
            .map_err(|_| format!("bound `{}` is not a number", bound.trim()))?;
        Ok(Expression { stat, op, bound })
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.stat, self.op, self.bound)
    }
}

#[derive(Debug, Clone)]
pub struct Threshold {
    pub selector: Selector,
    pub source: String,
    pub expression: Expression,
    /// Evaluate during the run and stop all scenarios on failure.
    pub abort_on_fail: bool,
    /// Mid-run evaluation does not start before this much run time.
    pub delay_abort_eval: Duration,
}

impl Threshold {
    pub fn parse(selector: &str, expr: &str) -> Result<Self, EngineError> {
        let parsed_selector =
            Selector::parse(selector).map_err(|reason| EngineError::threshold(selector, expr, reason))?;
        let expression =
            Expression::parse(expr).map_err(|reason| EngineError::threshold(selector, expr, reason))?;
        if let Some(kind) = builtin_kind(&parsed_selector.metric) {
            if !kind.supports(&expression.stat) {
                return Err(EngineError::threshold(
                    selector,
                    expr,
                    format!("`{}` is not available on {} metrics", expression.stat, kind),
                ));
            }
        }
        Ok(Threshold {
            selector: parsed_selector,
            source: expr.trim().to_string(),
            expression,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        })
    }

    pub fn aborting(mut self, delay: Duration) -> Self {
        self.abort_on_fail = true;
        self.delay_abort_eval = delay;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub selector: String,
    pub expression: String,
    /// Observed value; `None` when the metric is unknown or of the wrong kind.
    pub observed: Option<f64>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Evaluates one threshold against the current aggregates.
pub fn evaluate(threshold: &Threshold, registry: &MetricsRegistry, elapsed: Duration) -> ThresholdResult {
    let selector = threshold.selector.to_string();
    let expression = threshold.source.clone();
    let failed = |error: String| ThresholdResult {
        selector: selector.clone(),
        expression: expression.clone(),
        observed: None,
        passed: false,
        error: Some(error),
    };

    let Some(metric) = registry.get(&threshold.selector.metric) else {
        return failed(format!("metric `{}` was never registered", threshold.selector.metric));
    };
    if !metric.kind().supports(&threshold.expression.stat) {
        return failed(format!(
            "`{}` is not available on {} metrics",
            threshold.expression.stat,
            metric.kind()
        ));
    }
    let observed = registry
        .aggregate(&threshold.selector.metric, &threshold.selector.tags)
        .and_then(|agg| agg.stat(&threshold.expression.stat, elapsed));
    match observed {
        Some(value) => ThresholdResult {
            passed: threshold
                .expression
                .op
                .holds(value, threshold.expression.bound),
            observed: Some(value),
            selector: selector.clone(),
            expression: expression.clone(),
            error: None,
        },
        None => failed("no value could be computed".to_string()),
    }
}

pub fn evaluate_all(
    thresholds: &[Threshold],
    registry: &MetricsRegistry,
    elapsed: Duration,
) -> Vec<ThresholdResult> {
    thresholds
        .iter()
        .map(|t| {
            let result = evaluate(t, registry, elapsed);
            if !result.passed {
                warn!(
                    selector = %result.selector,
                    expression = %result.expression,
                    observed = ?result.observed,
                    "Threshold crossed"
                );
            }
            result
        })
        .collect()
}

/// Mid-run check: the first failing abort-on-fail threshold, if any.
pub fn abort_check(
    thresholds: &[Threshold],
    registry: &MetricsRegistry,
    elapsed: Duration,
) -> Option<ThresholdResult> {
    thresholds
        .iter()
        .filter(|t| t.abort_on_fail && elapsed >= t.delay_abort_eval)
        .map(|t| evaluate(t, registry, elapsed))
        .find(|r| !r.passed)
}
