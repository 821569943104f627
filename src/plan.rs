use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rand::Rng;
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{DurationValue, OptionsConfig};
use crate::error::{EngineError, WorkloadError};
use crate::http::{HttpRequest, HttpResponse};
use crate::metrics::{Metric, MetricsRegistry};
use crate::types::EnvConfig;
use crate::vu::{millis, VuContext, Workload};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    #[serde(flatten)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub requests: Vec<RequestSpec>,
    pub think_time: Option<ThinkTime>,
    pub warmup_url: Option<String>,
    pub base_url: Option<String>,
}

impl ScriptConfig {
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute, or relative to the base URL.
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Strings are sent as-is, anything else as JSON.
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_status")]
    pub expect_status: u16,
    pub max_duration: Option<DurationValue>,
    pub body_contains: Option<String>,
    pub group: Option<String>,
    /// Variable name -> JSON pointer into the response body. Captured values
    /// fill `{{name}}` placeholders in the URL, headers and body of later
    /// requests made by the same VU.
    #[serde(default)]
    pub capture: BTreeMap<String, String>,
}

/// Pause after each request: fixed, or uniformly random in `[min, max]`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum ThinkTime {
    Fixed(DurationValue),
    Range { min: DurationValue, max: DurationValue },
}

impl ThinkTime {
    pub fn sample(&self) -> Duration {
        match *self {
            ThinkTime::Fixed(d) => d.0,
            ThinkTime::Range { min, max } if min.0 >= max.0 => min.0,
            ThinkTime::Range { min, max } => rand::thread_rng().gen_range(min.0..=max.0),
        }
    }
}

#[derive(Debug, Clone)]
struct PreparedRequest {
    name: String,
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
    json: bool,
    expect_status: u16,
    max_duration: Option<Duration>,
    body_contains: Option<String>,
    group: Option<String>,
    capture: Vec<(String, String)>,
}

/// Replaces every `{{name}}` in `template` with the VU's value for `name`.
fn substitute(template: &str, vars: &HashMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let name = rest[open + 2..open + 2 + close].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| format!("`{{{{{}}}}}` has not been captured", name))?;
        out.push_str(&rest[..open]);
        out.push_str(value);
        rest = &rest[open + 2 + close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Text of the JSON value at `pointer`; strings are taken without quotes.
fn capture_value(body: &serde_json::Value, pointer: &str) -> Option<String> {
    match body.pointer(pointer)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn resolve_url(base: Option<&str>, url: &str) -> Result<String, EngineError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(url.to_string());
    }
    let base = base.ok_or_else(|| {
        EngineError::config(format!(
            "request url `{}` is relative but no base URL is set (baseUrl or STRESS_BASE_URL)",
            url
        ))
    })?;
    Ok(format!(
        "{}/{}",
        base.trim_end_matches('/'),
        url.trim_start_matches('/')
    ))
}

#[derive(Debug)]
pub struct RequestPlan {
    requests: Vec<PreparedRequest>,
    think_time: Option<ThinkTime>,
    warmup_url: Option<String>,
    bearer_token: Option<String>,
    errors: Metric,
    latency: Metric,
}

pub struct PlanData {
    started_at: SystemTime,
}

impl RequestPlan {
    /// Builds the plan; environment values take precedence over the document.
    pub fn new(
        config: &ScriptConfig,
        env: &EnvConfig,
        registry: &MetricsRegistry,
    ) -> Result<Self, EngineError> {
        if config.requests.is_empty() {
            return Err(EngineError::config("request plan has no requests"));
        }
        let base = env.base_url.as_deref().or(config.base_url.as_deref());

        let mut requests = Vec::with_capacity(config.requests.len());
        for spec in &config.requests {
            let method = Method::from_bytes(spec.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| {
                    EngineError::config(format!(
                        "request `{}`: invalid method `{}`",
                        spec.name, spec.method
                    ))
                })?;
            let (body, json) = match &spec.body {
                None => (None, false),
                Some(serde_json::Value::String(s)) => (Some(s.clone()), false),
                Some(value) => (Some(serde_json::to_string(value)?), true),
            };
            for (var, pointer) in &spec.capture {
                if !pointer.is_empty() && !pointer.starts_with('/') {
                    return Err(EngineError::config(format!(
                        "request `{}`: capture `{}` needs a JSON pointer such as `/id`, got `{}`",
                        spec.name, var, pointer
                    )));
                }
            }
            requests.push(PreparedRequest {
                name: spec.name.clone(),
                method,
                url: resolve_url(base, &spec.url)?,
                headers: spec
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                body,
                json,
                expect_status: spec.expect_status,
                max_duration: spec.max_duration.map(|d| d.0),
                body_contains: spec.body_contains.clone(),
                group: spec.group.clone(),
                capture: spec
                    .capture
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
        }

        let warmup_url = config
            .warmup_url
            .as_deref()
            .map(|url| resolve_url(base, url))
            .transpose()?;

        Ok(Self {
            requests,
            think_time: config.think_time,
            warmup_url,
            bearer_token: env.bearer_token.clone(),
            errors: registry.counter("errors")?,
            latency: registry.trend("api_latency")?,
        })
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn describe(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.requests
            .iter()
            .map(|r| (r.name.as_str(), r.method.as_str(), r.url.as_str()))
    }

    fn build(
        &self,
        req: &PreparedRequest,
        vars: &HashMap<String, String>,
    ) -> Result<HttpRequest, String> {
        let url = substitute(&req.url, vars)?;
        let mut request = HttpRequest::new(req.method.clone(), url).name(req.name.clone());
        if req.json {
            request = request.header("Content-Type", "application/json");
        }
        let own_auth = req
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("authorization"));
        if let (Some(token), false) = (&self.bearer_token, own_auth) {
            request = request.bearer(token);
        }
        for (name, value) in &req.headers {
            request = request.header(name.clone(), substitute(value, vars)?);
        }
        if let Some(body) = &req.body {
            request = request.body(substitute(body, vars)?.into_bytes());
        }
        Ok(request)
    }

    fn capture(
        req: &PreparedRequest,
        vu: &mut VuContext,
        response: &HttpResponse,
    ) -> Result<(), String> {
        if req.capture.is_empty() {
            return Ok(());
        }
        let body: serde_json::Value = response
            .json()
            .map_err(|e| format!("{}: response is not JSON, nothing captured: {}", req.name, e))?;
        for (var, pointer) in &req.capture {
            let value = capture_value(&body, pointer)
                .ok_or_else(|| format!("{}: no value at `{}` for `{}`", req.name, pointer, var))?;
            debug!(vu = vu.id(), var = %var, "Captured value");
            vu.state_mut().insert(var.clone(), value);
        }
        Ok(())
    }
}

#[async_trait]
impl Workload for RequestPlan {
    type Data = PlanData;

    async fn setup(&self, ctx: &mut VuContext) -> Result<PlanData, WorkloadError> {
        if let Some(url) = &self.warmup_url {
            let response = ctx.get(url).await;
            if !ctx.check("warmup successful", response.status == 200) {
                warn!(url = %url, status = response.status, "Warmup request failed");
            }
        }
        Ok(PlanData {
            started_at: SystemTime::now(),
        })
    }

    async fn iteration(&self, vu: &mut VuContext, _data: &PlanData) -> Result<(), WorkloadError> {
        for req in &self.requests {
            if let Some(group) = &req.group {
                vu.enter_group(group);
            }
            let request = match self.build(req, vu.state()) {
                Ok(request) => request,
                Err(reason) => {
                    vu.add(&self.errors, 1.0);
                    if req.group.is_some() {
                        vu.leave_group();
                    }
                    return Err(format!("{} not sent: {}", req.name, reason).into());
                }
            };
            let response = vu.request(request).await;

            let mut checks = vec![(
                format!("{} status is {}", req.name, req.expect_status),
                response.status == req.expect_status,
            )];
            if let Some(limit) = req.max_duration {
                checks.push((
                    format!("{} response time < {}ms", req.name, limit.as_millis()),
                    response.elapsed < limit,
                ));
            }
            if let Some(needle) = &req.body_contains {
                checks.push((
                    format!("{} body contains text", req.name),
                    response.text().contains(needle.as_str()),
                ));
            }
            let named: Vec<(&str, bool)> = checks.iter().map(|(n, p)| (n.as_str(), *p)).collect();
            if !vu.checks(&named) {
                vu.add(&self.errors, 1.0);
            }
            vu.add(&self.latency, millis(response.elapsed));

            if req.group.is_some() {
                vu.leave_group();
            }
            if let Some(err) = &response.error {
                return Err(format!("{} failed: {}", req.name, err).into());
            }
            if response.status == req.expect_status {
                if let Err(reason) = Self::capture(req, vu, &response) {
                    vu.add(&self.errors, 1.0);
                    return Err(reason.into());
                }
            }
            if let Some(think) = &self.think_time {
                vu.sleep(think.sample()).await;
            }
        }
        debug!(vu = vu.id(), iteration = vu.iteration(), "Plan iteration done");
        Ok(())
    }

    async fn teardown(&self, _ctx: &mut VuContext, data: &PlanData) -> Result<(), WorkloadError> {
        let took = data.started_at.elapsed().unwrap_or_default();
        info!(
            started = %humantime::format_rfc3339_seconds(data.started_at),
            took = %humantime::format_duration(Duration::from_secs(took.as_secs())),
            "Request plan finished"
        );
        Ok(())
    }
}
