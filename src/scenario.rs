use std::time::Duration;

use serde::Serialize;

use crate::tags::TagSet;

pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACEFUL_RAMP_DOWN: Duration = Duration::from_secs(30);
/// Longest a scenario may last, start offset and graceful stop included.
pub const MAX_SCENARIO_SPAN: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stage {
    #[serde(with = "millis")]
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "executor", rename_all = "kebab-case")]
pub enum Executor {
    ConstantVus {
        vus: u64,
        #[serde(with = "millis")]
        duration: Duration,
    },
    RampingVus {
        start_vus: u64,
        stages: Vec<Stage>,
        #[serde(with = "millis")]
        graceful_ramp_down: Duration,
    },
    RampingArrivalRate {
        start_rate: u64,
        #[serde(with = "millis")]
        time_unit: Duration,
        pre_allocated_vus: u64,
        max_vus: u64,
        stages: Vec<Stage>,
    },
}

impl Executor {
    pub fn kind(&self) -> &'static str {
        match self {
            Executor::ConstantVus { .. } => "constant-vus",
            Executor::RampingVus { .. } => "ramping-vus",
            Executor::RampingArrivalRate { .. } => "ramping-arrival-rate",
        }
    }

    /// Length of the active part of the scenario, excluding graceful stop.
    pub fn duration(&self) -> Duration {
        match self {
            Executor::ConstantVus { duration, .. } => *duration,
            Executor::RampingVus { stages, .. } | Executor::RampingArrivalRate { stages, .. } => {
                stages
                .iter()
                .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration))
            }
        }
    }

    /// Concurrency (VU executors) or iterations per time unit (arrival rate)
    /// at `elapsed`, linearly interpolated between stage boundaries.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        match self {
            Executor::ConstantVus { vus, .. } => *vus as f64,
            Executor::RampingVus {
                start_vus, stages, ..
            } => interpolate(*start_vus, stages, elapsed),
            Executor::RampingArrivalRate {
                start_rate, stages, ..
            } => interpolate(*start_rate, stages, elapsed),
        }
    }

    /// Whole number of VUs wanted at `elapsed`. Only meaningful for VU executors.
    pub fn vus_at(&self, elapsed: Duration) -> u64 {
        self.target_at(elapsed).round() as u64
    }

    pub fn max_target(&self) -> u64 {
        match self {
            Executor::ConstantVus { vus, .. } => *vus,
            Executor::RampingVus {
                start_vus, stages, ..
            } => stages.iter().map(|s| s.target).fold(*start_vus, u64::max),
            Executor::RampingArrivalRate {
                start_rate, stages, ..
            } => stages.iter().map(|s| s.target).fold(*start_rate, u64::max),
        }
    }

    pub fn max_vus(&self) -> u64 {
        match self {
            Executor::RampingArrivalRate {
                pre_allocated_vus,
                max_vus,
                ..
            } => (*max_vus).max(*pre_allocated_vus),
            other => other.max_target(),
        }
    }
}

fn interpolate(start: u64, stages: &[Stage], elapsed: Duration) -> f64 {
    let mut from = start as f64;
    let mut stage_start = Duration::ZERO;
    for stage in stages {
        let stage_end = stage_start.saturating_add(stage.duration);
        let to = stage.target as f64;
        if elapsed < stage_end {
            let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
            return from + (to - from) * progress;
        }
        from = to;
        stage_start = stage_end;
    }
    from
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub name: String,
    #[serde(flatten)]
    pub executor: Executor,
    #[serde(with = "millis")]
    pub start_time: Duration,
    #[serde(with = "millis")]
    pub graceful_stop: Duration,
    pub tags: TagSet,
    /// Scenario-wide cap on iterations for VU-loop executors.
    pub iterations: Option<u64>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, executor: Executor) -> Self {
        Self {
            name: name.into(),
            executor,
            start_time: Duration::ZERO,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            tags: TagSet::new(),
            iterations: None,
        }
    }

    pub fn starting_at(mut self, start_time: Duration) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = graceful_stop;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn sample_tags(&self) -> TagSet {
        self.tags.clone().with("scenario", self.name.clone())
    }

    pub fn end_offset(&self) -> Duration {
        self.start_time.saturating_add(self.executor.duration())
    }

    /// Everything from run start to the end of the graceful stop.
    pub fn span(&self) -> Duration {
        self.end_offset().saturating_add(self.graceful_stop)
    }
}

/// Iterator over iteration start offsets of a ramping-arrival-rate profile.
///
/// Iteration `k` (from 0) starts at the first instant where the integral of
/// the rate curve exceeds `k`. Each stage contributes a linear rate segment,
/// so the crossing point is the root of a quadratic and is solved exactly.
#[derive(Debug, Clone)]
pub struct ArrivalSchedule {
    segments: Vec<Segment>,
    segment: usize,
    /// Integral accumulated before the current segment.
    consumed: f64,
    next: u64,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: f64,
    len: f64,
    from: f64,
    to: f64,
}

impl Segment {
    fn area(&self) -> f64 {
        (self.from + self.to) * self.len / 2.0
    }

    /// Smallest offset into the segment where the integral reaches `amount`.
    fn solve(&self, amount: f64) -> f64 {
        if amount <= 0.0 {
            return 0.0;
        }
        let slope = (self.to - self.from) / self.len;
        let disc = (self.from * self.from + 2.0 * slope * amount).max(0.0);
        // Rearranged root of from*t + slope*t^2/2 = amount; stable for slope == 0.
        2.0 * amount / (self.from + disc.sqrt())
    }
}

const EPSILON: f64 = 1e-9;

impl ArrivalSchedule {
    pub fn new(start_rate: u64, time_unit: Duration, stages: &[Stage]) -> Self {
        let unit = time_unit.as_secs_f64().max(EPSILON);
        let mut segments = Vec::with_capacity(stages.len());
        let mut from = start_rate as f64 / unit;
        let mut start = 0.0;
        for stage in stages {
            let to = stage.target as f64 / unit;
            let len = stage.duration.as_secs_f64();
            if len > 0.0 {
                segments.push(Segment {
                    start,
                    len,
                    from,
                    to,
                });
            }
            start += len;
            from = to;
        }
        Self {
            segments,
            segment: 0,
            consumed: 0.0,
            next: 0,
        }
    }
}

impl Iterator for ArrivalSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let wanted = self.next as f64;
        while let Some(seg) = self.segments.get(self.segment) {
            let idle = seg.from <= 0.0 && seg.to <= 0.0;
            let remaining = wanted - self.consumed;
            if !idle && remaining <= seg.area() + EPSILON {
                let offset = seg.solve(remaining);
                // A crossing exactly at the segment end belongs to the next segment.
                if offset < seg.len - EPSILON {
                    self.next += 1;
                    return Some(Duration::from_secs_f64(seg.start + offset));
                }
            }
            self.consumed += seg.area();
            self.segment += 1;
        }
        None
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
