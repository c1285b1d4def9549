//! The resource decision: a constrained two-variable optimisation that moves
//! the replica count and the per-IP rate limit jointly.
//!
//! Both actuators are expressed as multipliers on the current state: `x` for
//! replicas (`new_replicas = R * x`) and `y` for the limit
//! (`new_limit = ceil(L * y)`), coupled along `y = k * x` where `k` is the
//! scale factor that brings CPU utilisation back to target while accounting
//! for latency compliance.

use tracing::warn;

use crate::config::AnalyzeConfig;
use crate::monitor::Report;

/// Limit multipliers this close to 1 are treated as "no change".
const LIMIT_EPSILON: f64 = 1e-4;
/// Below this many limited requests/s, rate limiting is effectively idle.
const IDLE_LIMITED_RATE: f64 = 0.1;
/// Above this spread of 429 rates across IPs the limited-traffic signal is
/// too noisy to steer the limit with.
const STDDEV_CEILING: f64 = 4.0;

/// Outcome of the optimisation; `None` fields mean "leave that actuator
/// alone".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decision {
    pub replicas: Option<u64>,
    pub limit: Option<u32>,
}

impl Decision {
    fn none() -> Self {
        Self::default()
    }
}

/// Decides the next replica count and limit for one report, given the
/// current state `(replicas, limit)` from the knowledge base.
pub fn decide(cfg: &AnalyzeConfig, replicas: u64, limit: u32, report: &Report) -> Decision {
    let r = replicas as f64;
    let l = limit as f64;

    let k = ((cfg.target_utilization / report.average_cpu_utilization)
        * report.requests.good_latency_percent)
        .sqrt();

    let mut x_upper = cfg.max_replicas as f64 / r;
    let mut x_lower = cfg.min_replicas as f64 / r;

    let total = report.requests.total_rate;
    let non_limited = report.requests.non_limited_rate.min(total);
    let limited = total - non_limited;
    let stddev = report.requests.limited_rates_stddev;

    let x;
    let y;
    if limited < IDLE_LIMITED_RATE || stddev.is_nan() || stddev > STDDEV_CEILING {
        // The limited-traffic signal is unusable, so the limit is frozen and
        // replicas alone absorb the utilisation error: x = U_obs / (U* * g).
        x = normalize(1.0 / (k * k), x_lower, x_upper, r);
        y = 1.0;
    } else {
        // Do not admit more traffic than current throughput can serve, and
        // keep the resulting limit at or above the floor.
        x_upper = x_upper.min(total / (non_limited * k));
        x_lower = x_lower.max(cfg.min_limit as f64 / (l * k));
        if x_lower > x_upper {
            warn!(x_lower, x_upper, "NO SOLUTION");
            return Decision::none();
        }

        // Cost is linear in x, so the optimum sits on a bound.
        let slope = -k * non_limited * cfg.limited_request_cost + r * cfg.replica_cost;
        let chosen = if slope > 0.0 { x_lower } else { x_upper };
        x = normalize(chosen, x_lower, x_upper, r);
        y = k * x;
    }

    let scaled = (r * x).round();
    if scaled.is_nan() || scaled == 0.0 {
        warn!(x, k, "dropping pathological resource decision");
        return Decision::none();
    }

    let new_replicas = scaled as u64;
    Decision {
        replicas: (new_replicas != replicas).then_some(new_replicas),
        limit: ((y - 1.0).abs() > LIMIT_EPSILON).then(|| (l * y).ceil() as u32),
    }
}

/// Projects `x` into `[lower, upper]` and onto a point where `replicas * x`
/// is an integer. Overshooting the upper bound rounds down; sitting at or
/// below the lower bound rounds up (which keeps the derived limit at or
/// above its floor); anywhere else rounds half-to-even.
fn normalize(mut x: f64, lower: f64, upper: f64, replicas: f64) -> f64 {
    if x > upper {
        x = upper;
        x *= (x * replicas).floor() / (x * replicas);
    } else if x <= lower {
        x = lower;
        x *= (x * replicas).ceil() / (x * replicas);
    } else {
        x *= (x * replicas).round_ties_even() / (x * replicas);
    }
    x
}
