use std::time::Duration;

use crate::viewport::ViewportSet;

const DEFAULT_USER_AGENT: &str = "CritCssEngine/1.0 (X11; Linux x86_64) HeadlessRender/1.0";

/// Retry behavior for transient per-viewport render failures.
///
/// Delays grow exponentially (doubled per attempt) from `base_delay` up to
/// `max_delay`; the worker adds jitter on top.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per viewport, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before the next attempt, given the number of attempts already
    /// made (1-based). Without jitter.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let exp = attempts_made.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Main engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// User agent string presented by render sessions and the reachability probe.
    pub user_agent: String,
    /// Viewport profiles available to job requests.
    pub viewports: ViewportSet,
    /// Profiles used when a request does not name any.
    pub default_viewport_profiles: Vec<String>,
    /// Maximum concurrently open rendering sessions (the scarce resource).
    pub max_render_sessions: usize,
    /// Maximum concurrently driven jobs. Kept separate from the render pool
    /// so orchestration never starves behind render-bound work.
    pub orchestration_workers: usize,
    /// Per render attempt: navigation plus stability must fit in this window.
    pub render_timeout: Duration,
    /// Network-idle window that counts as the stability signal.
    pub quiet_period: Duration,
    /// Wait after the scroll nudge before capture.
    pub scroll_settle: Duration,
    /// Ceiling on wall time a job may spend in `processing`.
    pub job_deadline: Duration,
    pub retry: RetryPolicy,
    /// Fraction of requested viewports that must succeed for the job to
    /// complete. 1.0 means every requested viewport.
    pub required_success_fraction: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            viewports: ViewportSet::builtin(),
            default_viewport_profiles: vec!["desktop".to_string(), "mobile".to_string()],
            max_render_sessions: 4,
            orchestration_workers: num_cpus::get().max(2),
            render_timeout: Duration::from_secs(60),
            quiet_period: Duration::from_millis(500),
            scroll_settle: Duration::from_millis(150),
            job_deadline: Duration::from_secs(180),
            retry: RetryPolicy::default(),
            required_success_fraction: 1.0,
        }
    }
}
