use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

use crate::coverage::ViewportCoverage;
use crate::defer::DeferInstructions;
use crate::errors::{EngineError, JobError, RenderFailure};

/// Job identifier. Wire form is `css_<32 hex>`, matching what the service
/// always handed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "css_{}", self.0.simple())
    }
}

impl FromStr for JobId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("css_").ok_or(EngineError::JobNotFound)?;
        let uuid = Uuid::try_parse(hex).map_err(|_| EngineError::JobNotFound)?;
        Ok(Self(uuid))
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| serde::de::Error::custom("invalid job id"))
    }
}

/// Lifecycle of a job. Transitions are monotonic: `queued → processing →
/// {completed, failed}`; terminal states are never left. Regeneration means
/// a new job record, never resurrecting an old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Terminal per-viewport outcome as recorded on the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ViewportOutcome {
    Rendered { coverage: ViewportCoverage },
    Failed { failure: RenderFailure },
}

/// The unit of work and its durable record.
///
/// Only the orchestrator mutates a job; render tasks hand outcomes back over
/// a channel and never touch the record. All mutation goes through the
/// transition methods below, which enforce the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CssJob {
    pub id: JobId,
    pub target_url: Url,
    pub template: String,
    /// Requested profile names, in request order. Immutable after creation.
    pub viewport_profiles: Vec<String>,
    pub status: JobStatus,
    /// Render attempts consumed per viewport.
    pub attempt_counts: HashMap<String, u32>,
    pub per_viewport_results: HashMap<String, ViewportOutcome>,
    pub critical_css: Option<String>,
    pub defer_snippet: Option<DeferInstructions>,
    /// Debug artifact references per viewport. Advisory only.
    pub artifacts: HashMap<String, Vec<String>>,
    pub error: Option<JobError>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl CssJob {
    /// Create a fresh job in `queued`.
    pub fn new(target_url: Url, template: String, viewport_profiles: Vec<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: JobId::new(),
            target_url,
            template,
            viewport_profiles,
            status: JobStatus::Queued,
            attempt_counts: HashMap::new(),
            per_viewport_results: HashMap::new(),
            critical_css: None,
            defer_snippet: None,
            artifacts: HashMap::new(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), EngineError> {
        let legal = matches!(
            (self.status, to),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Queued, JobStatus::Failed)
        );
        if !legal {
            return Err(EngineError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// `queued → processing`, when a worker slot became available.
    pub fn begin_processing(&mut self) -> Result<(), EngineError> {
        self.transition(JobStatus::Processing)
    }

    /// Record the terminal outcome of one viewport. Only legal while
    /// `processing`, and only for a requested profile.
    pub fn record_viewport(
        &mut self,
        viewport: &str,
        attempts: u32,
        outcome: ViewportOutcome,
    ) -> Result<(), EngineError> {
        if self.status != JobStatus::Processing {
            return Err(EngineError::IllegalTransition {
                from: self.status,
                to: self.status,
            });
        }
        if !self.viewport_profiles.iter().any(|p| p == viewport) {
            return Err(EngineError::UnknownViewport(viewport.to_string()));
        }
        self.attempt_counts.insert(viewport.to_string(), attempts);
        self.per_viewport_results.insert(viewport.to_string(), outcome);
        self.touch();
        Ok(())
    }

    pub fn record_artifact(&mut self, viewport: &str, reference: String) {
        self.artifacts
            .entry(viewport.to_string())
            .or_default()
            .push(reference);
        self.touch();
    }

    /// `processing → completed`. Refuses an empty critical stylesheet so a
    /// completed job always carries a result.
    pub fn complete(
        &mut self,
        critical_css: String,
        defer_snippet: DeferInstructions,
    ) -> Result<(), EngineError> {
        if critical_css.is_empty() {
            return Err(EngineError::Merge(
                "refusing to complete a job with empty critical css".to_string(),
            ));
        }
        self.transition(JobStatus::Completed)?;
        self.critical_css = Some(critical_css);
        self.defer_snippet = Some(defer_snippet);
        self.completed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    /// Transition into `failed` with a terminal error. Result fields stay
    /// empty: completeness is all-or-nothing per job.
    pub fn fail(&mut self, error: JobError) -> Result<(), EngineError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error);
        self.completed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    /// Coverage of every viewport that rendered successfully.
    pub fn successful_coverage(&self) -> Vec<ViewportCoverage> {
        self.per_viewport_results
            .values()
            .filter_map(|o| match o {
                ViewportOutcome::Rendered { coverage } => Some(coverage.clone()),
                ViewportOutcome::Failed { .. } => None,
            })
            .collect()
    }

    /// Fraction of requested viewports with a successful render.
    pub fn success_fraction(&self) -> f64 {
        if self.viewport_profiles.is_empty() {
            return 0.0;
        }
        let ok = self
            .per_viewport_results
            .values()
            .filter(|o| matches!(o, ViewportOutcome::Rendered { .. }))
            .count();
        ok as f64 / self.viewport_profiles.len() as f64
    }
}
