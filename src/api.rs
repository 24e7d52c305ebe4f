//! Request/response contracts for job submission and status retrieval.
//!
//! These are the wire shapes of the service; the HTTP layer that carries
//! them is out of scope, so they live here as plain serde types.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use crate::config::EngineConfig;
use crate::defer::DeferInstructions;
use crate::errors::{EngineError, JobError};
use crate::job::{CssJob, JobId, JobStatus};
use crate::viewport::ViewportProfile;

/// Payload accepted by the generate endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub target_url: String,
    pub template: String,
    /// Profile names in priority order; defaulted from configuration when
    /// empty.
    #[serde(default)]
    pub viewport_profiles: Vec<String>,
    /// Cookies/headers needed to reach non-public pages.
    #[serde(default)]
    pub auth_headers: Option<HashMap<String, String>>,
}

/// A [`GenerateRequest`] that passed synchronous validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub target_url: Url,
    pub template: String,
    /// Resolved profiles, in request order.
    pub profiles: Vec<ViewportProfile>,
    pub auth_headers: Option<HashMap<String, String>>,
}

impl GenerateRequest {
    /// Validate synchronously against the engine configuration. Rejected
    /// requests never create a job.
    pub fn validate(self, config: &EngineConfig) -> Result<ValidatedRequest, EngineError> {
        let target_url = Url::parse(&self.target_url)
            .map_err(|e| EngineError::InvalidTargetUrl(format!("{}: {e}", self.target_url)))?;
        if !matches!(target_url.scheme(), "http" | "https") {
            return Err(EngineError::InvalidTargetUrl(format!(
                "unsupported scheme: {}",
                target_url.scheme()
            )));
        }

        let names = if self.viewport_profiles.is_empty() {
            config.default_viewport_profiles.clone()
        } else {
            self.viewport_profiles
        };
        if names.is_empty() {
            return Err(EngineError::NoViewports);
        }

        let mut profiles = Vec::with_capacity(names.len());
        for name in &names {
            let profile = config.viewports.resolve(name)?;
            // Dedup repeated names, keeping first occurrence.
            if !profiles.contains(profile) {
                profiles.push(profile.clone());
            }
        }

        Ok(ValidatedRequest {
            target_url,
            template: self.template,
            profiles,
            auth_headers: self.auth_headers,
        })
    }
}

/// Immediate response to an accepted generate request; the work itself is
/// asynchronous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateAccepted {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportDimensions {
    pub width: u32,
    pub height: u32,
}

/// Result payload present once a job completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalCssResult {
    pub critical_css: String,
    pub defer_instructions: DeferInstructions,
    pub viewports: BTreeMap<String, ViewportDimensions>,
    /// Debug artifact references (e.g. screenshots) keyed by viewport.
    #[serde(default)]
    pub artifacts: BTreeMap<String, Vec<String>>,
}

/// Response to a status poll. `result` only when completed, `error` only
/// when failed; a failed job never exposes partial CSS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub template: String,
    pub target_url: Url,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CriticalCssResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobStatusResponse {
    pub fn from_job(job: &CssJob, config: &EngineConfig) -> Self {
        let result = match (&job.status, &job.critical_css, &job.defer_snippet) {
            (JobStatus::Completed, Some(css), Some(defer)) => Some(CriticalCssResult {
                critical_css: css.clone(),
                defer_instructions: defer.clone(),
                viewports: job
                    .viewport_profiles
                    .iter()
                    .filter_map(|name| config.viewports.resolve(name).ok())
                    .map(|p| {
                        (
                            p.name.clone(),
                            ViewportDimensions {
                                width: p.width,
                                height: p.height,
                            },
                        )
                    })
                    .collect(),
                artifacts: job
                    .artifacts
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            }),
            _ => None,
        };

        Self {
            job_id: job.id,
            status: job.status,
            template: job.template.clone(),
            target_url: job.target_url.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            result,
            error: job.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(profiles: &[&str]) -> GenerateRequest {
        GenerateRequest {
            target_url: "https://shop.example/landing".to_string(),
            template: "landing".to_string(),
            viewport_profiles: profiles.iter().map(|s| s.to_string()).collect(),
            auth_headers: None,
        }
    }

    #[test]
    fn validate_resolves_profiles_in_order() {
        let config = EngineConfig::default();
        let valid = request(&["mobile", "desktop"]).validate(&config).unwrap();
        let names: Vec<_> = valid.profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["mobile", "desktop"]);
    }

    #[test]
    fn validate_defaults_profiles_when_empty() {
        let config = EngineConfig::default();
        let valid = request(&[]).validate(&config).unwrap();
        let names: Vec<_> = valid.profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["desktop", "mobile"]);
    }

    #[test]
    fn validate_rejects_unknown_viewport_synchronously() {
        let config = EngineConfig::default();
        let err = request(&["desktop", "fridge"]).validate(&config);
        assert!(matches!(err, Err(EngineError::UnknownViewport(name)) if name == "fridge"));
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let config = EngineConfig::default();
        let mut req = request(&["desktop"]);
        req.target_url = "not a url".to_string();
        assert!(matches!(
            req.validate(&config),
            Err(EngineError::InvalidTargetUrl(_))
        ));

        let mut req = request(&["desktop"]);
        req.target_url = "ftp://shop.example/x".to_string();
        assert!(matches!(
            req.validate(&config),
            Err(EngineError::InvalidTargetUrl(_))
        ));
    }

    #[test]
    fn status_response_hides_result_until_completed() {
        let config = EngineConfig::default();
        let job = CssJob::new(
            Url::parse("https://shop.example/landing").unwrap(),
            "landing".to_string(),
            vec!["desktop".to_string()],
        );
        let resp = JobStatusResponse::from_job(&job, &config);
        assert_eq!(resp.status, JobStatus::Queued);
        assert!(resp.result.is_none());
        assert!(resp.error.is_none());

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "queued");
        assert!(json.get("result").is_none());
        assert!(json["job_id"].as_str().unwrap().starts_with("css_"));
    }

    #[test]
    fn completed_job_serializes_result_fields() {
        let config = EngineConfig::default();
        let mut job = CssJob::new(
            Url::parse("https://shop.example/landing").unwrap(),
            "landing".to_string(),
            vec!["desktop".to_string()],
        );
        job.begin_processing().unwrap();
        job.record_artifact("desktop", "memory://shot-1".to_string());
        job.complete(
            "body{margin:0}".to_string(),
            crate::defer::compose(&["/static/app.css".to_string()]),
        )
        .unwrap();

        let resp = JobStatusResponse::from_job(&job, &config);
        let result = resp.result.as_ref().expect("completed job must carry a result");
        assert_eq!(result.critical_css, "body{margin:0}");
        assert_eq!(result.viewports["desktop"].width, 1440);
        assert_eq!(result.artifacts["desktop"], vec!["memory://shot-1"]);

        let json = serde_json::to_value(&resp).unwrap();
        assert!(json["result"]["defer_instructions"]["snippet"]
            .as_str()
            .unwrap()
            .contains("rel=\"preload\""));
    }
}
