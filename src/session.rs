//! The render-session capability boundary.
//!
//! Driving a real headless browser lives behind [`RenderSession`], so the
//! orchestrator and merger are testable against implementations that return
//! canned coverage data. The contract for a real implementation:
//!
//! - open an isolated rendering context sized to the profile, applying
//!   `auth_headers` and the engine user agent;
//! - start CSS usage tracking *before* navigation;
//! - navigate and wait for stability: network idle for `quiet_period` or an
//!   explicit DOM-settled signal, whichever comes first, bounded by
//!   `timeout`;
//! - nudge the scroll position by at most `profile.scroll_tolerance_px`
//!   (never past the viewport's own height) and wait `scroll_settle` to
//!   flush lazily-loaded content;
//! - report `above_fold_height_px` as the visible viewport height at
//!   capture, not the scrollable document height;
//! - tear the context down unconditionally, success or failure.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use url::Url;

use crate::coverage::RawCapture;
use crate::errors::RenderFailure;
use crate::viewport::ViewportProfile;

/// Everything a session needs for one render attempt.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub target_url: Url,
    pub profile: ViewportProfile,
    pub auth_headers: Option<HashMap<String, String>>,
    pub user_agent: String,
    /// Hard bound on navigation plus stability.
    pub timeout: Duration,
    pub quiet_period: Duration,
    pub scroll_settle: Duration,
}

/// One isolated browser rendering capability.
pub trait RenderSession: Send + Sync {
    fn render<'a>(&'a self, req: RenderRequest)
        -> BoxFuture<'a, Result<RawCapture, RenderFailure>>;
}

/// Pre-dispatch reachability check for the target host. A probe failure
/// short-circuits the job before any render session is spent on it.
pub trait TargetProbe: Send + Sync {
    fn probe<'a>(
        &'a self,
        url: &'a Url,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), RenderFailure>>;
}

/// HTTP HEAD probe against the target URL.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }
}

impl TargetProbe for HttpProbe {
    fn probe<'a>(
        &'a self,
        url: &'a Url,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), RenderFailure>> {
        async move {
            // Any response, even an error status, proves the host answers;
            // rendering may still succeed where a HEAD gets a 405.
            self.client
                .head(url.as_str())
                .timeout(timeout)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| {
                    if e.is_timeout() {
                        RenderFailure::NavigationTimeout
                    } else {
                        RenderFailure::NetworkError(e.to_string())
                    }
                })
        }
        .boxed()
    }
}

/// Probe that always reports the host reachable. For setups where the
/// session implementation does its own preflight.
#[derive(Debug, Default)]
pub struct NullProbe;

impl TargetProbe for NullProbe {
    fn probe<'a>(
        &'a self,
        _url: &'a Url,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<(), RenderFailure>> {
        async { Ok(()) }.boxed()
    }
}

/// Session returning canned captures keyed by viewport name. The standard
/// stand-in for a browser in tests and local development.
#[derive(Debug, Default)]
pub struct StaticSession {
    captures: HashMap<String, Result<RawCapture, RenderFailure>>,
}

impl StaticSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capture(mut self, viewport: &str, capture: RawCapture) -> Self {
        self.captures.insert(viewport.to_string(), Ok(capture));
        self
    }

    pub fn with_failure(mut self, viewport: &str, failure: RenderFailure) -> Self {
        self.captures.insert(viewport.to_string(), Err(failure));
        self
    }
}

impl RenderSession for StaticSession {
    fn render<'a>(
        &'a self,
        req: RenderRequest,
    ) -> BoxFuture<'a, Result<RawCapture, RenderFailure>> {
        let result = self.captures.get(&req.profile.name).cloned().unwrap_or_else(|| {
            Err(RenderFailure::PageCrashed(format!(
                "no canned capture for viewport {}",
                req.profile.name
            )))
        });
        async move { result }.boxed()
    }
}
