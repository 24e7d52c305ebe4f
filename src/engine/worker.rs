//! Per-job driver: dispatches viewport render tasks across the bounded
//! pool, joins them, and walks the job to its terminal state. The driver is
//! the only writer of its job record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::ValidatedRequest;
use crate::config::{EngineConfig, RetryPolicy};
use crate::coverage::{self, RawCapture, ViewportCoverage};
use crate::defer;
use crate::engine::{EngineEvent, EngineServices};
use crate::errors::{JobError, JobErrorKind, RenderFailure};
use crate::job::{CssJob, JobId, ViewportOutcome};
use crate::merge;
use crate::session::RenderRequest;
use crate::viewport::ViewportProfile;

/// Everything a job driver needs, cloned out of the engine at submit time.
pub(crate) struct JobContext {
    pub config: Arc<EngineConfig>,
    pub services: EngineServices,
    pub render_slots: Arc<Semaphore>,
    pub driver_slots: Arc<Semaphore>,
    pub event_tx: broadcast::Sender<EngineEvent>,
    pub shutdown: CancellationToken,
}

/// Drive one job from `queued` to a terminal state. Never propagates an
/// error into another job's processing; failures end up on the job record
/// or in the log.
pub(crate) async fn drive_job(ctx: JobContext, job_id: JobId, request: ValidatedRequest) {
    if let Err(e) = run(&ctx, job_id, request).await {
        warn!("critical css job {job_id}: driver error: {e:#}");
    }
}

async fn run(ctx: &JobContext, job_id: JobId, request: ValidatedRequest) -> anyhow::Result<()> {
    // Orchestration slot: keeps job-level work bounded independently of the
    // render pool.
    let _driver_permit = ctx.driver_slots.clone().acquire_owned().await?;

    let mut job = ctx.services.jobs.load(job_id)?;
    job.begin_processing()?;
    ctx.services.jobs.save(&job)?;
    info!(
        "critical css job {job_id} started: {} ({} viewports)",
        job.target_url,
        request.profiles.len()
    );
    let _ = ctx.event_tx.send(EngineEvent::JobStarted { job_id });

    // Host-level preflight. An unreachable target short-circuits without
    // spending render sessions or per-viewport retries.
    if let Err(failure) = ctx
        .services
        .probe
        .probe(&job.target_url, ctx.config.render_timeout)
        .await
    {
        return finish_failed(
            ctx,
            job,
            JobError::new(
                JobErrorKind::HostUnreachable,
                format!("target host preflight failed: {failure}"),
            ),
        );
    }

    let mut tasks: JoinSet<ViewportReport> = JoinSet::new();
    for profile in request.profiles.clone() {
        tasks.spawn(render_viewport(ViewportTask {
            job_id,
            target_url: job.target_url.clone(),
            profile,
            auth_headers: request.auth_headers.clone(),
            config: ctx.config.clone(),
            services: ctx.services.clone(),
            render_slots: ctx.render_slots.clone(),
            event_tx: ctx.event_tx.clone(),
        }));
    }

    // Barrier join: merge only runs after every viewport reached a terminal
    // per-viewport outcome, bounded by the job deadline.
    let deadline = tokio::time::sleep(ctx.config.job_deadline);
    tokio::pin!(deadline);
    let mut interrupted: Option<&str> = None;

    loop {
        tokio::select! {
            next = tasks.join_next() => {
                let Some(joined) = next else { break };
                match joined {
                    Ok(report) => record(ctx, &mut job, report)?,
                    Err(join_err) => {
                        warn!("critical css job {job_id}: viewport task join failed: {join_err}");
                    }
                }
            }
            _ = &mut deadline => {
                interrupted = Some("processing deadline exceeded");
                break;
            }
            _ = ctx.shutdown.cancelled() => {
                interrupted = Some("engine shut down before completion");
                break;
            }
        }
    }

    if let Some(reason) = interrupted {
        // Aborting the task set cancels outstanding sessions at their await
        // points; their pool permits release on drop.
        tasks.shutdown().await;
        return finish_failed(
            ctx,
            job,
            JobError::new(JobErrorKind::JobTimeout, reason.to_string()),
        );
    }

    let coverages = job.successful_coverage();
    let fraction = job.success_fraction();
    if coverages.is_empty() || fraction < ctx.config.required_success_fraction {
        let msg = format!(
            "{}/{} viewports rendered, required fraction {}",
            coverages.len(),
            job.viewport_profiles.len(),
            ctx.config.required_success_fraction
        );
        return finish_failed(ctx, job, JobError::new(JobErrorKind::InsufficientCoverage, msg));
    }

    let output = match merge::merge(&coverages) {
        Ok(output) => output,
        Err(e) => {
            return finish_failed(ctx, job, JobError::new(JobErrorKind::MergeError, e.to_string()))
        }
    };
    let css_text = output.merged.css_text();
    if css_text.is_empty() {
        // Successful renders that report zero applied CSS mean the capture
        // pipeline is broken, not that the page is unstyled.
        return finish_failed(
            ctx,
            job,
            JobError::new(
                JobErrorKind::MergeError,
                "no applied css rules in any viewport capture".to_string(),
            ),
        );
    }

    let instructions = defer::compose(&output.deferred_stylesheet_ids());
    job.complete(css_text, instructions)?;
    ctx.services.jobs.save(&job)?;
    info!(
        "critical css job {job_id} completed: {} rules from {} stylesheets",
        output.merged.rules.len(),
        output.stylesheets.len()
    );
    let _ = ctx.event_tx.send(EngineEvent::JobCompleted { job_id });
    Ok(())
}

/// Record one viewport's terminal outcome on the job and persist it.
fn record(ctx: &JobContext, job: &mut CssJob, report: ViewportReport) -> anyhow::Result<()> {
    match report.result {
        Ok((coverage, screenshot)) => {
            if let Some(bytes) = screenshot {
                // Artifacts are advisory: a failing store is logged, never
                // escalated.
                match ctx.services.artifacts.put(job.id, &report.viewport, &bytes) {
                    Ok(reference) => job.record_artifact(&report.viewport, reference),
                    Err(e) => warn!(
                        "critical css job {}: artifact store failed for {}: {e}",
                        job.id, report.viewport
                    ),
                }
            }
            job.record_viewport(
                &report.viewport,
                report.attempts,
                ViewportOutcome::Rendered { coverage },
            )?;
        }
        Err(failure) => {
            job.record_viewport(
                &report.viewport,
                report.attempts,
                ViewportOutcome::Failed { failure },
            )?;
        }
    }
    ctx.services.jobs.save(job)?;
    Ok(())
}

fn finish_failed(ctx: &JobContext, mut job: CssJob, error: JobError) -> anyhow::Result<()> {
    warn!("critical css job {} failed: {error}", job.id);
    let kind = error.kind;
    let job_id = job.id;
    job.fail(error)?;
    ctx.services.jobs.save(&job)?;
    let _ = ctx.event_tx.send(EngineEvent::JobFailed { job_id, kind });
    Ok(())
}

struct ViewportTask {
    job_id: JobId,
    target_url: Url,
    profile: ViewportProfile,
    auth_headers: Option<HashMap<String, String>>,
    config: Arc<EngineConfig>,
    services: EngineServices,
    render_slots: Arc<Semaphore>,
    event_tx: broadcast::Sender<EngineEvent>,
}

struct ViewportReport {
    viewport: String,
    attempts: u32,
    result: Result<(ViewportCoverage, Option<Vec<u8>>), RenderFailure>,
}

/// Render one viewport to a terminal per-viewport outcome: success, or
/// failure after the full retry budget. Retries are strictly sequential;
/// there is never more than one in-flight attempt per (job, viewport).
async fn render_viewport(task: ViewportTask) -> ViewportReport {
    let viewport = task.profile.name.clone();
    let max_attempts = task.config.retry.max_attempts.max(1);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match attempt_render(&task).await {
            Ok(raw) => {
                debug!(
                    "critical css job {}: viewport {viewport} rendered on attempt {attempts}",
                    task.job_id
                );
                let screenshot = raw.screenshot.clone();
                let coverage = coverage::normalize(raw, &viewport);
                let _ = task.event_tx.send(EngineEvent::ViewportRendered {
                    job_id: task.job_id,
                    viewport: viewport.clone(),
                });
                return ViewportReport {
                    viewport,
                    attempts,
                    result: Ok((coverage, screenshot)),
                };
            }
            Err(failure) => {
                warn!(
                    "critical css job {}: viewport {viewport} attempt {attempts}/{max_attempts} failed: {failure}",
                    task.job_id
                );
                let _ = task.event_tx.send(EngineEvent::ViewportAttemptFailed {
                    job_id: task.job_id,
                    viewport: viewport.clone(),
                    attempt: attempts,
                    failure: failure.clone(),
                });
                if attempts >= max_attempts {
                    return ViewportReport {
                        viewport,
                        attempts,
                        result: Err(failure),
                    };
                }
                tokio::time::sleep(backoff_with_jitter(&task.config.retry, attempts)).await;
            }
        }
    }
}

/// One render attempt: acquire a pool slot, run the session, release the
/// slot. The permit drops no matter how the attempt ends, including abort.
async fn attempt_render(task: &ViewportTask) -> Result<RawCapture, RenderFailure> {
    let _permit = task
        .render_slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| RenderFailure::PageCrashed("render pool closed".to_string()))?;

    let request = RenderRequest {
        target_url: task.target_url.clone(),
        profile: task.profile.clone(),
        auth_headers: task.auth_headers.clone(),
        user_agent: task.config.user_agent.clone(),
        timeout: task.config.render_timeout,
        quiet_period: task.config.quiet_period,
        scroll_settle: task.config.scroll_settle,
    };

    // Sessions bound themselves by the request timeout; the outer bound
    // with a grace period covers implementations that wedge outright.
    let grace = Duration::from_secs(5);
    match tokio::time::timeout(
        task.config.render_timeout + grace,
        task.services.session.render(request),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(RenderFailure::NavigationTimeout),
    }
}

/// Exponential backoff with ±50% jitter so concurrent retries against the
/// same host do not synchronize.
fn backoff_with_jitter(policy: &RetryPolicy, attempts_made: u32) -> Duration {
    let base = policy.delay_for(attempts_made);
    let micros = base.as_micros() as u64;
    if micros == 0 {
        return base;
    }
    let jittered = rand::rng().random_range(micros / 2..=micros + micros / 2);
    Duration::from_micros(jittered)
}
