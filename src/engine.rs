//! Job Orchestrator: the engine task owning job state transitions, plus the
//! handle userland code talks to.
//!
//! The engine runs as a single command loop ([`CriticalCssEngine::run`]);
//! accepted jobs are driven by per-job tasks spawned into its `JoinSet`.
//! Render-session admission is a semaphore sized to the configured pool, so
//! no more browser contexts exist at once than configured, no matter how
//! many jobs are in flight.

pub mod worker;

use std::sync::Arc;

use log::{error, info};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::api::{GenerateAccepted, GenerateRequest, JobStatusResponse};
use crate::config::EngineConfig;
use crate::errors::{EngineError, JobErrorKind, RenderFailure};
use crate::job::{CssJob, JobId, JobStatus};
use crate::session::{RenderSession, TargetProbe};
use crate::store::{ArtifactStore, JobStore};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// External collaborators the engine consumes. All behind narrow traits so
/// the orchestrator is testable with fakes.
#[derive(Clone)]
pub struct EngineServices {
    pub session: Arc<dyn RenderSession>,
    pub probe: Arc<dyn TargetProbe>,
    pub jobs: Arc<dyn JobStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

/// Commands sent from handles to the engine loop.
#[derive(Debug)]
pub enum EngineCommand {
    Submit {
        request: GenerateRequest,
        reply: oneshot::Sender<Result<GenerateAccepted, EngineError>>,
    },
    Status {
        job_id: JobId,
        reply: oneshot::Sender<Result<JobStatusResponse, EngineError>>,
    },
    Stats {
        reply: oneshot::Sender<Result<EngineStats, EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Events broadcast while jobs progress. Subscribe via
/// [`EngineHandle::subscribe_events`].
#[derive(Debug, Clone)]
pub enum EngineEvent {
    EngineStarted,
    JobQueued {
        job_id: JobId,
    },
    JobStarted {
        job_id: JobId,
    },
    ViewportRendered {
        job_id: JobId,
        viewport: String,
    },
    ViewportAttemptFailed {
        job_id: JobId,
        viewport: String,
        attempt: u32,
        failure: RenderFailure,
    },
    JobCompleted {
        job_id: JobId,
    },
    JobFailed {
        job_id: JobId,
        kind: JobErrorKind,
    },
}

/// Point-in-time engine health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Render sessions currently holding a pool slot.
    pub active_render_sessions: usize,
}

pub struct CriticalCssEngine {
    config: Arc<EngineConfig>,
    services: EngineServices,
    /// Command sender (cloned into handles).
    cmd_tx: mpsc::Sender<EngineCommand>,
    /// Command receiver (owned by the engine run loop).
    cmd_rx: mpsc::Receiver<EngineCommand>,
    event_tx: broadcast::Sender<EngineEvent>,
    /// Admission control for the scarce resource: browser sessions.
    render_slots: Arc<Semaphore>,
    /// Bounds concurrently driven jobs, independent of the render pool.
    driver_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    drivers: JoinSet<()>,
}

impl CriticalCssEngine {
    /// Create a new engine. If `config` is `None`, [`EngineConfig::default`]
    /// is used.
    pub fn new(config: Option<EngineConfig>, services: EngineServices) -> Self {
        let config = Arc::new(config.unwrap_or_default());

        let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(DEFAULT_CHANNEL_CAPACITY);
        let (event_tx, _first_rx) = broadcast::channel::<EngineEvent>(DEFAULT_CHANNEL_CAPACITY);

        let render_slots = Arc::new(Semaphore::new(config.max_render_sessions));
        let driver_slots = Arc::new(Semaphore::new(config.orchestration_workers));

        Self {
            config,
            services,
            cmd_tx,
            cmd_rx,
            event_tx,
            render_slots,
            driver_slots,
            shutdown: CancellationToken::new(),
            drivers: JoinSet::new(),
        }
    }

    /// Start the engine loop, returning the handle and the loop's join
    /// handle.
    pub fn start(self) -> (EngineHandle, JoinHandle<()>) {
        let handle = EngineHandle {
            cmd_tx: self.cmd_tx.clone(),
            event_tx: self.event_tx.clone(),
        };
        let join_handle = tokio::spawn(self.run());
        (handle, join_handle)
    }

    /// Run the inbound command loop until shutdown or until all handles are
    /// dropped.
    pub async fn run(mut self) {
        let _ = self.event_tx.send(EngineEvent::EngineStarted);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        EngineCommand::Submit { request, reply } => {
                            let _ = reply.send(self.submit(request));
                        }
                        EngineCommand::Status { job_id, reply } => {
                            let _ = reply.send(self.status(job_id));
                        }
                        EngineCommand::Stats { reply } => {
                            let _ = reply.send(self.stats());
                        }
                        EngineCommand::Shutdown { reply } => {
                            info!("engine shutting down, cancelling in-flight jobs");
                            self.shutdown.cancel();
                            while self.drivers.join_next().await.is_some() {}
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
                // Reap finished job drivers as they complete.
                Some(joined) = self.drivers.join_next(), if !self.drivers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("job driver panicked: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Validate and accept a generation request. Validation failures reject
    /// synchronously; no job record is created for them.
    fn submit(&mut self, request: GenerateRequest) -> Result<GenerateAccepted, EngineError> {
        let valid = request.validate(&self.config)?;

        let names = valid.profiles.iter().map(|p| p.name.clone()).collect();
        let job = CssJob::new(valid.target_url.clone(), valid.template.clone(), names);
        let job_id = job.id;
        self.services.jobs.create(job)?;

        info!("critical css job {job_id} queued for {}", valid.target_url);
        let _ = self.event_tx.send(EngineEvent::JobQueued { job_id });

        let ctx = worker::JobContext {
            config: self.config.clone(),
            services: self.services.clone(),
            render_slots: self.render_slots.clone(),
            driver_slots: self.driver_slots.clone(),
            event_tx: self.event_tx.clone(),
            shutdown: self.shutdown.clone(),
        };
        self.drivers.spawn(worker::drive_job(ctx, job_id, valid));

        Ok(GenerateAccepted {
            job_id,
            status: JobStatus::Queued,
        })
    }

    fn status(&self, job_id: JobId) -> Result<JobStatusResponse, EngineError> {
        let job = self.services.jobs.load(job_id)?;
        Ok(JobStatusResponse::from_job(&job, &self.config))
    }

    fn stats(&self) -> Result<EngineStats, EngineError> {
        let mut stats = EngineStats {
            queued: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            active_render_sessions: self
                .config
                .max_render_sessions
                .saturating_sub(self.render_slots.available_permits()),
        };
        for job in self.services.jobs.list()? {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// Enqueue a generation job. Returns as soon as the job record exists;
    /// the work itself is asynchronous.
    pub async fn submit(&self, request: GenerateRequest) -> Result<GenerateAccepted, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Submit { request, reply: tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Current state of a job, including results when completed.
    pub async fn status(&self, job_id: JobId) -> Result<JobStatusResponse, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Status { job_id, reply: tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Stats { reply: tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    /// Gracefully shut the engine down: in-flight jobs are cancelled and
    /// their records marked failed before this returns.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Shutdown { reply: tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{ByteRange, RawCapture, RawStylesheet};
    use crate::session::{NullProbe, StaticSession};
    use crate::store::{InMemoryArtifactStore, InMemoryJobStore};
    use std::time::Duration;

    fn capture(text: &str, used: ByteRange) -> RawCapture {
        RawCapture {
            stylesheets: vec![RawStylesheet {
                id: "main.css".into(),
                full_text: text.into(),
                raw_ranges: vec![used],
            }],
            above_fold_height_px: 900,
            screenshot: Some(vec![0x89, 0x50]),
        }
    }

    fn services(session: StaticSession) -> EngineServices {
        EngineServices {
            session: Arc::new(session),
            probe: Arc::new(NullProbe),
            jobs: Arc::new(InMemoryJobStore::new()),
            artifacts: Arc::new(InMemoryArtifactStore::new()),
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            render_timeout: Duration::from_millis(500),
            job_deadline: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    async fn wait_terminal(handle: &EngineHandle, job_id: JobId) -> JobStatusResponse {
        for _ in 0..200 {
            let status = handle.status(job_id).await.unwrap();
            if status.status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn submit_and_complete_round_trip() {
        let css = ".hero{min-height:60vh}.cta{color:#fff}";
        let session = StaticSession::new()
            .with_capture("desktop", capture(css, ByteRange::new(0, 22)))
            .with_capture("mobile", capture(css, ByteRange::new(22, 38)));

        let engine = CriticalCssEngine::new(Some(test_config()), services(session));
        let (handle, engine_task) = engine.start();

        let accepted = handle
            .submit(GenerateRequest {
                target_url: "https://shop.example/landing".to_string(),
                template: "landing".to_string(),
                viewport_profiles: vec!["desktop".to_string(), "mobile".to_string()],
                auth_headers: None,
            })
            .await
            .unwrap();
        assert_eq!(accepted.status, JobStatus::Queued);

        let status = wait_terminal(&handle, accepted.job_id).await;
        assert_eq!(status.status, JobStatus::Completed);
        let result = status.result.unwrap();
        assert!(result.critical_css.contains(".hero"));
        assert!(result.critical_css.contains(".cta"));
        assert_eq!(result.viewports["desktop"].width, 1440);
        // The canned screenshot must surface as an artifact reference.
        assert!(!result.artifacts["desktop"].is_empty());

        handle.shutdown().await.unwrap();
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_viewport_rejects_without_creating_a_job() {
        let jobs = Arc::new(InMemoryJobStore::new());
        let mut services = services(StaticSession::new());
        services.jobs = jobs.clone();

        let engine = CriticalCssEngine::new(Some(test_config()), services);
        let (handle, engine_task) = engine.start();

        let err = handle
            .submit(GenerateRequest {
                target_url: "https://shop.example/landing".to_string(),
                template: "landing".to_string(),
                viewport_profiles: vec!["jumbotron".to_string()],
                auth_headers: None,
            })
            .await;
        assert!(matches!(err, Err(EngineError::UnknownViewport(_))));
        assert!(jobs.list().unwrap().is_empty());

        handle.shutdown().await.unwrap();
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn events_trace_the_job_lifecycle() {
        let css = ".a{top:0}";
        let session = StaticSession::new()
            .with_capture("desktop", capture(css, ByteRange::new(0, 9)))
            .with_capture("mobile", capture(css, ByteRange::new(0, 9)));

        let engine = CriticalCssEngine::new(Some(test_config()), services(session));
        let (handle, engine_task) = engine.start();
        let mut events = handle.subscribe_events();

        let accepted = handle
            .submit(GenerateRequest {
                target_url: "https://shop.example/landing".to_string(),
                template: "landing".to_string(),
                viewport_profiles: vec![],
                auth_headers: None,
            })
            .await
            .unwrap();
        wait_terminal(&handle, accepted.job_id).await;

        let mut saw_queued = false;
        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::JobQueued { job_id } if job_id == accepted.job_id => saw_queued = true,
                EngineEvent::JobStarted { job_id } if job_id == accepted.job_id => {
                    saw_started = true
                }
                EngineEvent::JobCompleted { job_id } if job_id == accepted.job_id => {
                    saw_completed = true
                }
                _ => {}
            }
        }
        assert!(saw_queued && saw_started && saw_completed);

        handle.shutdown().await.unwrap();
        engine_task.await.unwrap();
    }

    #[tokio::test]
    async fn stats_count_jobs_by_status() {
        let css = ".a{top:0}";
        let session = StaticSession::new()
            .with_capture("desktop", capture(css, ByteRange::new(0, 9)))
            .with_capture("mobile", capture(css, ByteRange::new(0, 9)));

        let engine = CriticalCssEngine::new(Some(test_config()), services(session));
        let (handle, engine_task) = engine.start();

        let accepted = handle
            .submit(GenerateRequest {
                target_url: "https://shop.example/landing".to_string(),
                template: "landing".to_string(),
                viewport_profiles: vec![],
                auth_headers: None,
            })
            .await
            .unwrap();
        wait_terminal(&handle, accepted.job_id).await;

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active_render_sessions, 0);

        handle.shutdown().await.unwrap();
        engine_task.await.unwrap();
    }
}
