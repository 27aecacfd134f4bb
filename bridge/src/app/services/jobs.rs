// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Job Manager: submission, polling, cancellation, and the shared job registry.
//!
//! The registry is read by the foreground and written by both the foreground and the
//! background poller. Every update builds a complete new [`Job`] and swaps it in under the
//! write lock, so readers never see a half-applied change. Poll results carry the time the
//! poll started; a result older than the job's last applied poll is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::app::errors::{AppError, AppErrorKind, AppResult};
use crate::app::ports::{ClockPort, JobStorePort};
use crate::app::services::random::generate_handle;
use crate::app::services::scheduler::{Observation, Scheduler};
use crate::app::services::sessions::{RemoteSession, SessionManager};
use crate::app::types::{
    ExecCapture, ExecutionMode, Job, JobError, JobHandle, JobState, QueueInfo, QueueScope,
    ResourceRequest, SessionKey,
};

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub submit_timeout: Duration,
    pub poll_timeout: Duration,
    /// Consecutive failed polls tolerated; the next failure reports the job Unknown.
    pub unknown_after_failures: u32,
    /// Consecutive failed polls after which the background poller stops asking.
    pub give_up_after_failures: u32,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(60),
            unknown_after_failures: 3,
            give_up_after_failures: 100,
        }
    }
}

/// Result of asking the scheduler about one job.
type PollOutcome = AppResult<Option<Observation>>;

pub struct JobManager {
    sessions: Arc<SessionManager>,
    store: Arc<dyn JobStorePort>,
    clock: Arc<dyn ClockPort>,
    scheduler: Scheduler,
    settings: JobSettings,
    registry: RwLock<HashMap<JobHandle, Job>>,
}

impl JobManager {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<dyn JobStorePort>,
        clock: Arc<dyn ClockPort>,
        scheduler: Scheduler,
        settings: JobSettings,
    ) -> Self {
        Self {
            sessions,
            store,
            clock,
            scheduler,
            settings,
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Reloads the persisted registry. Jobs that were still being submitted when the process
    /// stopped have an unknowable outcome and become Unknown; jobs with a remote id are
    /// reconciled by the next poll.
    pub async fn restore(&self) -> AppResult<usize> {
        let jobs = self.store.list_jobs().await?;
        let mut registry = self.registry.write().await;
        let count = jobs.len();
        for mut job in jobs {
            if job.remote_id.is_none()
                && matches!(job.state, JobState::Pending | JobState::Submitting)
            {
                tracing::warn!(
                    handle = %job.handle,
                    "submission was interrupted by a restart; outcome unknown"
                );
                job.state = JobState::Unknown;
                job.error = Some(JobError {
                    kind: AppErrorKind::TransportError,
                    message: "submission interrupted before a job id was recorded".into(),
                });
                self.persist(&job).await;
            }
            registry.insert(job.handle.clone(), job);
        }
        tracing::info!(jobs = count, "job registry restored");
        Ok(count)
    }

    pub async fn get(&self, handle: &JobHandle) -> Option<Job> {
        self.registry.read().await.get(handle).cloned()
    }

    /// All known jobs, oldest submission first.
    pub async fn list_known_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.registry.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.handle.cmp(&b.handle))
        });
        jobs
    }

    /// Submits `command` through the scheduler. The submit command is never retried: a lost
    /// reply could mean the job exists remotely.
    #[tracing::instrument(
        name = "job",
        level = "debug",
        skip(self, session, command, resources),
        fields(op = "submit", host = %session.config().host)
    )]
    pub async fn submit(
        &self,
        session: &RemoteSession,
        command: &str,
        resources: &ResourceRequest,
    ) -> AppResult<Job> {
        let workdir = session.workdir().filter(|dir| dir != "~");
        let submit_cmd = self
            .scheduler
            .submit_command(command, resources, workdir.as_deref())?;

        let handle = JobHandle::new(generate_handle("job"));
        let mut job = Job::new(
            handle.clone(),
            session.key(),
            command,
            resources.clone(),
            self.clock.now_utc(),
        );
        // Nothing has been sent yet, so a store failure can still abort cleanly.
        self.store
            .upsert_job(&job)
            .await
            .map_err(|err| err.with_handle(handle.as_str()))?;
        self.registry
            .write()
            .await
            .insert(handle.clone(), job.clone());

        job.state = JobState::Submitting;
        self.commit(job.clone()).await;

        let mut lease = match self.sessions.lease(session).await {
            Ok(lease) => lease,
            Err(err) => {
                // The command never left this process.
                job.fail_with(JobState::Failed, &err);
                self.commit(job).await;
                return Err(err.with_handle(handle.as_str()));
            }
        };
        let result = lease.exec(&submit_cmd, self.settings.submit_timeout).await;
        drop(lease);

        let capture = match result {
            Ok(capture) => capture,
            Err(err) => {
                let state = match err.kind() {
                    AppErrorKind::TransportError | AppErrorKind::CommandTimeout => {
                        JobState::Unknown
                    }
                    _ => JobState::Failed,
                };
                tracing::warn!(handle = %handle, error = %err, state = state.as_str(), "submission failed");
                job.fail_with(state, &err);
                self.commit(job).await;
                return Err(err.with_handle(handle.as_str()));
            }
        };

        if !capture.success() {
            let stderr = capture.stderr_text();
            let err = AppError::of(
                AppErrorKind::SchedulerRejected,
                format!(
                    "{} rejected the submission (exit {})",
                    self.scheduler, capture.exit_code
                ),
            )
            .with_context(stderr.trim().to_string())
            .with_handle(handle.as_str());
            job.fail_with(JobState::Failed, &err);
            self.commit(job).await;
            return Err(err);
        }

        let stdout = capture.stdout_text();
        let Some(remote_id) = self.scheduler.parse_submit_output(&stdout) else {
            let err = AppError::of(
                AppErrorKind::SubmissionParseError,
                format!("no job id found in {} output", self.scheduler),
            )
            .with_context(stdout.trim().to_string())
            .with_handle(handle.as_str());
            job.fail_with(JobState::Failed, &err);
            self.commit(job).await;
            return Err(err);
        };

        job.assign_remote_id(remote_id.clone())?;
        job.state = JobState::Queued;
        self.commit(job.clone()).await;
        tracing::info!(handle = %handle, remote_id = %remote_id, "job submitted");
        Ok(job)
    }

    /// Refreshes one job from the scheduler. Terminal jobs are returned as they are.
    pub async fn poll(&self, handle: &JobHandle) -> AppResult<Job> {
        let job = self.require(handle).await?;
        if job.is_terminal() {
            return Ok(job);
        }
        let Some(remote_id) = job.remote_id.clone() else {
            return Ok(job);
        };

        let started_at = self.clock.now_utc();
        let outcome = match self.sessions.session_for(&job.session).await {
            Ok(session) => self.observe_one(&session, &remote_id).await,
            Err(err) => Err(err),
        };
        let failure = outcome.as_ref().err().cloned();
        let updated = self.apply_poll(handle, started_at, outcome).await?;
        match failure {
            Some(err) => Err(err.with_handle(handle.as_str())),
            None => Ok(updated),
        }
    }

    /// One poll cycle over every job still worth asking about, one status query per session.
    pub async fn poll_all(&self) -> Vec<Job> {
        let mut groups: BTreeMap<SessionKey, Vec<(JobHandle, String)>> = BTreeMap::new();
        for job in self.registry.read().await.values() {
            if job.is_terminal() || job.poll_failures >= self.settings.give_up_after_failures {
                continue;
            }
            if let Some(remote_id) = &job.remote_id {
                groups
                    .entry(job.session.clone())
                    .or_default()
                    .push((job.handle.clone(), remote_id.clone()));
            }
        }

        let mut updated = Vec::new();
        for (key, jobs) in groups {
            let started_at = self.clock.now_utc();
            let outcomes = match self.sessions.session_for(&key).await {
                Ok(session) => self.observe_group(&session, &jobs).await,
                Err(err) => {
                    tracing::warn!(session = %key, error = %err, "cannot reach session for polling");
                    jobs.iter().map(|_| Err(err.clone())).collect()
                }
            };
            for ((handle, _), outcome) in jobs.iter().zip(outcomes) {
                match self.apply_poll(handle, started_at, outcome).await {
                    Ok(job) => updated.push(job),
                    Err(err) => tracing::warn!(handle = %handle, error = %err, "poll not applied"),
                }
            }
        }
        updated
    }

    /// Cancels a job. Terminal jobs are returned unchanged without contacting the cluster.
    /// The job is marked Cancelled only once the cancel command itself succeeded.
    pub async fn cancel(&self, handle: &JobHandle) -> AppResult<Job> {
        let job = self.require(handle).await?;
        if job.is_terminal() {
            tracing::debug!(handle = %handle, state = job.state.as_str(), "cancel on terminal job is a no-op");
            return Ok(job);
        }
        let Some(remote_id) = job.remote_id.clone() else {
            return Err(AppError::of(
                AppErrorKind::InvalidArgument,
                format!("job has no scheduler id (state {})", job.state.as_str()),
            )
            .with_handle(handle.as_str()));
        };

        let session = self
            .sessions
            .session_for(&job.session)
            .await
            .map_err(|err| err.with_handle(handle.as_str()))?;
        let capture = self
            .sessions
            .run(
                &session,
                &self.scheduler.cancel_command(&remote_id),
                self.settings.poll_timeout,
            )
            .await
            .map_err(|err| err.with_handle(handle.as_str()))?;
        if !capture.success() {
            return Err(AppError::of(
                AppErrorKind::SchedulerRejected,
                format!("cancel of job {remote_id} was refused"),
            )
            .with_context(capture.stderr_text().trim().to_string())
            .with_handle(handle.as_str()));
        }

        let mut registry = self.registry.write().await;
        let current = registry
            .get(handle)
            .cloned()
            .ok_or_else(|| not_found(handle))?;
        if current.is_terminal() {
            return Ok(current);
        }
        let mut next = current;
        next.state = JobState::Cancelled;
        self.persist(&next).await;
        registry.insert(handle.clone(), next.clone());
        tracing::info!(handle = %handle, remote_id = %remote_id, "job cancelled");
        Ok(next)
    }

    /// Lists the scheduler queue as seen from `session`.
    pub async fn queue(
        &self,
        session: &RemoteSession,
        scope: &QueueScope,
        waiting_summary: bool,
    ) -> AppResult<QueueInfo> {
        let command = self.scheduler.queue_command(scope)?;
        let capture = self
            .sessions
            .run_idempotent(session, &command, self.settings.poll_timeout)
            .await?;
        if !capture.success() {
            return Err(AppError::of(
                AppErrorKind::SchedulerRejected,
                "queue listing failed",
            )
            .with_context(capture.stderr_text().trim().to_string()));
        }
        self.scheduler
            .parse_queue(&capture.stdout_text(), waiting_summary)
    }

    /// Runs a command on the cluster, on the login node or through the scheduler's
    /// interactive launcher.
    pub async fn execute(
        &self,
        session: &RemoteSession,
        command: &str,
        mode: ExecutionMode,
        timeout: Duration,
    ) -> AppResult<ExecCapture> {
        let command = match mode {
            ExecutionMode::Direct => command.to_string(),
            ExecutionMode::Interactive => self.scheduler.interactive_command(command)?,
        };
        self.sessions.run(session, &command, timeout).await
    }

    async fn observe_one(&self, session: &RemoteSession, remote_id: &str) -> PollOutcome {
        let ids = [remote_id];
        let capture = self
            .sessions
            .run_idempotent(
                session,
                &self.scheduler.status_command(&ids),
                self.settings.poll_timeout,
            )
            .await?;
        let mut observed = self.scheduler.parse_status(&capture, &ids)?;
        match observed.remove(remote_id) {
            Some(observation) => self.settle(session, remote_id, observation).await,
            None => self.reconcile_missing(session, remote_id).await,
        }
    }

    async fn observe_group(
        &self,
        session: &RemoteSession,
        jobs: &[(JobHandle, String)],
    ) -> Vec<PollOutcome> {
        if !self.scheduler.supports_batch_status() {
            let mut outcomes = Vec::with_capacity(jobs.len());
            for (_, remote_id) in jobs {
                outcomes.push(self.observe_one(session, remote_id).await);
            }
            return outcomes;
        }

        let ids: Vec<&str> = jobs.iter().map(|(_, id)| id.as_str()).collect();
        let batch = self
            .sessions
            .run_idempotent(
                session,
                &self.scheduler.status_command(&ids),
                self.settings.poll_timeout,
            )
            .await
            .and_then(|capture| self.scheduler.parse_status(&capture, &ids));
        let mut observed = match batch {
            Ok(observed) => observed,
            Err(err) => return jobs.iter().map(|_| Err(err.clone())).collect(),
        };

        let mut outcomes = Vec::with_capacity(jobs.len());
        for (_, remote_id) in jobs {
            let outcome = match observed.remove(remote_id.as_str()) {
                Some(observation) => self.settle(session, remote_id, observation).await,
                None => self.reconcile_missing(session, remote_id).await,
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// The live queue can still list a finished job for a while, without its exit code.
    /// Such rows get the terminal lookup too; if accounting has no record the row stands.
    async fn settle(
        &self,
        session: &RemoteSession,
        remote_id: &str,
        observation: Observation,
    ) -> PollOutcome {
        if !observation.state.is_terminal() || observation.exit_code.is_some() {
            return Ok(Some(observation));
        }
        match self.reconcile_missing(session, remote_id).await? {
            Some(terminal) if terminal.state.is_terminal() => Ok(Some(terminal)),
            _ => Ok(Some(observation)),
        }
    }

    /// A job the status query no longer lists gets one terminal lookup.
    async fn reconcile_missing(&self, session: &RemoteSession, remote_id: &str) -> PollOutcome {
        let capture = self
            .sessions
            .run_idempotent(
                session,
                &self.scheduler.terminal_query_command(remote_id),
                self.settings.poll_timeout,
            )
            .await?;
        Ok(self.scheduler.parse_terminal(&capture))
    }

    pub(crate) async fn apply_poll(
        &self,
        handle: &JobHandle,
        started_at: OffsetDateTime,
        outcome: PollOutcome,
    ) -> AppResult<Job> {
        let mut registry = self.registry.write().await;
        let current = registry
            .get(handle)
            .cloned()
            .ok_or_else(|| not_found(handle))?;
        if current.is_terminal() {
            return Ok(current);
        }
        if current.last_poll_at.is_some_and(|last| last > started_at) {
            tracing::debug!(handle = %handle, "discarding stale poll result");
            return Ok(current);
        }

        let mut next = current.clone();
        next.last_poll_at = Some(started_at);
        match outcome {
            Ok(Some(observation)) => {
                next.poll_failures = 0;
                next.state = observation.state;
                next.scheduler_state = Some(observation.raw);
                if observation.exit_code.is_some() {
                    next.exit_code = observation.exit_code;
                }
                next.error = None;
            }
            Ok(None) => {
                next.poll_failures = next.poll_failures.saturating_add(1);
                next.state = JobState::Unknown;
                next.error = Some(JobError {
                    kind: AppErrorKind::NotFound,
                    message: "scheduler has no record of the job".into(),
                });
            }
            Err(err) => {
                next.poll_failures = next.poll_failures.saturating_add(1);
                if next.poll_failures > self.settings.unknown_after_failures {
                    next.state = JobState::Unknown;
                    next.error = Some(JobError {
                        kind: err.kind(),
                        message: err.message().to_string(),
                    });
                }
                tracing::debug!(
                    handle = %handle,
                    failures = next.poll_failures,
                    error = %err,
                    "poll failed"
                );
            }
        }

        if next.state != current.state {
            tracing::info!(
                handle = %handle,
                from = current.state.as_str(),
                to = next.state.as_str(),
                "job state changed"
            );
        }
        self.persist(&next).await;
        registry.insert(handle.clone(), next.clone());
        Ok(next)
    }

    async fn commit(&self, job: Job) {
        let mut registry = self.registry.write().await;
        self.persist(&job).await;
        registry.insert(job.handle.clone(), job);
    }

    /// The in-memory registry stays authoritative when the store write fails; the next
    /// update writes the full record again.
    async fn persist(&self, job: &Job) {
        if let Err(err) = self.store.upsert_job(job).await {
            tracing::error!(handle = %job.handle, error = %err, "failed to persist job");
        }
    }

    async fn require(&self, handle: &JobHandle) -> AppResult<Job> {
        self.get(handle).await.ok_or_else(|| not_found(handle))
    }
}

fn not_found(handle: &JobHandle) -> AppError {
    AppError::of(AppErrorKind::NotFound, "unknown job handle").with_handle(handle.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::services::credentials::tests::MemorySecretStore;
    use crate::app::services::credentials::{
        CredentialStore, DEFAULT_CREDENTIAL_SYSTEM, EnvResolver,
    };
    use crate::app::services::testing::{
        FakeClock, FakeConnector, FakeRemote, MemoryJobStore, Reply, ssh_config,
    };
    use time::macros::datetime;

    struct Harness {
        remote: Arc<FakeRemote>,
        store: Arc<MemoryJobStore>,
        clock: Arc<FakeClock>,
        jobs: JobManager,
        session: Arc<RemoteSession>,
    }

    async fn harness_with(store: MemoryJobStore, settings: JobSettings) -> Harness {
        let remote = FakeRemote::new();
        let connector = Arc::new(FakeConnector::new(remote.clone()));
        let credentials = Arc::new(CredentialStore::with_env(
            Arc::new(MemorySecretStore::default()),
            DEFAULT_CREDENTIAL_SYSTEM,
            EnvResolver::with_lookup(|_| None),
        ));
        let sessions = Arc::new(SessionManager::new(connector, credentials));
        let session = sessions
            .connect(&ssh_config("hpc.example.org", "alice"))
            .await
            .unwrap();
        let store = Arc::new(store);
        let clock = Arc::new(FakeClock::at(datetime!(2026-03-01 10:00 UTC)));
        let jobs = JobManager::new(
            sessions,
            store.clone(),
            clock.clone(),
            Scheduler::Slurm,
            settings,
        );
        Harness {
            remote,
            store,
            clock,
            jobs,
            session,
        }
    }

    async fn harness() -> Harness {
        harness_with(MemoryJobStore::default(), JobSettings::default()).await
    }

    fn slurm(squeue: &'static str, sacct: &'static str) -> impl Fn(&str) -> Reply {
        move |cmd: &str| {
            if cmd.starts_with("sbatch") {
                Reply::ok("Submitted batch job 4242\n")
            } else if cmd.starts_with("squeue") {
                Reply::ok(squeue)
            } else if cmd.starts_with("sacct") {
                Reply::ok(sacct)
            } else if cmd.starts_with("scancel") {
                Reply::ok("")
            } else {
                Reply::exit(127, "", "command not found")
            }
        }
    }

    async fn submitted(h: &Harness) -> Job {
        h.remote.set_handler(slurm("4242|PENDING\n", ""));
        h.jobs
            .submit(&h.session, "echo hi", &ResourceRequest::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submit_records_remote_id_and_queues() {
        let h = harness().await;
        let job = submitted(&h).await;

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.remote_id.as_deref(), Some("4242"));
        assert!(job.handle.as_str().starts_with("job-"));
        assert_eq!(h.store.stored(&job.handle).unwrap().state, JobState::Queued);
        let sent = h.remote.user_commands();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("sbatch --chdir='/home/alice'"));
        assert!(sent[0].ends_with("--wrap='echo hi'"));
    }

    #[tokio::test]
    async fn unparsed_submit_output_fails_the_job() {
        let h = harness().await;
        h.remote.set_handler(|_| Reply::ok("Job accepted, have a nice day\n"));

        let err = h
            .jobs
            .submit(&h.session, "echo hi", &ResourceRequest::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::SubmissionParseError);
        let handle = JobHandle::new(err.handle().unwrap());
        let job = h.jobs.get(&handle).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(
            job.error.as_ref().map(|e| e.kind),
            Some(AppErrorKind::SubmissionParseError)
        );
        assert!(job.remote_id.is_none());
    }

    #[tokio::test]
    async fn scheduler_refusal_is_reported_with_stderr() {
        let h = harness().await;
        h.remote.set_handler(|_| {
            Reply::exit(1, "", "sbatch: error: invalid partition specified: nope\n")
        });
        let mut resources = ResourceRequest::new();
        resources.insert("partition".into(), "nope".into());

        let err = h
            .jobs
            .submit(&h.session, "echo hi", &resources)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::SchedulerRejected);
        assert!(err.context().unwrap().contains("invalid partition"));
        let jobs = h.jobs.list_known_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Failed);
    }

    #[tokio::test]
    async fn transport_error_during_submit_is_not_retried() {
        let h = harness().await;
        h.remote.set_handler(|cmd| {
            if cmd.starts_with("sbatch") {
                Reply::Transport
            } else {
                Reply::ok("")
            }
        });

        let err = h
            .jobs
            .submit(&h.session, "echo hi", &ResourceRequest::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::TransportError);
        assert!(err.handle().is_some());
        let sbatch_calls = h
            .remote
            .user_commands()
            .iter()
            .filter(|c| c.starts_with("sbatch"))
            .count();
        assert_eq!(sbatch_calls, 1);
        let jobs = h.jobs.list_known_jobs().await;
        assert_eq!(jobs[0].state, JobState::Unknown);
    }

    #[tokio::test]
    async fn invalid_resources_create_no_job() {
        let h = harness().await;
        let mut resources = ResourceRequest::new();
        resources.insert("nodes".into(), "zero".into());

        let err = h
            .jobs
            .submit(&h.session, "echo hi", &resources)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::InvalidArgument);
        assert!(h.jobs.list_known_jobs().await.is_empty());
        assert!(h.remote.user_commands().is_empty());
    }

    #[tokio::test]
    async fn poll_walks_job_to_completion_and_stops() {
        let h = harness().await;
        let job = submitted(&h).await;

        h.remote.set_handler(slurm("4242|RUNNING\n", ""));
        let running = h.jobs.poll(&job.handle).await.unwrap();
        assert_eq!(running.state, JobState::Running);
        assert_eq!(running.scheduler_state.as_deref(), Some("RUNNING"));

        h.clock.advance(time::Duration::seconds(30));
        h.remote.set_handler(slurm("", "COMPLETED|0:0\n"));
        let done = h.jobs.poll(&job.handle).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.remote_id.as_deref(), Some("4242"));

        let before = h.remote.user_commands().len();
        let again = h.jobs.poll(&job.handle).await.unwrap();
        assert_eq!(again, done);
        assert_eq!(h.remote.user_commands().len(), before);
    }

    #[tokio::test]
    async fn finished_row_still_in_queue_gets_exit_code_from_accounting() {
        let h = harness().await;
        let job = submitted(&h).await;

        h.remote.set_handler(slurm("4242|FAILED\n", "FAILED|2:0\n"));
        let failed = h.jobs.poll(&job.handle).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.exit_code, Some(2));
        assert_eq!(h.store.stored(&job.handle).unwrap().exit_code, Some(2));
        assert!(
            h.remote
                .user_commands()
                .iter()
                .any(|c| c.starts_with("sacct -j 4242"))
        );
    }

    #[tokio::test]
    async fn finished_row_keeps_its_state_when_accounting_is_silent() {
        let h = harness().await;
        let job = submitted(&h).await;

        h.remote.set_handler(slurm("4242|COMPLETED\n", ""));
        let done = h.jobs.poll(&job.handle).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.exit_code, None);
        assert_eq!(done.scheduler_state.as_deref(), Some("COMPLETED"));
    }

    #[tokio::test]
    async fn batch_poll_settles_finished_rows_through_accounting() {
        let h = harness().await;
        let job = submitted(&h).await;

        h.remote.set_handler(slurm("4242|COMPLETED\n", "COMPLETED|0:0\n"));
        let updated = h.jobs.poll_all().await;
        assert_eq!(updated.len(), 1);
        let done = h.jobs.get(&job.handle).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.exit_code, Some(0));
    }

    #[tokio::test]
    async fn job_absent_everywhere_becomes_unknown() {
        let h = harness().await;
        let job = submitted(&h).await;

        h.remote.set_handler(slurm("", ""));
        let polled = h.jobs.poll(&job.handle).await.unwrap();
        assert_eq!(polled.state, JobState::Unknown);
        assert_eq!(polled.remote_id.as_deref(), Some("4242"));
    }

    #[tokio::test]
    async fn transport_blip_during_poll_reconnects_once_and_keeps_state() {
        let h = harness().await;
        let job = submitted(&h).await;
        h.remote.set_handler(slurm("4242|RUNNING\n", ""));
        h.jobs.poll(&job.handle).await.unwrap();

        h.remote.fail_next_execs(1);
        let polled = h.jobs.poll(&job.handle).await.unwrap();
        assert_eq!(polled.state, JobState::Running);
        assert_eq!(polled.poll_failures, 0);
        assert_eq!(h.session.reconnect_count(), 1);
    }

    #[tokio::test]
    async fn poll_failures_turn_unknown_only_past_the_threshold() {
        let h = harness().await;
        let job = submitted(&h).await;
        h.remote.set_handler(|cmd| {
            if cmd.starts_with("squeue") {
                Reply::exit(1, "", "squeue: error: Unable to contact slurm controller\n")
            } else {
                Reply::ok("")
            }
        });

        let threshold = JobSettings::default().unknown_after_failures;
        for attempt in 1..=threshold {
            let err = h.jobs.poll(&job.handle).await.unwrap_err();
            assert_eq!(err.kind(), AppErrorKind::SchedulerRejected);
            let current = h.jobs.get(&job.handle).await.unwrap();
            assert_eq!(current.state, JobState::Queued, "attempt {attempt}");
            assert_eq!(current.poll_failures, attempt);
        }
        h.jobs.poll(&job.handle).await.unwrap_err();
        let current = h.jobs.get(&job.handle).await.unwrap();
        assert_eq!(current.poll_failures, threshold + 1);
        assert_eq!(current.state, JobState::Unknown);
        assert_eq!(
            current.error.as_ref().map(|e| e.kind),
            Some(AppErrorKind::SchedulerRejected)
        );
    }

    #[tokio::test]
    async fn out_of_order_poll_results_keep_the_latest() {
        let h = harness().await;
        let job = submitted(&h).await;
        let early = datetime!(2026-03-01 10:01 UTC);
        let late = datetime!(2026-03-01 10:02 UTC);
        let observed = |state: JobState, raw: &str| {
            Ok(Some(Observation {
                state,
                raw: raw.to_string(),
                exit_code: None,
            }))
        };

        h.jobs
            .apply_poll(&job.handle, late, observed(JobState::Running, "RUNNING"))
            .await
            .unwrap();
        let after = h
            .jobs
            .apply_poll(&job.handle, early, observed(JobState::Queued, "PENDING"))
            .await
            .unwrap();

        assert_eq!(after.state, JobState::Running);
        assert_eq!(after.last_poll_at, Some(late));
    }

    #[tokio::test]
    async fn concurrent_polls_agree() {
        let h = harness().await;
        let job = submitted(&h).await;
        h.remote.set_handler(slurm("4242|RUNNING\n", ""));

        let (a, b) = tokio::join!(h.jobs.poll(&job.handle), h.jobs.poll(&job.handle));
        assert_eq!(a.unwrap().state, JobState::Running);
        assert_eq!(b.unwrap().state, JobState::Running);
        assert_eq!(
            h.jobs.get(&job.handle).await.unwrap().state,
            JobState::Running
        );
    }

    #[tokio::test]
    async fn poll_all_batches_one_query_per_session() {
        let h = harness().await;
        let first = submitted(&h).await;
        h.remote.set_handler(|cmd| {
            if cmd.starts_with("sbatch") {
                Reply::ok("Submitted batch job 4243\n")
            } else {
                Reply::ok("")
            }
        });
        let second = h
            .jobs
            .submit(&h.session, "echo two", &ResourceRequest::new())
            .await
            .unwrap();

        h.remote.set_handler(slurm("4242|RUNNING\n4243|PENDING\n", ""));
        let before = h.remote.user_commands().len();
        let updated = h.jobs.poll_all().await;

        assert_eq!(updated.len(), 2);
        let sent = &h.remote.user_commands()[before..];
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("-j 4242,4243") || sent[0].contains("-j 4243,4242"));
        assert_eq!(
            h.jobs.get(&first.handle).await.unwrap().state,
            JobState::Running
        );
        assert_eq!(
            h.jobs.get(&second.handle).await.unwrap().state,
            JobState::Queued
        );
    }

    #[tokio::test]
    async fn poller_skips_jobs_past_give_up_threshold() {
        let settings = JobSettings {
            give_up_after_failures: 2,
            unknown_after_failures: 1,
            ..JobSettings::default()
        };
        let h = harness_with(MemoryJobStore::default(), settings).await;
        let job = submitted(&h).await;
        h.remote.set_handler(|_| Reply::exit(1, "", "controller down"));
        let _ = h.jobs.poll(&job.handle).await;
        let _ = h.jobs.poll(&job.handle).await;
        assert_eq!(h.jobs.get(&job.handle).await.unwrap().poll_failures, 2);

        let before = h.remote.user_commands().len();
        assert!(h.jobs.poll_all().await.is_empty());
        assert_eq!(h.remote.user_commands().len(), before);

        h.remote.set_handler(slurm("4242|RUNNING\n", ""));
        let revived = h.jobs.poll(&job.handle).await.unwrap();
        assert_eq!(revived.state, JobState::Running);
        assert_eq!(revived.poll_failures, 0);
    }

    #[tokio::test]
    async fn cancel_terminal_job_is_a_no_op() {
        let h = harness().await;
        let job = submitted(&h).await;
        h.remote.set_handler(slurm("", "COMPLETED|0:0\n"));
        h.jobs.poll(&job.handle).await.unwrap();

        let before = h.remote.user_commands().len();
        let result = h.jobs.cancel(&job.handle).await.unwrap();
        assert_eq!(result.state, JobState::Completed);
        assert_eq!(h.remote.user_commands().len(), before);
    }

    #[tokio::test]
    async fn cancel_marks_cancelled_after_command_succeeds() {
        let h = harness().await;
        let job = submitted(&h).await;

        let cancelled = h.jobs.cancel(&job.handle).await.unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert!(h.remote.user_commands().contains(&"scancel 4242".to_string()));
        assert_eq!(
            h.store.stored(&job.handle).unwrap().state,
            JobState::Cancelled
        );
    }

    #[tokio::test]
    async fn failed_cancel_leaves_state_unchanged() {
        let h = harness().await;
        let job = submitted(&h).await;
        h.remote.set_handler(|cmd| {
            if cmd.starts_with("scancel") {
                Reply::exit(1, "", "scancel: error: Access/permission denied\n")
            } else {
                Reply::ok("")
            }
        });

        let err = h.jobs.cancel(&job.handle).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::SchedulerRejected);
        assert_eq!(err.handle(), Some(job.handle.as_str()));
        assert_eq!(
            h.jobs.get(&job.handle).await.unwrap().state,
            JobState::Queued
        );
    }

    #[tokio::test]
    async fn cancel_without_remote_id_is_invalid() {
        let stuck = Job::new(
            JobHandle::new("job-stuck"),
            SessionKey::new("hpc.example.org", "alice"),
            "echo",
            ResourceRequest::new(),
            datetime!(2026-03-01 09:00 UTC),
        );
        let h = harness_with(
            MemoryJobStore::with_jobs(vec![stuck.clone()]),
            JobSettings::default(),
        )
        .await;
        h.jobs.restore().await.unwrap();

        let err = h.jobs.cancel(&stuck.handle).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn restore_marks_interrupted_submissions_unknown() {
        let mut interrupted = Job::new(
            JobHandle::new("job-a"),
            SessionKey::new("hpc.example.org", "alice"),
            "echo a",
            ResourceRequest::new(),
            datetime!(2026-03-01 09:00 UTC),
        );
        interrupted.state = JobState::Submitting;
        let mut queued = Job::new(
            JobHandle::new("job-b"),
            SessionKey::new("hpc.example.org", "alice"),
            "echo b",
            ResourceRequest::new(),
            datetime!(2026-03-01 09:05 UTC),
        );
        queued.assign_remote_id("77").unwrap();
        queued.state = JobState::Queued;

        let h = harness_with(
            MemoryJobStore::with_jobs(vec![interrupted.clone(), queued.clone()]),
            JobSettings::default(),
        )
        .await;
        assert_eq!(h.jobs.restore().await.unwrap(), 2);

        let jobs = h.jobs.list_known_jobs().await;
        assert_eq!(jobs[0].handle, interrupted.handle);
        assert_eq!(jobs[0].state, JobState::Unknown);
        assert_eq!(jobs[1].state, JobState::Queued);
        assert_eq!(
            h.store.stored(&interrupted.handle).unwrap().state,
            JobState::Unknown
        );

        h.remote.set_handler(slurm("77|RUNNING\n", ""));
        let reconciled = h.jobs.poll(&queued.handle).await.unwrap();
        assert_eq!(reconciled.state, JobState::Running);
    }

    #[tokio::test]
    async fn queue_listing_reports_waiting_summary() {
        let h = harness().await;
        h.remote.set_handler(|_| {
            Reply::ok(
                "9|short|a|alice|PENDING|0:00|1|(Priority)|2026-03-01T10:00:00\n\
                 NOW|2026-03-01T10:05:00\n",
            )
        });
        let info = h
            .jobs
            .queue(&h.session, &QueueScope::User, true)
            .await
            .unwrap();
        assert_eq!(info.entries.len(), 1);
        assert_eq!(info.waiting.unwrap().max_wait_secs, Some(300));
    }

    #[tokio::test]
    async fn interactive_execution_goes_through_srun() {
        let h = harness().await;
        h.jobs
            .execute(
                &h.session,
                "hostname",
                ExecutionMode::Interactive,
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(
            h.remote.user_commands().last().map(String::as_str),
            Some("srun --pty sh -c 'hostname'")
        );
    }
}
