// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Executes parsed subcommands against the bridge services and renders JSON results.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::AsyncBufReadExt;

use crate::adapters::cli::{Command, CredArgs, CredCmd, QueueArgs, SyncArgs};
use crate::app::errors::{AppError, AppErrorKind, AppResult};
use crate::app::services::credentials::CredentialStore;
use crate::app::services::file_sync::{FileSyncEngine, SyncOptions, SyncTask};
use crate::app::services::jobs::JobManager;
use crate::app::services::poller::JobPoller;
use crate::app::services::sessions::{RemoteSession, SessionManager};
use crate::app::types::{
    ConnectionState, ExecutionMode, JobHandle, QueueScope, Secret, SecretPurpose, SshConfig,
    SyncFilterRule,
};
use crate::config::Config;

/// The wired service graph one CLI invocation works with.
pub struct Bridge {
    pub config: Config,
    pub credentials: Arc<CredentialStore>,
    pub sessions: Arc<SessionManager>,
    pub jobs: Arc<JobManager>,
    pub sync: FileSyncEngine,
}

impl Bridge {
    fn ssh_config(&self) -> AppResult<SshConfig> {
        self.config
            .ssh_config()
            .map_err(|err| AppError::of(AppErrorKind::InvalidArgument, format!("{err:#}")))
    }

    async fn session(&self) -> AppResult<Arc<RemoteSession>> {
        let config = self.ssh_config()?;
        self.sessions.connect(&config).await
    }

    fn purpose(&self, args: &CredArgs) -> SecretPurpose {
        args.purpose
            .unwrap_or_else(|| self.config.hpc.auth.secret_purpose())
    }
}

pub async fn dispatch(
    bridge: &Bridge,
    command: Command,
    filters: Vec<SyncFilterRule>,
) -> AppResult<Value> {
    match command {
        Command::Connect => {
            let session = bridge.session().await?;
            let state = bridge.sessions.health(&session).await?;
            Ok(json!({
                "session": session.info(),
                "state": state,
                "sessions": bridge.sessions.list().await,
            }))
        }
        Command::Run(args) => {
            let session = bridge.session().await?;
            let mode = if args.interactive {
                ExecutionMode::Interactive
            } else {
                ExecutionMode::Direct
            };
            let timeout = args
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| bridge.config.command_timeout());
            let capture = bridge
                .jobs
                .execute(&session, &args.command.join(" "), mode, timeout)
                .await?;
            Ok(json!({
                "exit_code": capture.exit_code,
                "stdout": capture.stdout_text(),
                "stderr": capture.stderr_text(),
            }))
        }
        Command::Submit(args) => {
            let session = bridge.session().await?;
            let job = bridge
                .jobs
                .submit(&session, &args.command.join(" "), &args.resource_request())
                .await?;
            Ok(json!({ "job": job }))
        }
        Command::Poll(args) => {
            let job = bridge.jobs.poll(&JobHandle::new(args.handle)).await?;
            Ok(json!({ "job": job }))
        }
        Command::Cancel(args) => {
            let job = bridge.jobs.cancel(&JobHandle::new(args.handle)).await?;
            Ok(json!({ "job": job }))
        }
        Command::Jobs => Ok(json!({ "jobs": bridge.jobs.list_known_jobs().await })),
        Command::Queue(args) => queue(bridge, args).await,
        Command::Watch => watch(bridge).await,
        Command::Push(args) => push(bridge, args, filters).await,
        Command::Pull(args) => pull(bridge, args, filters).await,
        Command::Diff(args) => {
            let session = bridge.session().await?;
            let entries = bridge
                .sync
                .diff(&session, &args.local, &args.remote, &filters)
                .await?;
            Ok(json!({ "in_sync": entries.is_empty(), "entries": entries }))
        }
        Command::Cred(cmd) => cred(bridge, cmd).await,
        Command::AcceptHostKey => {
            let config = bridge.ssh_config()?;
            let fingerprint = bridge.sessions.accept_host_key(&config).await?;
            Ok(json!({
                "host": config.host,
                "port": config.port,
                "fingerprint": fingerprint,
            }))
        }
    }
}

async fn queue(bridge: &Bridge, args: QueueArgs) -> AppResult<Value> {
    let scope = match (args.all, args.job) {
        (_, Some(id)) => QueueScope::Job(id),
        (true, None) => QueueScope::All,
        (false, None) => QueueScope::User,
    };
    let session = bridge.session().await?;
    let info = bridge.jobs.queue(&session, &scope, args.waiting).await?;
    Ok(json!({ "queue": info }))
}

async fn watch(bridge: &Bridge) -> AppResult<Value> {
    let poller = JobPoller::spawn(bridge.jobs.clone(), bridge.config.poll_interval());
    tracing::info!("watching jobs; press Ctrl-C to stop");
    let mut states = match bridge.session().await {
        Ok(session) => Some(session.subscribe()),
        Err(err) => {
            tracing::warn!(error = %err, "not connected yet; the poller keeps retrying");
            None
        }
    };
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            result = &mut interrupt => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "cannot listen for Ctrl-C; stopping");
                }
                break;
            }
            changed = next_state(&mut states) => match changed {
                Some(state) => tracing::info!(state = state.as_str(), "connection state"),
                None => states = None,
            },
        }
    }
    poller.stop().await;
    Ok(json!({ "jobs": bridge.jobs.list_known_jobs().await }))
}

/// Next connection state change; pends forever once there is nothing to observe.
async fn next_state(
    states: &mut Option<tokio::sync::watch::Receiver<ConnectionState>>,
) -> Option<ConnectionState> {
    match states {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Drives a sync to completion. The first Ctrl-C cancels the task; the engine then finishes
/// the file in flight and reports where it stopped.
async fn until_cancelled<T>(task: &SyncTask, work: impl Future<Output = AppResult<T>>) -> AppResult<T> {
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => return result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(task = %task.handle(), "interrupt received; finishing current file");
            task.cancel();
        }
    }
    work.await
}

async fn push(bridge: &Bridge, args: SyncArgs, filters: Vec<SyncFilterRule>) -> AppResult<Value> {
    let session = bridge.session().await?;
    let task = SyncTask::new();
    let options = SyncOptions::new(args.policy).with_filters(filters);
    let local = shellexpand::tilde(&args.source).into_owned();
    let report = until_cancelled(
        &task,
        bridge
            .sync
            .push_with(&task, &session, Path::new(&local), &args.destination, &options),
    )
    .await?;
    Ok(json!({ "report": report }))
}

async fn pull(bridge: &Bridge, args: SyncArgs, filters: Vec<SyncFilterRule>) -> AppResult<Value> {
    let session = bridge.session().await?;
    let task = SyncTask::new();
    let options = SyncOptions::new(args.policy).with_filters(filters);
    let local = shellexpand::tilde(&args.destination).into_owned();
    let report = until_cancelled(
        &task,
        bridge
            .sync
            .pull_with(&task, &session, &args.source, Path::new(&local), &options),
    )
    .await?;
    Ok(json!({ "report": report }))
}

async fn read_secret_line() -> AppResult<Secret> {
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|err| {
            AppError::of(
                AppErrorKind::InvalidArgument,
                format!("failed to read secret from stdin: {err}"),
            )
        })?;
    let value = line.trim_end_matches(['\r', '\n']);
    if value.is_empty() {
        return Err(AppError::of(
            AppErrorKind::InvalidArgument,
            "expected the secret on stdin",
        ));
    }
    Ok(Secret::new(value))
}

async fn cred(bridge: &Bridge, cmd: CredCmd) -> AppResult<Value> {
    let config = bridge.ssh_config()?;
    let (host, username) = (config.host.as_str(), config.username.as_str());
    match cmd {
        CredCmd::Set(args) => {
            let purpose = bridge.purpose(&args);
            let secret = read_secret_line().await?;
            bridge
                .credentials
                .store(host, username, purpose, &secret)
                .await?;
            Ok(json!({ "host": host, "username": username, "purpose": purpose, "stored": true }))
        }
        CredCmd::Status(args) => {
            let purpose = bridge.purpose(&args);
            let source = bridge.credentials.status(host, username, purpose).await?;
            Ok(json!({
                "host": host,
                "username": username,
                "purpose": purpose,
                "available": source.is_some(),
                "source": source,
            }))
        }
        CredCmd::Forget(args) => {
            let purpose = bridge.purpose(&args);
            let removed = bridge.credentials.forget(host, username, purpose).await?;
            Ok(json!({ "host": host, "username": username, "purpose": purpose, "removed": removed }))
        }
    }
}

/// Machine-readable rendering of a failed command.
pub fn error_to_json(err: &AppError) -> Value {
    json!({
        "error": {
            "kind": err.kind(),
            "code": err.code(),
            "message": err.message(),
            "context": err.context(),
            "handle": err.handle(),
            "progress": err.sync_progress(),
        }
    })
}
