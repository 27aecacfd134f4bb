// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Process-scoped registry of remote sessions, keyed by (host, username).
//!
//! A [`RemoteSession`] owns at most one live transport. Every command or file operation takes
//! the session's transport lock through a [`TransportLease`], so operations on one session
//! queue instead of interleaving. A transport failure marks the session `Failed`; the next lease
//! makes exactly one reconnect attempt with the stored configuration before giving up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, RwLock, watch};

use crate::app::errors::{AppError, AppErrorKind, AppResult};
use crate::app::ports::transport::{RemoteReader, RemoteWriter};
use crate::app::ports::{RemoteTransport, TransportConnector};
use crate::app::services::credentials::CredentialStore;
use crate::app::services::random::random_suffix;
use crate::app::services::shell::{join_remote, sh_escape};
use crate::app::types::{
    AuthMode, ConnectionState, EntryMeta, ExecCapture, RemoteDirEntry, SessionInfo, SessionKey,
    SshConfig,
};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

struct Live {
    transport: Box<dyn RemoteTransport>,
    workdir: String,
}

#[derive(Default)]
struct Slot {
    live: Option<Live>,
    /// Host-key and authentication failures need operator action; no automatic reconnect.
    blocked: Option<AppError>,
    disconnected: bool,
}

pub struct RemoteSession {
    id: String,
    config: SshConfig,
    state_tx: watch::Sender<ConnectionState>,
    slot: Mutex<Slot>,
    workdir: StdMutex<Option<String>>,
    connected_once: AtomicBool,
    reconnects: AtomicU32,
}

impl RemoteSession {
    fn new(config: SshConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            id: format!("session-{}", random_suffix()),
            config,
            state_tx,
            slot: Mutex::new(Slot::default()),
            workdir: StdMutex::new(None),
            connected_once: AtomicBool::new(false),
            reconnects: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> SessionKey {
        self.config.key()
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Connection state changes, for a front end's health indicator.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Automatic reconnects performed after a transport failure.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Remote working directory resolved at login.
    pub fn workdir(&self) -> Option<String> {
        self.workdir.lock().ok().and_then(|guard| guard.clone())
    }

    /// Resolves a remote path against the session's working directory.
    pub fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') || path.starts_with('~') {
            return path.to_string();
        }
        match self.workdir() {
            Some(dir) if dir != "~" => join_remote(&dir, path),
            _ => path.to_string(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            key: self.key(),
            state: self.state(),
            workdir: self.workdir(),
            reconnects: self.reconnect_count(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(
                session = %self.id,
                target_host = %self.config.host,
                from = previous.as_str(),
                to = state.as_str(),
                "session state changed"
            );
        }
    }

    fn set_workdir(&self, workdir: Option<String>) {
        if let Ok(mut guard) = self.workdir.lock() {
            *guard = workdir;
        }
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("id", &self.id)
            .field("key", &self.key())
            .field("state", &self.state())
            .finish()
    }
}

pub struct SessionManager {
    connector: Arc<dyn TransportConnector>,
    credentials: Arc<CredentialStore>,
    sessions: RwLock<HashMap<SessionKey, Arc<RemoteSession>>>,
    profiles: RwLock<HashMap<SessionKey, SshConfig>>,
    probe_timeout: Duration,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn TransportConnector>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            connector,
            credentials,
            sessions: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Remembers how to reach a host so background work can open the session on demand.
    pub async fn register_profile(&self, config: SshConfig) {
        self.profiles.write().await.insert(config.key(), config);
    }

    /// Returns the healthy session for (host, username), opening one if needed.
    /// A second call while the session is healthy returns the same session without touching
    /// the network.
    #[tracing::instrument(
        name = "session",
        level = "debug",
        skip(self, config),
        fields(op = "connect", host = %config.host, user = %config.username, port = config.port)
    )]
    pub async fn connect(&self, config: &SshConfig) -> AppResult<Arc<RemoteSession>> {
        let key = config.key();
        let (session, created) = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let session = Arc::new(RemoteSession::new(config.clone()));
                    sessions.insert(key.clone(), session.clone());
                    (session, true)
                }
            }
        };
        self.profiles.write().await.insert(key.clone(), config.clone());

        let mut slot = session.slot.lock().await;
        if slot
            .live
            .as_ref()
            .is_some_and(|live| !live.transport.is_closed())
        {
            tracing::debug!(session = %session.id, "reusing healthy session");
            return Ok(session.clone());
        }
        // An explicit connect is the operator's retry.
        slot.blocked = None;
        slot.disconnected = false;
        if let Some(mut stale) = slot.live.take() {
            stale.transport.close().await;
        }

        match self.establish(&session, &mut slot).await {
            Ok(()) => Ok(session.clone()),
            Err(err) => {
                if created {
                    let mut sessions = self.sessions.write().await;
                    if sessions
                        .get(&key)
                        .is_some_and(|current| Arc::ptr_eq(current, &session))
                    {
                        sessions.remove(&key);
                    }
                }
                Err(err)
            }
        }
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Arc<RemoteSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Existing session for `key`, or a new one opened from the registered profile.
    pub async fn session_for(&self, key: &SessionKey) -> AppResult<Arc<RemoteSession>> {
        if let Some(session) = self.get(key).await {
            return Ok(session);
        }
        let profile = self.profiles.read().await.get(key).cloned();
        match profile {
            Some(config) => self.connect(&config).await,
            None => Err(AppError::of(
                AppErrorKind::NotFound,
                format!("no connection profile for {key}"),
            )),
        }
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|session| session.info())
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Tears the session down and drops it from the registry.
    pub async fn disconnect(&self, session: &RemoteSession) {
        let key = session.key();
        {
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(&key)
                .is_some_and(|current| std::ptr::eq(current.as_ref(), session))
            {
                sessions.remove(&key);
            }
        }
        let mut slot = session.slot.lock().await;
        if let Some(mut live) = slot.live.take() {
            live.transport.close().await;
        }
        slot.disconnected = true;
        session.set_state(ConnectionState::Disconnected);
        tracing::info!(session = %session.id, target_host = %key.host, "session disconnected");
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<RemoteSession>> =
            self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            self.disconnect(&session).await;
        }
    }

    /// Runs one command in the session's working directory.
    ///
    /// A command that outlives `timeout` yields `CommandTimeout` and leaves the session usable,
    /// unless a follow-up probe shows the transport is gone, in which case the session is marked
    /// `Failed` and `TransportError` is returned.
    pub async fn run(
        &self,
        session: &RemoteSession,
        command: &str,
        timeout: Duration,
    ) -> AppResult<ExecCapture> {
        let mut lease = self.lease(session).await?;
        lease.exec(command, timeout).await
    }

    /// Like [`SessionManager::run`], but a transport failure is followed by one reconnect and a
    /// second attempt. Only for commands that are safe to repeat (status queries).
    pub async fn run_idempotent(
        &self,
        session: &RemoteSession,
        command: &str,
        timeout: Duration,
    ) -> AppResult<ExecCapture> {
        match self.run(session, command, timeout).await {
            Err(err) if err.kind().is_transient() => {
                tracing::warn!(
                    session = %session.id,
                    error = %err,
                    "transport failed during idempotent command; retrying once"
                );
                self.run(session, command, timeout).await
            }
            other => other,
        }
    }

    /// Probes the connection and reports the resulting state.
    pub async fn health(&self, session: &RemoteSession) -> AppResult<ConnectionState> {
        let mut lease = self.lease(session).await?;
        lease.probe().await?;
        Ok(session.state())
    }

    pub async fn accept_host_key(&self, config: &SshConfig) -> AppResult<String> {
        self.connector.accept_host_key(config).await
    }

    /// Exclusive access to the session's transport, reconnecting once if it is down.
    pub async fn lease<'a>(&'a self, session: &'a RemoteSession) -> AppResult<TransportLease<'a>> {
        let mut slot = session.slot.lock().await;
        if slot.disconnected {
            return Err(AppError::of(
                AppErrorKind::NotFound,
                format!("session {} was disconnected", session.id),
            ));
        }
        if let Some(err) = &slot.blocked {
            return Err(err.clone());
        }
        let healthy = slot
            .live
            .as_ref()
            .is_some_and(|live| !live.transport.is_closed());
        if !healthy {
            if let Some(mut stale) = slot.live.take() {
                stale.transport.close().await;
            }
            if session.connected_once.load(Ordering::SeqCst) {
                session.reconnects.fetch_add(1, Ordering::SeqCst);
                tracing::info!(
                    session = %session.id,
                    target_host = %session.config.host,
                    "reconnecting after transport failure"
                );
            }
            self.establish(session, &mut slot).await?;
        }
        Ok(TransportLease {
            manager: self,
            session,
            slot,
        })
    }

    async fn establish(&self, session: &RemoteSession, slot: &mut Slot) -> AppResult<()> {
        let config = &session.config;
        session.set_state(ConnectionState::Connecting);

        let result = self.open_transport(config).await;
        let (transport, workdir) = match result {
            Ok(v) => v,
            Err(err) => {
                if matches!(
                    err.kind(),
                    AppErrorKind::HostKeyMismatch | AppErrorKind::AuthenticationFailed
                ) {
                    slot.blocked = Some(err.clone());
                }
                session.set_state(ConnectionState::Failed);
                tracing::warn!(
                    session = %session.id,
                    target_host = %config.host,
                    error = %err,
                    "failed to establish session"
                );
                return Err(err);
            }
        };

        session.set_workdir(Some(workdir.clone()));
        slot.live = Some(Live {
            transport,
            workdir,
        });
        session.connected_once.store(true, Ordering::SeqCst);
        session.set_state(ConnectionState::Connected);
        tracing::info!(
            session = %session.id,
            target_host = %config.host,
            user = %config.username,
            "session connected"
        );
        Ok(())
    }

    async fn open_transport(
        &self,
        config: &SshConfig,
    ) -> AppResult<(Box<dyn RemoteTransport>, String)> {
        let secret = self
            .credentials
            .resolve(&config.host, &config.username, config.auth.mode)
            .await?;
        if secret.is_none() && config.auth.mode == AuthMode::Password {
            return Err(AppError::of(
                AppErrorKind::AuthenticationFailed,
                format!("no password available for {}", config.key()),
            ));
        }

        let connect = self.connector.connect(config, secret);
        let mut transport = match tokio::time::timeout(config.connect_timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::of(
                    AppErrorKind::TransportError,
                    format!(
                        "connecting to {}:{} timed out after {}s",
                        config.host,
                        config.port,
                        config.connect_timeout.as_secs()
                    ),
                ));
            }
        };

        let workdir = match tokio::time::timeout(
            config.connect_timeout,
            resolve_workdir(transport.as_mut(), config.remote_root.as_deref()),
        )
        .await
        {
            Ok(Ok(dir)) => dir,
            Ok(Err(err)) => {
                transport.close().await;
                return Err(err);
            }
            Err(_) => {
                transport.close().await;
                return Err(AppError::of(
                    AppErrorKind::TransportError,
                    "resolving the remote working directory timed out",
                ));
            }
        };
        Ok((transport, workdir))
    }
}

fn cd_target(dir: &str) -> String {
    if dir == "~" {
        return "\"$HOME\"".to_string();
    }
    if let Some(rest) = dir.strip_prefix("~/") {
        return format!("\"$HOME\"/{}", sh_escape(rest));
    }
    sh_escape(dir)
}

async fn resolve_workdir(
    transport: &mut dyn RemoteTransport,
    remote_root: Option<&str>,
) -> AppResult<String> {
    match remote_root.map(str::trim).filter(|root| !root.is_empty()) {
        Some(root) => {
            let capture = transport
                .exec(&format!("cd {} && pwd -P", cd_target(root)))
                .await?;
            let resolved = first_line(&capture.stdout_text());
            if !capture.success() || resolved.is_empty() {
                return Err(AppError::of(
                    AppErrorKind::NotFound,
                    format!("remote root {root} is not accessible"),
                )
                .with_context(capture.stderr_text().trim().to_string()));
            }
            Ok(resolved)
        }
        None => {
            let capture = transport.exec("pwd -P 2>/dev/null || pwd").await?;
            let resolved = first_line(&capture.stdout_text());
            if capture.success() && !resolved.is_empty() {
                Ok(resolved)
            } else {
                Ok("~".to_string())
            }
        }
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn in_workdir(workdir: &str, command: &str) -> String {
    if workdir == "~" {
        command.to_string()
    } else {
        format!("cd {} && {}", cd_target(workdir), command)
    }
}

fn lost_transport() -> AppError {
    AppError::of(AppErrorKind::TransportError, "transport is not connected")
}

/// Exclusive, connected access to one session's transport.
///
/// Transport failures observed through the lease mark the session `Failed` and drop the
/// transport so the next lease reconnects.
pub struct TransportLease<'a> {
    manager: &'a SessionManager,
    session: &'a RemoteSession,
    slot: MutexGuard<'a, Slot>,
}

impl TransportLease<'_> {
    pub fn session(&self) -> &RemoteSession {
        self.session
    }

    fn transport(&mut self) -> AppResult<&mut dyn RemoteTransport> {
        match self.slot.live.as_mut() {
            Some(live) => Ok(live.transport.as_mut()),
            None => Err(lost_transport()),
        }
    }

    /// Drops the transport and marks the session `Failed`.
    pub async fn mark_failed(&mut self, reason: &str) {
        if let Some(mut live) = self.slot.live.take() {
            live.transport.close().await;
        }
        self.session.set_state(ConnectionState::Failed);
        tracing::warn!(session = %self.session.id, reason, "session marked failed");
    }

    async fn observe<T>(&mut self, result: AppResult<T>) -> AppResult<T> {
        if let Err(err) = &result
            && err.kind().is_transient()
        {
            let reason = err.message().to_string();
            self.mark_failed(&reason).await;
        }
        result
    }

    pub async fn exec(&mut self, command: &str, timeout: Duration) -> AppResult<ExecCapture> {
        let workdir = match self.slot.live.as_ref() {
            Some(live) => live.workdir.clone(),
            None => return Err(lost_transport()),
        };
        let wrapped = in_workdir(&workdir, command);
        tracing::debug!(session = %self.session.id, command, "executing remote command");

        let outcome = {
            let transport = self.transport()?;
            tokio::time::timeout(timeout, transport.exec(&wrapped)).await
        };
        match outcome {
            Ok(result) => self.observe(result).await,
            Err(_) => {
                let probe_timeout = self.manager.probe_timeout;
                let alive = {
                    let transport = self.transport()?;
                    matches!(
                        tokio::time::timeout(probe_timeout, transport.probe()).await,
                        Ok(Ok(()))
                    )
                };
                if alive {
                    Err(AppError::of(
                        AppErrorKind::CommandTimeout,
                        format!("command did not finish within {}s", timeout.as_secs_f64()),
                    ))
                } else {
                    self.mark_failed("transport unresponsive after command timeout")
                        .await;
                    Err(AppError::of(
                        AppErrorKind::TransportError,
                        "transport stopped responding while a command was running",
                    ))
                }
            }
        }
    }

    pub async fn probe(&mut self) -> AppResult<()> {
        let probe_timeout = self.manager.probe_timeout;
        let outcome = {
            let transport = self.transport()?;
            tokio::time::timeout(probe_timeout, transport.probe()).await
        };
        let result = outcome.unwrap_or_else(|_| {
            Err(AppError::of(
                AppErrorKind::TransportError,
                "connection probe timed out",
            ))
        });
        self.observe(result).await
    }

    pub async fn stat(&mut self, path: &str) -> AppResult<Option<EntryMeta>> {
        let result = self.transport()?.stat(path).await;
        self.observe(result).await
    }

    pub async fn list_dir(&mut self, path: &str) -> AppResult<Vec<RemoteDirEntry>> {
        let result = self.transport()?.list_dir(path).await;
        self.observe(result).await
    }

    pub async fn create_dir(&mut self, path: &str) -> AppResult<()> {
        let result = self.transport()?.create_dir(path).await;
        self.observe(result).await
    }

    pub async fn open_read(&mut self, path: &str) -> AppResult<RemoteReader> {
        let result = self.transport()?.open_read(path).await;
        self.observe(result).await
    }

    pub async fn open_write(&mut self, path: &str) -> AppResult<RemoteWriter> {
        let result = self.transport()?.open_write(path).await;
        self.observe(result).await
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> AppResult<()> {
        let result = self.transport()?.rename(from, to).await;
        self.observe(result).await
    }

    pub async fn remove_file(&mut self, path: &str) -> AppResult<()> {
        let result = self.transport()?.remove_file(path).await;
        self.observe(result).await
    }

    pub async fn set_mtime(&mut self, path: &str, mtime: i64) -> AppResult<()> {
        let result = self.transport()?.set_mtime(path, mtime).await;
        self.observe(result).await
    }
}
