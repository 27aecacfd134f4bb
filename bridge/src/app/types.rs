// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::app::errors::{AppError, AppErrorKind, AppResult};

/// Registry key for remote sessions: one live transport per (host, username).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub host: String,
    pub username: String,
}

impl SessionKey {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Key,
    Password,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Key => "key",
            AuthMode::Password => "password",
        }
    }

    /// The kind of secret this mode may need from the credential store.
    pub fn secret_purpose(self) -> SecretPurpose {
        match self {
            AuthMode::Key => SecretPurpose::KeyPassphrase,
            AuthMode::Password => SecretPurpose::Password,
        }
    }
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "key" | "publickey" => Ok(AuthMode::Key),
            "password" => Ok(AuthMode::Password),
            other => Err(format!("unknown auth mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretPurpose {
    Password,
    KeyPassphrase,
}

impl SecretPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            SecretPurpose::Password => "password",
            SecretPurpose::KeyPassphrase => "key_passphrase",
        }
    }

    pub fn env_var(self) -> &'static str {
        match self {
            SecretPurpose::Password => "DAYHOFF_HPC_PASSWORD",
            SecretPurpose::KeyPassphrase => "DAYHOFF_HPC_KEY_PASSPHRASE",
        }
    }
}

/// Secret material. Never printed; `Debug` is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Override,
    Environment,
    SecretManager,
}

/// How a session authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSpec {
    pub mode: AuthMode,
    pub identity_path: Option<PathBuf>,
}

impl AuthSpec {
    pub fn key(identity_path: impl Into<PathBuf>) -> Self {
        Self {
            mode: AuthMode::Key,
            identity_path: Some(identity_path.into()),
        }
    }

    pub fn password() -> Self {
        Self {
            mode: AuthMode::Password,
            identity_path: None,
        }
    }
}

/// Everything needed to open (and later reopen) a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthSpec,
    pub known_hosts_path: Option<PathBuf>,
    pub remote_root: Option<String>,
    pub keepalive_secs: u64,
    pub connect_timeout: Duration,
}

impl SshConfig {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.host.clone(), self.username.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub key: SessionKey,
    pub state: ConnectionState,
    pub workdir: Option<String>,
    pub reconnects: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Whether `run` executes a command directly on the login node or through the scheduler's
/// interactive launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Direct,
    Interactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Submitting,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Submitting => "submitting",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let state = match s {
            "pending" => JobState::Pending,
            "submitting" => JobState::Submitting,
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            "unknown" => JobState::Unknown,
            other => return Err(format!("unknown job state: {other}")),
        };
        Ok(state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: AppErrorKind,
    pub message: String,
}

/// Open key-value resource request; keys the bridge understands are validated, the rest pass
/// through to the scheduler.
pub type ResourceRequest = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub handle: JobHandle,
    pub session: SessionKey,
    pub remote_id: Option<String>,
    pub command: String,
    pub resources: ResourceRequest,
    pub state: JobState,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_poll_at: Option<OffsetDateTime>,
    pub exit_code: Option<i32>,
    /// Raw state string last reported by the scheduler.
    pub scheduler_state: Option<String>,
    pub error: Option<JobError>,
    /// Consecutive polls that could not reach a determinate answer.
    pub poll_failures: u32,
}

impl Job {
    pub fn new(
        handle: JobHandle,
        session: SessionKey,
        command: impl Into<String>,
        resources: ResourceRequest,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            handle,
            session,
            remote_id: None,
            command: command.into(),
            resources,
            state: JobState::Pending,
            submitted_at: now,
            last_poll_at: None,
            exit_code: None,
            scheduler_state: None,
            error: None,
            poll_failures: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The remote ID is written at most once.
    pub fn assign_remote_id(&mut self, remote_id: impl Into<String>) -> AppResult<()> {
        let remote_id = remote_id.into();
        match &self.remote_id {
            None => {
                self.remote_id = Some(remote_id);
                Ok(())
            }
            Some(existing) if *existing == remote_id => Ok(()),
            Some(existing) => Err(AppError::of(
                AppErrorKind::Internal,
                format!("remote id already set to {existing}; refusing {remote_id}"),
            )
            .with_handle(self.handle.as_str())),
        }
    }

    pub(crate) fn fail_with(&mut self, state: JobState, err: &AppError) {
        self.state = state;
        self.error = Some(JobError {
            kind: err.kind(),
            message: err.message().to_string(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    Overwrite,
    SkipIfNewer,
    FailOnConflict,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(ConflictPolicy::Overwrite),
            "skip-if-newer" | "skip_if_newer" => Ok(ConflictPolicy::SkipIfNewer),
            "fail-on-conflict" | "fail_on_conflict" => Ok(ConflictPolicy::FailOnConflict),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFilterAction {
    Include,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFilterRule {
    pub action: SyncFilterAction,
    pub pattern: String,
}

/// Where an interrupted or aborted sync stood when it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub task: String,
    pub failed_path: Option<String>,
    pub completed: Vec<String>,
    pub not_attempted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub task: String,
    pub direction: SyncDirection,
    pub transferred: Vec<String>,
    pub skipped: Vec<String>,
    pub directories_created: usize,
}

/// Size and modification time (unix seconds) of a file or directory on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryMeta {
    pub size: u64,
    pub mtime: i64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub name: String,
    pub meta: EntryMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    LocalOnly,
    RemoteOnly,
    SizeDiffers,
    LocalNewer,
    RemoteNewer,
    TypeMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DivergentEntry {
    /// Path relative to the compared roots, `/`-separated.
    pub path: String,
    pub kind: DivergenceKind,
    pub local: Option<EntryMeta>,
    pub remote: Option<EntryMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueScope {
    User,
    All,
    Job(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub partition: String,
    pub name: String,
    pub user: String,
    pub state: String,
    pub time_used: String,
    pub nodes: String,
    pub reason: String,
    pub submit_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitingSummary {
    pub pending_count: usize,
    pub min_wait_secs: Option<u64>,
    pub avg_wait_secs: Option<u64>,
    pub max_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub entries: Vec<QueueEntry>,
    pub waiting: Option<WaitingSummary>,
}
