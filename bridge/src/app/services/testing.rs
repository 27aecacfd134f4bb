// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! In-process fakes shared by service tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::app::errors::{AppError, AppErrorKind, AppResult};
use crate::app::ports::transport::{RemoteReader, RemoteWriter};
use crate::app::ports::{ClockPort, JobStorePort, RemoteTransport, TransportConnector};
use crate::app::types::{
    AuthSpec, EntryMeta, ExecCapture, Job, JobHandle, RemoteDirEntry, Secret, SshConfig,
};

pub(crate) fn ssh_config(host: &str, username: &str) -> SshConfig {
    SshConfig {
        host: host.to_string(),
        port: 22,
        username: username.to_string(),
        auth: AuthSpec::key(format!("/home/{username}/.ssh/id_ed25519")),
        known_hosts_path: None,
        remote_root: None,
        keepalive_secs: 0,
        connect_timeout: Duration::from_secs(5),
    }
}

pub(crate) enum Reply {
    Output(ExecCapture),
    Transport,
    Hang,
}

impl Reply {
    pub(crate) fn ok(stdout: &str) -> Self {
        Self::exit(0, stdout, "")
    }

    pub(crate) fn exit(code: i32, stdout: &str, stderr: &str) -> Self {
        Reply::Output(ExecCapture {
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code: code,
        })
    }
}

type Handler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// Scripted remote host. Login-time directory resolution is answered internally; every other
/// command goes to the handler.
pub(crate) struct FakeRemote {
    handler: Mutex<Handler>,
    fail_next: AtomicU32,
    probe_ok: AtomicBool,
    commands: Mutex<Vec<String>>,
}

impl FakeRemote {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_handler(|_| Reply::ok(""))
    }

    pub(crate) fn with_handler(handler: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(Arc::new(handler)),
            fail_next: AtomicU32::new(0),
            probe_ok: AtomicBool::new(true),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_handler(&self, handler: impl Fn(&str) -> Reply + Send + Sync + 'static) {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    /// The next `n` non-login commands fail as if the connection dropped.
    pub(crate) fn fail_next_execs(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands sent after login, with the working-directory prefix stripped.
    pub(crate) fn user_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|cmd| !cmd.ends_with("pwd -P") && !cmd.contains("pwd -P 2>/dev/null"))
            .map(|cmd| strip_workdir(&cmd).to_string())
            .collect()
    }
}

fn strip_workdir(command: &str) -> &str {
    match command.split_once(" && ") {
        Some((cd, rest)) if cd.starts_with("cd ") && !rest.starts_with("pwd -P") => rest,
        _ => command,
    }
}

struct FakeTransport {
    remote: Arc<FakeRemote>,
    username: String,
    closed: bool,
}

fn transport_lost() -> AppError {
    AppError::of(AppErrorKind::TransportError, "connection reset by peer")
}

fn unsupported() -> AppError {
    AppError::of(AppErrorKind::Internal, "file operations are not scripted")
}

impl FakeTransport {
    fn login_reply(&self, command: &str) -> Option<ExecCapture> {
        if command == "pwd -P 2>/dev/null || pwd" {
            return Some(ExecCapture {
                stdout: format!("/home/{}\n", self.username).into_bytes(),
                stderr: Vec::new(),
                exit_code: 0,
            });
        }
        let target = command.strip_prefix("cd ")?.strip_suffix(" && pwd -P")?;
        let target = target
            .replace("\"$HOME\"", &format!("/home/{}", self.username))
            .replace('\'', "");
        if target.contains("does/not/exist") {
            return Some(ExecCapture {
                stdout: Vec::new(),
                stderr: b"cd: no such file or directory\n".to_vec(),
                exit_code: 1,
            });
        }
        Some(ExecCapture {
            stdout: format!("{target}\n").into_bytes(),
            stderr: Vec::new(),
            exit_code: 0,
        })
    }
}

#[async_trait]
impl RemoteTransport for FakeTransport {
    async fn exec(&mut self, command: &str) -> AppResult<ExecCapture> {
        if self.closed {
            return Err(transport_lost());
        }
        self.remote
            .commands
            .lock()
            .unwrap()
            .push(command.to_string());
        if let Some(capture) = self.login_reply(command) {
            return Ok(capture);
        }
        let pending = self.remote.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.remote.fail_next.store(pending - 1, Ordering::SeqCst);
            self.closed = true;
            return Err(transport_lost());
        }
        let handler = self.remote.handler.lock().unwrap().clone();
        match handler(strip_workdir(command)) {
            Reply::Output(capture) => Ok(capture),
            Reply::Transport => {
                self.closed = true;
                Err(transport_lost())
            }
            Reply::Hang => std::future::pending().await,
        }
    }

    async fn probe(&mut self) -> AppResult<()> {
        if !self.closed && self.remote.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            std::future::pending().await
        }
    }

    async fn stat(&mut self, _path: &str) -> AppResult<Option<EntryMeta>> {
        Err(unsupported())
    }

    async fn list_dir(&mut self, _path: &str) -> AppResult<Vec<RemoteDirEntry>> {
        Err(unsupported())
    }

    async fn create_dir(&mut self, _path: &str) -> AppResult<()> {
        Err(unsupported())
    }

    async fn open_read(&mut self, _path: &str) -> AppResult<RemoteReader> {
        Err(unsupported())
    }

    async fn open_write(&mut self, _path: &str) -> AppResult<RemoteWriter> {
        Err(unsupported())
    }

    async fn rename(&mut self, _from: &str, _to: &str) -> AppResult<()> {
        Err(unsupported())
    }

    async fn remove_file(&mut self, _path: &str) -> AppResult<()> {
        Err(unsupported())
    }

    async fn set_mtime(&mut self, _path: &str, _mtime: i64) -> AppResult<()> {
        Err(unsupported())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    Accept,
    HostKey,
    Auth,
    Refuse,
}

pub(crate) struct FakeConnector {
    remote: Arc<FakeRemote>,
    mode: Mutex<ConnectMode>,
    connects: AtomicU32,
    created: AtomicU32,
    last_secret: Mutex<Option<Secret>>,
}

impl FakeConnector {
    pub(crate) fn new(remote: Arc<FakeRemote>) -> Self {
        Self {
            remote,
            mode: Mutex::new(ConnectMode::Accept),
            connects: AtomicU32::new(0),
            created: AtomicU32::new(0),
            last_secret: Mutex::new(None),
        }
    }

    pub(crate) fn reject_host_key(&self) {
        *self.mode.lock().unwrap() = ConnectMode::HostKey;
    }

    pub(crate) fn reject_auth(&self) {
        *self.mode.lock().unwrap() = ConnectMode::Auth;
    }

    pub(crate) fn refuse_connections(&self) {
        *self.mode.lock().unwrap() = ConnectMode::Refuse;
    }

    /// Connection attempts, successful or not.
    pub(crate) fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn transports_created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn last_secret(&self) -> Option<Secret> {
        self.last_secret.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(
        &self,
        config: &SshConfig,
        secret: Option<Secret>,
    ) -> AppResult<Box<dyn RemoteTransport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_secret.lock().unwrap() = secret;
        let mode = *self.mode.lock().unwrap();
        match mode {
            ConnectMode::HostKey => Err(AppError::of(
                AppErrorKind::HostKeyMismatch,
                format!("host key for {} changed", config.host),
            )),
            ConnectMode::Auth => Err(AppError::of(
                AppErrorKind::AuthenticationFailed,
                "server rejected credentials",
            )),
            ConnectMode::Refuse => Err(AppError::of(
                AppErrorKind::TransportError,
                "connection refused",
            )),
            ConnectMode::Accept => {
                self.created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FakeTransport {
                    remote: self.remote.clone(),
                    username: config.username.clone(),
                    closed: false,
                }))
            }
        }
    }

    async fn accept_host_key(&self, _config: &SshConfig) -> AppResult<String> {
        *self.mode.lock().unwrap() = ConnectMode::Accept;
        Ok("ssh-ed25519 SHA256:fake".to_string())
    }
}

pub(crate) struct FakeClock {
    now: Mutex<OffsetDateTime>,
}

impl FakeClock {
    pub(crate) fn at(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub(crate) fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl ClockPort for FakeClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
pub(crate) struct MemoryJobStore {
    jobs: Mutex<HashMap<JobHandle, Job>>,
}

impl MemoryJobStore {
    pub(crate) fn with_jobs(jobs: Vec<Job>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into_iter().map(|j| (j.handle.clone(), j)).collect()),
        }
    }

    pub(crate) fn stored(&self, handle: &JobHandle) -> Option<Job> {
        self.jobs.lock().unwrap().get(handle).cloned()
    }
}

#[async_trait]
impl JobStorePort for MemoryJobStore {
    async fn upsert_job(&self, job: &Job) -> AppResult<()> {
        self.jobs
            .lock()
            .unwrap()
            .insert(job.handle.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, handle: &JobHandle) -> AppResult<Option<Job>> {
        Ok(self.stored(handle))
    }

    async fn list_jobs(&self) -> AppResult<Vec<Job>> {
        Ok(self.jobs.lock().unwrap().values().cloned().collect())
    }

    async fn delete_job(&self, handle: &JobHandle) -> AppResult<bool> {
        Ok(self.jobs.lock().unwrap().remove(handle).is_some())
    }
}
