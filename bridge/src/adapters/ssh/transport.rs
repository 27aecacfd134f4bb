// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use russh::client::{Config, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::RemoteTransport;
use crate::app::ports::transport::{RemoteReader, RemoteWriter};
use crate::app::services::shell::sh_escape;
use crate::app::types::{EntryMeta, ExecCapture, RemoteDirEntry, Secret, SshConfig};

use super::auth::authenticate;
use super::handler::{ClientHandler, KeyPolicy};

pub(super) fn client_config(keepalive_secs: u64) -> Arc<Config> {
    let keepalive = (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs));
    Arc::new(Config {
        keepalive_interval: keepalive,
        keepalive_max: 3,
        channel_buffer_size: 64,
        window_size: 1024 * 1024,
        ..Default::default()
    })
}

pub(super) fn known_hosts_file(config: &SshConfig) -> Result<PathBuf> {
    if let Some(path) = &config.known_hosts_path {
        return Ok(path.clone());
    }
    Ok(dirs::home_dir()
        .ok_or_else(|| anyhow!("cannot locate home directory for known_hosts"))?
        .join(".ssh")
        .join("known_hosts"))
}

pub(super) async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("{host}:{port} resolved to no addresses"))
}

fn handle_capture_message(
    msg: &ChannelMsg,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
    code: &mut Option<i32>,
) -> bool {
    match msg {
        ChannelMsg::Data { data } => {
            out.extend_from_slice(data);
            false
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            err.extend_from_slice(data);
            false
        }
        ChannelMsg::ExitStatus { exit_status } => {
            *code = Some(*exit_status as i32);
            false
        }
        ChannelMsg::Close => true,
        _ => false,
    }
}

/// SFTP paths are relative to the login directory, so `~/x` becomes `x`.
fn sftp_path(path: &str) -> String {
    if path == "~" {
        return ".".to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) => rest.to_string(),
        None => path.to_string(),
    }
}

fn attrs_meta(attrs: &FileAttributes) -> EntryMeta {
    let is_dir = attrs.is_dir();
    EntryMeta {
        size: if is_dir { 0 } else { attrs.size.unwrap_or(0) },
        mtime: attrs.mtime.map(i64::from).unwrap_or(0),
        is_dir,
    }
}

fn sftp_status(err: &russh_sftp::client::error::Error) -> Option<StatusCode> {
    match err {
        russh_sftp::client::error::Error::Status(status) => Some(status.status_code),
        _ => None,
    }
}

/// An authenticated russh connection plus a lazily opened SFTP subsystem.
pub struct SshTransport {
    handle: Handle<ClientHandler>,
    sftp: Option<SftpSession>,
    host: String,
    closed: bool,
}

impl SshTransport {
    pub(super) async fn open(config: &SshConfig, secret: Option<&Secret>) -> Result<Self> {
        let addr = resolve_addr(&config.host, config.port).await?;
        let handler = ClientHandler::new(
            config.host.clone(),
            addr,
            known_hosts_file(config)?,
            KeyPolicy::Verify,
        );
        let mut handle = russh::client::connect(client_config(config.keepalive_secs), addr, handler)
            .await
            .context("SSH connect failed")?;
        log::info!(
            "established connection with {}@{}, proceeding with auth",
            config.username,
            addr
        );
        if let Err(err) = authenticate(&mut handle, config, secret).await {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(err);
        }
        Ok(Self {
            handle,
            sftp: None,
            host: config.host.clone(),
            closed: false,
        })
    }

    fn lost(&self, what: &str, err: impl std::fmt::Display) -> AppError {
        AppError::with_message(
            AppErrorKind::TransportError,
            codes::TRANSPORT_ERROR,
            format!("{what} on {} failed: {err}", self.host),
        )
    }

    /// Maps an SFTP failure. Status replies mean the server answered; anything else means
    /// the channel is gone and the cached subsystem is dropped.
    fn sftp_error(&mut self, op: &str, path: &str, err: russh_sftp::client::error::Error) -> AppError {
        match sftp_status(&err) {
            Some(StatusCode::NoSuchFile) => AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("remote path missing: {path}"),
            ),
            Some(_) => AppError::with_message(
                AppErrorKind::Internal,
                codes::REMOTE_ERROR,
                format!("sftp {op} {path} failed: {err}"),
            ),
            None => {
                self.sftp = None;
                self.lost(&format!("sftp {op} {path}"), err)
            }
        }
    }

    async fn sftp(&mut self) -> AppResult<&SftpSession> {
        if self.closed || self.handle.is_closed() {
            self.closed = true;
            return Err(self.lost("sftp", "connection closed"));
        }
        if self.sftp.is_none() {
            let opened: Result<SftpSession> = async {
                let channel = self.handle.channel_open_session().await?;
                channel.request_subsystem(true, "sftp").await?;
                Ok(SftpSession::new(channel.into_stream()).await?)
            }
            .await;
            let session = opened.map_err(|err| self.lost("opening sftp", err))?;
            self.sftp = Some(session);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| AppError::of(AppErrorKind::Internal, "sftp session missing"))
    }

    async fn exec_capture(&mut self, command: &str) -> Result<(ExecCapture, bool)> {
        let mut chan = self.handle.channel_open_session().await?;
        chan.exec(true, command).await.context("exec request")?;
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        let mut closed = false;
        while let Some(msg) = chan.wait().await {
            if handle_capture_message(&msg, &mut out, &mut err, &mut code) {
                closed = true;
                break;
            }
        }
        let _ = chan.eof().await;
        let _ = chan.close().await;
        let finished = closed || code.is_some();
        Ok((
            ExecCapture {
                stdout: out,
                stderr: err,
                exit_code: code.unwrap_or(-1),
            },
            finished,
        ))
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    #[tracing::instrument(name = "ssh", level = "debug", skip(self, command), fields(op = "exec", host = %self.host))]
    async fn exec(&mut self, command: &str) -> AppResult<ExecCapture> {
        if self.closed || self.handle.is_closed() {
            self.closed = true;
            return Err(self.lost("exec", "connection closed"));
        }
        match self.exec_capture(command).await {
            Ok((capture, true)) => Ok(capture),
            Ok(_) => {
                self.closed = true;
                Err(self.lost("exec", "channel ended without exit status"))
            }
            Err(err) => {
                self.closed = self.handle.is_closed();
                Err(self.lost("exec", err))
            }
        }
    }

    async fn probe(&mut self) -> AppResult<()> {
        if self.handle.is_closed() {
            self.closed = true;
            return Err(self.lost("probe", "connection closed"));
        }
        let chan = self
            .handle
            .channel_open_session()
            .await
            .map_err(|err| self.lost("probe", err))?;
        let _ = chan.close().await;
        Ok(())
    }

    #[tracing::instrument(name = "sftp", level = "debug", skip(self), fields(op = "stat", host = %self.host))]
    async fn stat(&mut self, path: &str) -> AppResult<Option<EntryMeta>> {
        let target = sftp_path(path);
        let result = self.sftp().await?.metadata(&target).await;
        match result {
            Ok(attrs) => Ok(Some(attrs_meta(&attrs))),
            Err(err) if sftp_status(&err) == Some(StatusCode::NoSuchFile) => Ok(None),
            Err(err) => Err(self.sftp_error("stat", path, err)),
        }
    }

    #[tracing::instrument(name = "sftp", level = "debug", skip(self), fields(op = "list_dir", host = %self.host))]
    async fn list_dir(&mut self, path: &str) -> AppResult<Vec<RemoteDirEntry>> {
        let target = sftp_path(path);
        let result = self.sftp().await?.read_dir(&target).await;
        let entries = result.map_err(|err| self.sftp_error("read_dir", path, err))?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                let file_type = entry.file_type();
                file_type.is_dir() || file_type.is_file()
            })
            .map(|entry| RemoteDirEntry {
                name: entry.file_name(),
                meta: attrs_meta(&entry.metadata()),
            })
            .collect())
    }

    async fn create_dir(&mut self, path: &str) -> AppResult<()> {
        let target = sftp_path(path);
        let result = self.sftp().await?.create_dir(&target).await;
        result.map_err(|err| self.sftp_error("mkdir", path, err))
    }

    async fn open_read(&mut self, path: &str) -> AppResult<RemoteReader> {
        let target = sftp_path(path);
        let result = self.sftp().await?.open(&target).await;
        let file = result.map_err(|err| self.sftp_error("open", path, err))?;
        Ok(Box::new(file))
    }

    async fn open_write(&mut self, path: &str) -> AppResult<RemoteWriter> {
        let target = sftp_path(path);
        let result = self.sftp().await?.create(&target).await;
        let file = result.map_err(|err| self.sftp_error("create", path, err))?;
        Ok(Box::new(file))
    }

    /// SFTP v3 rename refuses an existing destination, so that case falls back to
    /// `mv -f`, which is still a single rename(2) on the server.
    async fn rename(&mut self, from: &str, to: &str) -> AppResult<()> {
        let (src, dst) = (sftp_path(from), sftp_path(to));
        let result = self.sftp().await?.rename(&src, &dst).await;
        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if sftp_status(&err).is_none() {
            return Err(self.sftp_error("rename", from, err));
        }
        log::debug!("sftp rename {from} -> {to} refused ({err}); using mv");
        let command = format!("mv -f -- {} {}", sh_escape(&src), sh_escape(&dst));
        let capture = self.exec(&command).await?;
        if capture.success() {
            Ok(())
        } else {
            Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::REMOTE_ERROR,
                format!("rename {from} -> {to} failed: {}", capture.stderr_text().trim()),
            ))
        }
    }

    async fn remove_file(&mut self, path: &str) -> AppResult<()> {
        let target = sftp_path(path);
        let result = self.sftp().await?.remove_file(&target).await;
        result.map_err(|err| self.sftp_error("remove", path, err))
    }

    async fn set_mtime(&mut self, path: &str, mtime: i64) -> AppResult<()> {
        let target = sftp_path(path);
        let stamp = u32::try_from(mtime.max(0)).unwrap_or(u32::MAX);
        let attrs = FileAttributes {
            atime: Some(stamp),
            mtime: Some(stamp),
            ..Default::default()
        };
        let result = self.sftp().await?.set_metadata(&target, attrs).await;
        result.map_err(|err| self.sftp_error("setstat", path, err))
    }

    fn is_closed(&self) -> bool {
        self.closed || self.handle.is_closed()
    }

    async fn close(&mut self) {
        self.closed = true;
        self.sftp = None;
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
