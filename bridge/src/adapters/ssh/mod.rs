// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use russh::Disconnect;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{RemoteTransport, TransportConnector};
use crate::app::types::{Secret, SshConfig};

mod auth;
mod error;
mod handler;
mod transport;

pub use error::{AuthenticationFailure, HostKeyProblem, HostKeyRejected};
pub use transport::SshTransport;

use handler::{ClientHandler, KeyPolicy, remember_host_key};
use transport::{client_config, known_hosts_file, resolve_addr};

/// Opens russh transports. Host keys are checked against known_hosts before
/// authentication and are never learned implicitly.
#[derive(Debug, Clone, Default)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

fn map_connect_error(err: anyhow::Error) -> AppError {
    if err.chain().any(|cause| cause.is::<HostKeyRejected>()) {
        AppError::with_message(
            AppErrorKind::HostKeyMismatch,
            codes::HOST_KEY_MISMATCH,
            format!("ssh connect failed: {err:#}"),
        )
    } else if err.chain().any(|cause| cause.is::<AuthenticationFailure>()) {
        AppError::with_message(
            AppErrorKind::AuthenticationFailed,
            codes::AUTHENTICATION_FAILED,
            format!("ssh authentication failed: {err:#}"),
        )
    } else {
        AppError::with_message(
            AppErrorKind::TransportError,
            codes::TRANSPORT_ERROR,
            format!("ssh connect failed: {err:#}"),
        )
    }
}

#[async_trait]
impl TransportConnector for SshConnector {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, config, secret),
        fields(op = "connect", host = %config.host, user = %config.username, port = config.port)
    )]
    async fn connect(
        &self,
        config: &SshConfig,
        secret: Option<Secret>,
    ) -> AppResult<Box<dyn RemoteTransport>> {
        let transport = SshTransport::open(config, secret.as_ref())
            .await
            .map_err(map_connect_error)?;
        Ok(Box::new(transport))
    }

    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self, config),
        fields(op = "accept_host_key", host = %config.host, port = config.port)
    )]
    async fn accept_host_key(&self, config: &SshConfig) -> AppResult<String> {
        let captured = Arc::new(Mutex::new(None));
        let result: anyhow::Result<String> = async {
            let known_hosts = known_hosts_file(config)?;
            let addr = resolve_addr(&config.host, config.port).await?;
            let handler = ClientHandler::new(
                config.host.clone(),
                addr,
                known_hosts.clone(),
                KeyPolicy::Capture(captured.clone()),
            );
            let handle =
                russh::client::connect(client_config(0), addr, handler).await?;
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            let key = captured
                .lock()
                .map_err(|_| anyhow!("host key capture poisoned"))?
                .take()
                .ok_or_else(|| anyhow!("server presented no host key"))?;
            let fingerprint = remember_host_key(&config.host, config.port, &key, &known_hosts)?;
            log::info!(
                "recorded host key {fingerprint} for {}:{} in {}",
                config.host,
                config.port,
                known_hosts.display()
            );
            Ok(fingerprint)
        }
        .await;
        result.map_err(|err| {
            AppError::with_message(
                AppErrorKind::TransportError,
                codes::TRANSPORT_ERROR,
                format!("accepting host key failed: {err:#}"),
            )
        })
    }
}
