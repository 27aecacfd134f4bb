// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Platform secret manager (macOS Keychain, Windows Credential Manager, Secret Service).

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::SecretStorePort;
use crate::app::types::Secret;

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyringStore;

fn backend_error(op: &str, service: &str, err: keyring::Error) -> AppError {
    log::warn!("secret manager {op} for service {service} failed: {err}");
    AppError::with_message(
        AppErrorKind::CredentialBackendUnavailable,
        codes::CREDENTIAL_BACKEND_UNAVAILABLE,
        format!("secret manager {op} failed: {err}"),
    )
}

/// Keyring calls block on IPC with the platform daemon.
async fn blocking<T, F>(f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|err| {
        AppError::with_message(
            AppErrorKind::Internal,
            codes::INTERNAL_ERROR,
            format!("secret manager task failed: {err}"),
        )
    })?
}

#[async_trait]
impl SecretStorePort for KeyringStore {
    async fn get(&self, service: &str, account: &str) -> AppResult<Option<Secret>> {
        let (service, account) = (service.to_string(), account.to_string());
        blocking(move || {
            let entry = keyring::Entry::new(&service, &account)
                .map_err(|err| backend_error("lookup", &service, err))?;
            match entry.get_password() {
                Ok(value) => Ok(Some(Secret::new(value))),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(err) => Err(backend_error("lookup", &service, err)),
            }
        })
        .await
    }

    async fn set(&self, service: &str, account: &str, secret: &Secret) -> AppResult<()> {
        let (service, account) = (service.to_string(), account.to_string());
        let secret = secret.clone();
        blocking(move || {
            keyring::Entry::new(&service, &account)
                .and_then(|entry| entry.set_password(secret.expose()))
                .map_err(|err| backend_error("store", &service, err))
        })
        .await
    }

    async fn delete(&self, service: &str, account: &str) -> AppResult<bool> {
        let (service, account) = (service.to_string(), account.to_string());
        blocking(move || {
            let entry = keyring::Entry::new(&service, &account)
                .map_err(|err| backend_error("delete", &service, err))?;
            match entry.delete_credential() {
                Ok(()) => Ok(true),
                Err(keyring::Error::NoEntry) => Ok(false),
                Err(err) => Err(backend_error("delete", &service, err)),
            }
        })
        .await
    }
}
