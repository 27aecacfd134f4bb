// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::Secret;

#[async_trait]
/// Platform secret manager addressed by (service, account).
/// Implementations must report an unreachable backend as `CredentialBackendUnavailable`
/// and a missing entry as `Ok(None)`; the two are never conflated.
pub trait SecretStorePort: Send + Sync {
    async fn get(&self, service: &str, account: &str) -> AppResult<Option<Secret>>;
    async fn set(&self, service: &str, account: &str, secret: &Secret) -> AppResult<()>;
    async fn delete(&self, service: &str, account: &str) -> AppResult<bool>;
}
