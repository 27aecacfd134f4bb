// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{Job, JobHandle};

#[async_trait]
/// Durable keyed record set (handle -> Job) behind the in-memory job registry.
/// Every registry replacement is written through; the whole set is reloaded at startup.
pub trait JobStorePort: Send + Sync {
    async fn upsert_job(&self, job: &Job) -> AppResult<()>;
    async fn get_job(&self, handle: &JobHandle) -> AppResult<Option<Job>>;
    async fn list_jobs(&self) -> AppResult<Vec<Job>>;
    async fn delete_job(&self, handle: &JobHandle) -> AppResult<bool>;
}
