// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::db::{JobStore, JobStoreError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::JobStorePort;
use crate::app::types::{Job, JobHandle};

#[derive(Clone)]
pub struct SqliteJobStore {
    store: Arc<JobStore>,
}

impl SqliteJobStore {
    pub fn new(store: JobStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

/// Persistence failures never leak sqlx types past this adapter.
fn map_store_error(err: JobStoreError) -> AppError {
    match err {
        JobStoreError::EmptyHandle => AppError::with_message(
            AppErrorKind::InvalidArgument,
            codes::INVALID_ARGUMENT,
            "job handle must not be empty",
        ),
        other => {
            log::error!("job store failure: {other}");
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                format!("job store: {other}"),
            )
        }
    }
}

#[async_trait]
impl JobStorePort for SqliteJobStore {
    async fn upsert_job(&self, job: &Job) -> AppResult<()> {
        self.store.upsert(job).await.map_err(map_store_error)
    }

    async fn get_job(&self, handle: &JobHandle) -> AppResult<Option<Job>> {
        self.store
            .get(handle.as_str())
            .await
            .map_err(map_store_error)
    }

    async fn list_jobs(&self) -> AppResult<Vec<Job>> {
        self.store.list().await.map_err(map_store_error)
    }

    async fn delete_job(&self, handle: &JobHandle) -> AppResult<bool> {
        self.store
            .delete(handle.as_str())
            .await
            .map_err(map_store_error)
    }
}
