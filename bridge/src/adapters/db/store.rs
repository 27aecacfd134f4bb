// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::app::errors::AppErrorKind;
use crate::app::types::{Job, JobError, JobHandle, JobState, ResourceRequest, SessionKey};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("empty job handle")]
    EmptyHandle,
    #[error("corrupt row for job {handle}: {detail}")]
    CorruptRow { handle: String, detail: String },
}

pub type Result<T> = std::result::Result<T, JobStoreError>;

/// SQLite-backed job table. One row per job handle; rows are replaced whole.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let url = format!("sqlite://{}", path_ref.to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              handle TEXT PRIMARY KEY,
              host TEXT NOT NULL,
              username TEXT NOT NULL,
              remote_id TEXT,
              command TEXT NOT NULL,
              resources TEXT NOT NULL,          -- JSON object of string pairs
              state TEXT NOT NULL,
              submitted_at TEXT NOT NULL,       -- RFC 3339
              last_poll_at TEXT,
              exit_code INTEGER,
              scheduler_state TEXT,
              error_kind TEXT,
              error_message TEXT,
              poll_failures INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_host_username ON jobs(host, username);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert(&self, job: &Job) -> Result<()> {
        if job.handle.as_str().trim().is_empty() {
            return Err(JobStoreError::EmptyHandle);
        }
        let resources = serde_json::to_string(&job.resources)?;
        let submitted_at = format_ts(job.submitted_at)?;
        let last_poll_at = job.last_poll_at.map(format_ts).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO jobs (
              handle, host, username, remote_id, command, resources, state,
              submitted_at, last_poll_at, exit_code, scheduler_state,
              error_kind, error_message, poll_failures
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(handle) DO UPDATE SET
              host = excluded.host,
              username = excluded.username,
              remote_id = excluded.remote_id,
              command = excluded.command,
              resources = excluded.resources,
              state = excluded.state,
              submitted_at = excluded.submitted_at,
              last_poll_at = excluded.last_poll_at,
              exit_code = excluded.exit_code,
              scheduler_state = excluded.scheduler_state,
              error_kind = excluded.error_kind,
              error_message = excluded.error_message,
              poll_failures = excluded.poll_failures
            "#,
        )
        .bind(job.handle.as_str())
        .bind(&job.session.host)
        .bind(&job.session.username)
        .bind(job.remote_id.as_deref())
        .bind(&job.command)
        .bind(resources)
        .bind(job.state.as_str())
        .bind(submitted_at)
        .bind(last_poll_at)
        .bind(job.exit_code)
        .bind(job.scheduler_state.as_deref())
        .bind(job.error.as_ref().map(|e| e.kind.as_str()))
        .bind(job.error.as_ref().map(|e| e.message.as_str()))
        .bind(i64::from(job.poll_failures))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, handle: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE handle = ?1")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// All jobs, oldest submission first.
    pub async fn list(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY submitted_at ASC, handle ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    pub async fn delete(&self, handle: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM jobs WHERE handle = ?1")
            .bind(handle)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}

fn format_ts(ts: OffsetDateTime) -> Result<String> {
    ts.format(&Rfc3339)
        .map_err(|e| JobStoreError::Timestamp(e.to_string()))
}

fn parse_ts(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| JobStoreError::Timestamp(e.to_string()))
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let handle: String = row.try_get("handle")?;
    let corrupt = |detail: String| JobStoreError::CorruptRow {
        handle: handle.clone(),
        detail,
    };

    let state_raw: String = row.try_get("state")?;
    let state = JobState::from_str(&state_raw).map_err(corrupt)?;
    let resources: ResourceRequest =
        serde_json::from_str(&row.try_get::<String, _>("resources")?)?;
    let submitted_at = parse_ts(&row.try_get::<String, _>("submitted_at")?)?;
    let last_poll_at = row
        .try_get::<Option<String>, _>("last_poll_at")?
        .as_deref()
        .map(parse_ts)
        .transpose()?;

    let error_kind: Option<String> = row.try_get("error_kind")?;
    let error = match error_kind {
        Some(code) => {
            let kind = AppErrorKind::from_code(&code)
                .ok_or_else(|| corrupt(format!("unknown error kind '{code}'")))?;
            Some(JobError {
                kind,
                message: row
                    .try_get::<Option<String>, _>("error_message")?
                    .unwrap_or_default(),
            })
        }
        None => None,
    };
    let poll_failures = u32::try_from(row.try_get::<i64, _>("poll_failures")?)
        .map_err(|e| corrupt(format!("poll_failures: {e}")))?;

    Ok(Job {
        handle: JobHandle::new(handle.clone()),
        session: SessionKey::new(
            row.try_get::<String, _>("host")?,
            row.try_get::<String, _>("username")?,
        ),
        remote_id: row.try_get("remote_id")?,
        command: row.try_get("command")?,
        resources,
        state,
        submitted_at,
        last_poll_at,
        exit_code: row.try_get("exit_code")?,
        scheduler_state: row.try_get("scheduler_state")?,
        error,
        poll_failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn make_job(handle: &str, submitted_at: OffsetDateTime) -> Job {
        let mut resources = ResourceRequest::new();
        resources.insert("cpus".into(), "4".into());
        resources.insert("walltime".into(), "01:00:00".into());
        Job::new(
            JobHandle::new(handle),
            SessionKey::new("hpc.example.org", "jeff"),
            "sbatch run.sh",
            resources,
            submitted_at,
        )
    }

    #[tokio::test]
    async fn round_trip_by_handle() {
        let db = JobStore::open_memory().await.unwrap();
        let mut job = make_job("job-1", datetime!(2026-03-01 12:00:00 UTC));
        job.remote_id = Some("4242".into());
        job.state = JobState::Failed;
        job.exit_code = Some(2);
        job.scheduler_state = Some("FAILED".into());
        job.last_poll_at = Some(datetime!(2026-03-01 12:05:00 UTC));
        job.error = Some(JobError {
            kind: AppErrorKind::SchedulerRejected,
            message: "invalid partition".into(),
        });
        job.poll_failures = 2;

        db.upsert(&job).await.unwrap();
        let got = db.get("job-1").await.unwrap().unwrap();
        assert_eq!(got, job);
        assert!(db.get("job-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_the_whole_row() {
        let db = JobStore::open_memory().await.unwrap();
        let mut job = make_job("job-1", datetime!(2026-03-01 12:00:00 UTC));
        job.scheduler_state = Some("PENDING".into());
        db.upsert(&job).await.unwrap();

        job.state = JobState::Running;
        job.scheduler_state = None;
        db.upsert(&job).await.unwrap();

        let all = db.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, JobState::Running);
        assert_eq!(all[0].scheduler_state, None);
    }

    #[tokio::test]
    async fn list_is_ordered_by_submission() {
        let db = JobStore::open_memory().await.unwrap();
        db.upsert(&make_job("job-b", datetime!(2026-03-02 08:00:00 UTC)))
            .await
            .unwrap();
        db.upsert(&make_job("job-a", datetime!(2026-03-01 08:00:00 UTC)))
            .await
            .unwrap();
        let handles: Vec<String> = db
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.handle.to_string())
            .collect();
        assert_eq!(handles, vec!["job-a", "job-b"]);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_went_away() {
        let db = JobStore::open_memory().await.unwrap();
        db.upsert(&make_job("job-1", datetime!(2026-03-01 12:00:00 UTC)))
            .await
            .unwrap();
        assert!(db.delete("job-1").await.unwrap());
        assert!(!db.delete("job-1").await.unwrap());
    }

    #[tokio::test]
    async fn empty_handle_is_rejected() {
        let db = JobStore::open_memory().await.unwrap();
        let job = make_job("  ", datetime!(2026-03-01 12:00:00 UTC));
        assert!(matches!(
            db.upsert(&job).await,
            Err(JobStoreError::EmptyHandle)
        ));
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("jobs.sqlite");
        {
            let db = JobStore::open(&path).await.unwrap();
            db.upsert(&make_job("job-1", datetime!(2026-03-01 12:00:00 UTC)))
                .await
                .unwrap();
        }
        let db = JobStore::open(&path).await.unwrap();
        assert!(db.get("job-1").await.unwrap().is_some());
    }
}
