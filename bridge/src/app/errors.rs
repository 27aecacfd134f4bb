// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::app::types::SyncProgress;

pub mod codes {
    pub const HOST_KEY_MISMATCH: &str = "host_key_mismatch";
    pub const AUTHENTICATION_FAILED: &str = "authentication_failed";
    pub const TRANSPORT_ERROR: &str = "transport_error";
    pub const COMMAND_TIMEOUT: &str = "command_timeout";
    pub const CREDENTIAL_BACKEND_UNAVAILABLE: &str = "credential_backend_unavailable";
    pub const SUBMISSION_PARSE_ERROR: &str = "submission_parse_error";
    pub const SCHEDULER_REJECTED: &str = "scheduler_rejected";
    pub const SYNC_CONFLICT: &str = "sync_conflict";
    pub const SYNC_ABORTED: &str = "sync_aborted";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const CANCELED: &str = "canceled";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const LOCAL_ERROR: &str = "local_error";
    pub const REMOTE_ERROR: &str = "remote_error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppErrorKind {
    HostKeyMismatch,
    AuthenticationFailed,
    TransportError,
    CommandTimeout,
    CredentialBackendUnavailable,
    SubmissionParseError,
    SchedulerRejected,
    SyncConflict,
    SyncAborted,
    InvalidArgument,
    NotFound,
    Cancelled,
    Internal,
}

impl AppErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AppErrorKind::HostKeyMismatch => codes::HOST_KEY_MISMATCH,
            AppErrorKind::AuthenticationFailed => codes::AUTHENTICATION_FAILED,
            AppErrorKind::TransportError => codes::TRANSPORT_ERROR,
            AppErrorKind::CommandTimeout => codes::COMMAND_TIMEOUT,
            AppErrorKind::CredentialBackendUnavailable => codes::CREDENTIAL_BACKEND_UNAVAILABLE,
            AppErrorKind::SubmissionParseError => codes::SUBMISSION_PARSE_ERROR,
            AppErrorKind::SchedulerRejected => codes::SCHEDULER_REJECTED,
            AppErrorKind::SyncConflict => codes::SYNC_CONFLICT,
            AppErrorKind::SyncAborted => codes::SYNC_ABORTED,
            AppErrorKind::InvalidArgument => codes::INVALID_ARGUMENT,
            AppErrorKind::NotFound => codes::NOT_FOUND,
            AppErrorKind::Cancelled => codes::CANCELED,
            AppErrorKind::Internal => codes::INTERNAL_ERROR,
        }
    }

    /// Parses the stable name produced by [`AppErrorKind::as_str`].
    pub fn from_code(code: &str) -> Option<Self> {
        let kind = match code {
            codes::HOST_KEY_MISMATCH => AppErrorKind::HostKeyMismatch,
            codes::AUTHENTICATION_FAILED => AppErrorKind::AuthenticationFailed,
            codes::TRANSPORT_ERROR => AppErrorKind::TransportError,
            codes::COMMAND_TIMEOUT => AppErrorKind::CommandTimeout,
            codes::CREDENTIAL_BACKEND_UNAVAILABLE => AppErrorKind::CredentialBackendUnavailable,
            codes::SUBMISSION_PARSE_ERROR => AppErrorKind::SubmissionParseError,
            codes::SCHEDULER_REJECTED => AppErrorKind::SchedulerRejected,
            codes::SYNC_CONFLICT => AppErrorKind::SyncConflict,
            codes::SYNC_ABORTED => AppErrorKind::SyncAborted,
            codes::INVALID_ARGUMENT => AppErrorKind::InvalidArgument,
            codes::NOT_FOUND => AppErrorKind::NotFound,
            codes::CANCELED => AppErrorKind::Cancelled,
            codes::INTERNAL_ERROR => AppErrorKind::Internal,
            _ => return None,
        };
        Some(kind)
    }

    /// Transport failures are the only kind eligible for the single automatic reconnect.
    pub fn is_transient(self) -> bool {
        matches!(self, AppErrorKind::TransportError)
    }
}

impl fmt::Display for AppErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
    handle: Option<String>,
    sync: Option<Box<SyncProgress>>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
            handle: None,
            sync: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
            handle: None,
            sync: None,
        }
    }

    /// Shorthand for errors whose code is the kind's own code.
    pub fn of(kind: AppErrorKind, message: impl Into<String>) -> Self {
        Self::with_message(kind, kind.as_str(), message)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attaches the Job or SyncTask handle the error belongs to.
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_sync_progress(mut self, progress: SyncProgress) -> Self {
        self.handle = Some(progress.task.clone());
        self.sync = Some(Box::new(progress));
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub fn sync_progress(&self) -> Option<&SyncProgress> {
        self.sync.as_deref()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(handle) = &self.handle {
            write!(f, "[{handle}] ")?;
        }
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;
