// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Scheduler adapters: how to phrase submit, status, and cancel commands for a given batch
//! system, and how to read its answers. The job manager only talks to [`Scheduler`].

mod pbs;
pub mod resources;
mod slurm;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::app::errors::{AppError, AppErrorKind, AppResult};
use crate::app::types::{ExecCapture, JobState, QueueInfo, QueueScope, ResourceRequest};
use resources::parse_resources;

pub(crate) const SCRIPT_DELIMITER: &str = "DAYHOFF_EOF";

/// One scheduler answer about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub state: JobState,
    /// State string as the scheduler spelled it, normalized.
    pub raw: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    #[default]
    Slurm,
    Pbs,
}

impl Scheduler {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheduler::Slurm => "slurm",
            Scheduler::Pbs => "pbs",
        }
    }

    /// Validates the resource request and builds the submission command. Runs before any Job
    /// exists, so a bad request never reaches the registry.
    pub fn submit_command(
        self,
        command: &str,
        resources: &ResourceRequest,
        workdir: Option<&str>,
    ) -> AppResult<String> {
        if command.trim().is_empty() {
            return Err(AppError::of(
                AppErrorKind::InvalidArgument,
                "cannot submit an empty command",
            ));
        }
        let spec = parse_resources(resources)?;
        match self {
            Scheduler::Slurm => slurm::submit_command(command, &spec, workdir),
            Scheduler::Pbs => pbs::submit_command(command, &spec, workdir),
        }
    }

    pub fn parse_submit_output(self, stdout: &str) -> Option<String> {
        match self {
            Scheduler::Slurm => slurm::parse_job_id(stdout),
            Scheduler::Pbs => pbs::parse_job_id(stdout),
        }
    }

    /// Whether one status query can cover many jobs.
    pub fn supports_batch_status(self) -> bool {
        match self {
            Scheduler::Slurm | Scheduler::Pbs => true,
        }
    }

    pub fn status_command(self, ids: &[&str]) -> String {
        match self {
            Scheduler::Slurm => slurm::status_command(ids),
            Scheduler::Pbs => pbs::status_command(ids),
        }
    }

    /// Jobs the status query still lists. A requested id absent from the map is "missing" and
    /// goes to the terminal lookup. `Err` means the query itself produced no usable answer.
    pub fn parse_status(
        self,
        capture: &ExecCapture,
        requested: &[&str],
    ) -> AppResult<HashMap<String, Observation>> {
        match self {
            Scheduler::Slurm => slurm::parse_status(capture),
            Scheduler::Pbs => pbs::parse_status(capture, requested),
        }
    }

    pub fn terminal_query_command(self, id: &str) -> String {
        match self {
            Scheduler::Slurm => slurm::terminal_query_command(id),
            Scheduler::Pbs => pbs::terminal_query_command(id),
        }
    }

    pub fn parse_terminal(self, capture: &ExecCapture) -> Option<Observation> {
        match self {
            Scheduler::Slurm => slurm::parse_terminal(capture),
            Scheduler::Pbs => pbs::parse_terminal(capture),
        }
    }

    pub fn cancel_command(self, id: &str) -> String {
        match self {
            Scheduler::Slurm => slurm::cancel_command(id),
            Scheduler::Pbs => pbs::cancel_command(id),
        }
    }

    /// Wraps a command so it runs on a compute allocation instead of the login node.
    pub fn interactive_command(self, command: &str) -> AppResult<String> {
        match self {
            Scheduler::Slurm => Ok(slurm::interactive_command(command)),
            Scheduler::Pbs => Err(unsupported(self, "interactive execution")),
        }
    }

    pub fn queue_command(self, scope: &QueueScope) -> AppResult<String> {
        match self {
            Scheduler::Slurm => Ok(slurm::queue_command(scope)),
            Scheduler::Pbs => Err(unsupported(self, "queue listing")),
        }
    }

    pub fn parse_queue(self, stdout: &str, with_waiting: bool) -> AppResult<QueueInfo> {
        match self {
            Scheduler::Slurm => {
                let (entries, now) = slurm::parse_queue(stdout);
                let waiting = with_waiting.then(|| slurm::waiting_summary(&entries, now));
                Ok(QueueInfo { entries, waiting })
            }
            Scheduler::Pbs => Err(unsupported(self, "queue listing")),
        }
    }
}

fn unsupported(scheduler: Scheduler, what: &str) -> AppError {
    AppError::of(
        AppErrorKind::InvalidArgument,
        format!("{what} is not supported for {scheduler}"),
    )
}

/// Feeds a script to the submit command on stdin.
pub(crate) fn script_heredoc(script: &str) -> AppResult<String> {
    if script.lines().any(|line| line.trim() == SCRIPT_DELIMITER) {
        return Err(AppError::of(
            AppErrorKind::InvalidArgument,
            format!("script must not contain a line reading {SCRIPT_DELIMITER}"),
        ));
    }
    let body = script.strip_suffix('\n').unwrap_or(script);
    Ok(format!("<<'{SCRIPT_DELIMITER}'\n{body}\n{SCRIPT_DELIMITER}"))
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheduler {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slurm" => Ok(Scheduler::Slurm),
            "pbs" | "pbspro" | "torque" => Ok(Scheduler::Pbs),
            other => Err(AppError::of(
                AppErrorKind::InvalidArgument,
                format!("unknown scheduler '{other}' (expected slurm or pbs)"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheduler_names() {
        assert_eq!("SLURM".parse::<Scheduler>().unwrap(), Scheduler::Slurm);
        assert_eq!("torque".parse::<Scheduler>().unwrap(), Scheduler::Pbs);
        assert!("lsf".parse::<Scheduler>().is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = Scheduler::Slurm
            .submit_command("  ", &ResourceRequest::new(), None)
            .unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::InvalidArgument);
    }

    #[test]
    fn pbs_has_no_queue_listing() {
        let err = Scheduler::Pbs.queue_command(&QueueScope::User).unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::InvalidArgument);
    }

    #[test]
    fn heredoc_keeps_script_body() {
        assert_eq!(
            script_heredoc("#!/bin/sh\necho hi\n").unwrap(),
            "<<'DAYHOFF_EOF'\n#!/bin/sh\necho hi\nDAYHOFF_EOF"
        );
    }
}
