// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use time::PrimitiveDateTime;
use time::macros::format_description;

use super::resources::{ResourceSpec, format_slurm_time};
use super::{Observation, script_heredoc};
use crate::app::errors::{AppError, AppErrorKind, AppResult};
use crate::app::services::shell::sh_escape;
use crate::app::types::{ExecCapture, JobState, QueueEntry, QueueScope, WaitingSummary};

const QUEUE_FORMAT: &str = "%i|%P|%j|%u|%T|%M|%D|%R|%V";
const NOW_MARKER: &str = "NOW|";

pub(super) fn submit_command(command: &str, spec: &ResourceSpec, workdir: Option<&str>) -> AppResult<String> {
    let mut parts = vec!["sbatch".to_string()];
    if let Some(dir) = workdir {
        parts.push(format!("--chdir={}", sh_escape(dir)));
    }
    if let Some(secs) = spec.time_secs {
        parts.push(format!("--time={}", format_slurm_time(secs)));
    }
    if let Some(nodes) = spec.nodes {
        parts.push(format!("--nodes={nodes}"));
    }
    if let Some(cores) = spec.cores {
        parts.push(format!("--cpus-per-task={cores}"));
    }
    if let Some(mem) = spec.memory {
        parts.push(format!("--mem={}{}", mem.amount, mem.unit.slurm_suffix()));
    }
    if let Some(partition) = &spec.partition {
        parts.push(format!("--partition={}", sh_escape(partition)));
    }
    for (key, value) in &spec.passthrough {
        let flag = if key.starts_with('-') {
            key.clone()
        } else {
            format!("--{key}")
        };
        if value.eq_ignore_ascii_case("true") || value.is_empty() {
            parts.push(flag);
        } else {
            parts.push(format!("{flag}={}", sh_escape(value)));
        }
    }

    if command.starts_with("#!") {
        Ok(format!("{} {}", parts.join(" "), script_heredoc(command)?))
    } else {
        parts.push(format!("--wrap={}", sh_escape(command)));
        Ok(parts.join(" "))
    }
}

/// Extracts the job id from sbatch output such as "Submitted batch job 11" or
/// "Submitted batch job 11 on cluster c1".
pub(super) fn parse_job_id(stdout: &str) -> Option<String> {
    let marker = "Submitted batch job ";
    stdout.lines().find_map(|line| {
        let idx = line.find(marker)?;
        let id = line[idx + marker.len()..].split_whitespace().next()?;
        id.chars().all(|c| c.is_ascii_digit()).then(|| id.to_string())
    })
}

pub(super) fn status_command(ids: &[&str]) -> String {
    format!("squeue -h -o '%i|%T' -j {}", ids.join(","))
}

pub(super) fn parse_status(capture: &ExecCapture) -> AppResult<HashMap<String, Observation>> {
    if !capture.success() {
        let stderr = capture.stderr_text();
        // squeue refuses a lone id it no longer knows; that is a "missing" answer, not a failure.
        if stderr.contains("Invalid job id") {
            return Ok(HashMap::new());
        }
        return Err(AppError::of(
            AppErrorKind::SchedulerRejected,
            format!("squeue exited with status {}", capture.exit_code),
        )
        .with_context(stderr.trim().to_string()));
    }
    let mut observed = HashMap::new();
    for line in capture.stdout_text().lines() {
        let Some((id, state)) = line.trim().split_once('|') else {
            continue;
        };
        let normalized = normalize_slurm_state(state);
        observed.insert(
            id.trim().to_string(),
            Observation {
                state: map_slurm_state(&normalized),
                raw: normalized,
                exit_code: None,
            },
        );
    }
    Ok(observed)
}

pub(super) fn terminal_query_command(id: &str) -> String {
    format!("sacct -j {id} -n -P -X -o State,ExitCode")
}

pub(super) fn parse_terminal(capture: &ExecCapture) -> Option<Observation> {
    if !capture.success() {
        return None;
    }
    let stdout = capture.stdout_text();
    let rows = parse_sacct_rows(&stdout);
    let state = sacct_overall_state(&rows)?;
    let exit_code = rows
        .iter()
        .find(|(s, _)| normalize_slurm_state(s) == state)
        .and_then(|(_, code)| code.as_deref().and_then(parse_exit_code));
    Some(Observation {
        state: map_slurm_state(&state),
        raw: state,
        exit_code,
    })
}

pub(super) fn cancel_command(id: &str) -> String {
    format!("scancel {id}")
}

pub(super) fn interactive_command(command: &str) -> String {
    format!("srun --pty sh -c {}", sh_escape(command))
}

pub(super) fn queue_command(scope: &QueueScope) -> String {
    let filter = match scope {
        QueueScope::User => " -u \"$USER\"".to_string(),
        QueueScope::All => String::new(),
        QueueScope::Job(id) => format!(" -j {}", sh_escape(id)),
    };
    format!(
        "squeue -h{filter} -o '{QUEUE_FORMAT}' && date '+{NOW_MARKER}%Y-%m-%dT%H:%M:%S'"
    )
}

pub(super) fn parse_queue(stdout: &str) -> (Vec<QueueEntry>, Option<PrimitiveDateTime>) {
    let mut entries = Vec::new();
    let mut now = None;
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(stamp) = line.strip_prefix(NOW_MARKER) {
            now = parse_slurm_timestamp(stamp);
            continue;
        }
        let cols: Vec<&str> = line.split('|').collect();
        if cols.len() < 9 {
            continue;
        }
        entries.push(QueueEntry {
            job_id: cols[0].to_string(),
            partition: cols[1].to_string(),
            name: cols[2].to_string(),
            user: cols[3].to_string(),
            state: cols[4].to_string(),
            time_used: cols[5].to_string(),
            nodes: cols[6].to_string(),
            reason: cols[7].to_string(),
            submit_time: Some(cols[8].to_string()).filter(|s| !s.is_empty() && s != "N/A"),
        });
    }
    (entries, now)
}

/// Pending-job wait statistics relative to the cluster's own clock.
pub(super) fn waiting_summary(entries: &[QueueEntry], now: Option<PrimitiveDateTime>) -> WaitingSummary {
    let pending: Vec<&QueueEntry> = entries
        .iter()
        .filter(|e| normalize_slurm_state(&e.state) == "PENDING")
        .collect();
    let waits: Vec<u64> = match now {
        Some(now) => pending
            .iter()
            .filter_map(|e| e.submit_time.as_deref().and_then(parse_slurm_timestamp))
            .map(|submitted| (now - submitted).whole_seconds().max(0) as u64)
            .collect(),
        None => Vec::new(),
    };
    WaitingSummary {
        pending_count: pending.len(),
        min_wait_secs: waits.iter().copied().min(),
        avg_wait_secs: (!waits.is_empty()).then(|| waits.iter().sum::<u64>() / waits.len() as u64),
        max_wait_secs: waits.iter().copied().max(),
    }
}

fn parse_slurm_timestamp(value: &str) -> Option<PrimitiveDateTime> {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    PrimitiveDateTime::parse(value.trim(), format).ok()
}

fn parse_sacct_rows(output: &str) -> Vec<(String, Option<String>)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let mut cols = line.split('|');
            let state = cols.next()?.trim();
            if state.is_empty() {
                return None;
            }
            Some((state.to_string(), cols.next().map(|c| c.trim().to_string())))
        })
        .collect()
}

/// Overall state across sacct rows: any active row keeps the job active, all COMPLETED means
/// COMPLETED, otherwise the first non-COMPLETED terminal state wins.
fn sacct_overall_state(rows: &[(String, Option<String>)]) -> Option<String> {
    if rows.is_empty() {
        return None;
    }
    let normalized: Vec<String> = rows.iter().map(|(s, _)| normalize_slurm_state(s)).collect();
    if let Some(active) = normalized
        .iter()
        .find(|s| is_slurm_state_active(s) || !is_slurm_state_terminal(s))
    {
        return Some(active.clone());
    }
    if normalized.iter().all(|s| s == "COMPLETED") {
        return Some("COMPLETED".to_string());
    }
    normalized.into_iter().find(|s| s != "COMPLETED")
}

/// "2:0" is exit code 2; "0:9" is a job killed by signal 9.
fn parse_exit_code(raw: &str) -> Option<i32> {
    let (code, signal) = raw.split_once(':').unwrap_or((raw, "0"));
    let code: i32 = code.trim().parse().ok()?;
    let signal: i32 = signal.trim().parse().unwrap_or(0);
    if code == 0 && signal != 0 {
        Some(128 + signal)
    } else {
        Some(code)
    }
}

fn normalize_slurm_state(state: &str) -> String {
    let token = state
        .split(['+', ':', '(', ' '])
        .next()
        .unwrap_or(state)
        .trim();
    token.to_ascii_uppercase()
}

fn is_slurm_state_active(state: &str) -> bool {
    matches!(
        state,
        "PENDING"
            | "RUNNING"
            | "CONFIGURING"
            | "COMPLETING"
            | "SUSPENDED"
            | "RESIZING"
            | "REQUEUED"
            | "REQUEUE_HOLD"
            | "REQUEUE_FED"
            | "STAGE_OUT"
            | "STAGE_IN"
            | "SIGNALING"
            | "STOPPED"
    )
}

fn is_slurm_state_terminal(state: &str) -> bool {
    matches!(
        state,
        "COMPLETED"
            | "CANCELLED"
            | "FAILED"
            | "TIMEOUT"
            | "NODE_FAIL"
            | "PREEMPTED"
            | "BOOT_FAIL"
            | "OUT_OF_MEMORY"
            | "DEADLINE"
            | "SPECIAL_EXIT"
            | "REVOKED"
    )
}

fn map_slurm_state(state: &str) -> JobState {
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" => {
            JobState::Queued
        }
        "COMPLETED" => JobState::Completed,
        "CANCELLED" => JobState::Cancelled,
        s if is_slurm_state_active(s) => JobState::Running,
        s if is_slurm_state_terminal(s) => JobState::Failed,
        _ => JobState::Unknown,
    }
}
