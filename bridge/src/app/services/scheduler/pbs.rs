// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use super::resources::{ResourceSpec, format_walltime};
use super::{Observation, script_heredoc};
use crate::app::errors::{AppError, AppErrorKind, AppResult};
use crate::app::services::shell::sh_escape;
use crate::app::types::{ExecCapture, JobState};

/// Exit status PBS reports for jobs killed by `qdel` (256 + SIGTERM) or SIGKILL.
const PBS_KILLED_STATUSES: [i32; 2] = [271, 265];

pub(super) fn submit_command(command: &str, spec: &ResourceSpec, workdir: Option<&str>) -> AppResult<String> {
    let mut parts = vec!["qsub".to_string()];
    if let Some(secs) = spec.time_secs {
        parts.push(format!("-l walltime={}", format_walltime(secs)));
    }
    if spec.nodes.is_some() || spec.cores.is_some() || spec.memory.is_some() {
        let mut select = format!("select={}", spec.nodes.unwrap_or(1));
        if let Some(cores) = spec.cores {
            select.push_str(&format!(":ncpus={cores}"));
        }
        if let Some(mem) = spec.memory {
            select.push_str(&format!(":mem={}{}", mem.amount, mem.unit.pbs_suffix()));
        }
        parts.push(format!("-l {select}"));
    }
    if let Some(queue) = &spec.partition {
        parts.push(format!("-q {}", sh_escape(queue)));
    }
    for (key, value) in &spec.passthrough {
        if key.starts_with('-') {
            if value.eq_ignore_ascii_case("true") || value.is_empty() {
                parts.push(key.clone());
            } else {
                parts.push(format!("{key} {}", sh_escape(value)));
            }
        } else {
            parts.push(format!("-l {}", sh_escape(&format!("{key}={value}"))));
        }
    }

    // qsub has no portable chdir flag; the script changes directory itself.
    let cd_line = workdir.map(|dir| format!("cd {} || exit 1\n", sh_escape(dir)));
    let script = match command.split_once('\n') {
        Some((shebang, body)) if command.starts_with("#!") => {
            format!("{shebang}\n{}{body}", cd_line.unwrap_or_default())
        }
        _ if command.starts_with("#!") => command.to_string(),
        _ => format!("#!/bin/sh\n{}{command}\n", cd_line.unwrap_or_default()),
    };
    Ok(format!("{} {}", parts.join(" "), script_heredoc(&script)?))
}

/// qsub prints the new job id, e.g. "1234.pbs01", on a line of its own.
pub(super) fn parse_job_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .filter(|line| is_pbs_job_id(line))
        .map(str::to_string)
}

fn is_pbs_job_id(value: &str) -> bool {
    let (num, server) = value.split_once('.').unwrap_or((value, ""));
    let num = num.trim_end_matches("[]");
    !num.is_empty()
        && num.chars().all(|c| c.is_ascii_digit())
        && server
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

fn numeric_part(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

pub(super) fn status_command(ids: &[&str]) -> String {
    format!("qstat {}", ids.join(" "))
}

pub(super) fn parse_status(
    capture: &ExecCapture,
    requested: &[&str],
) -> AppResult<HashMap<String, Observation>> {
    let stdout = capture.stdout_text();
    let stderr = capture.stderr_text();
    if !capture.success() && stdout.trim().is_empty() && !stderr.contains("Unknown Job Id") {
        return Err(AppError::of(
            AppErrorKind::SchedulerRejected,
            format!("qstat exited with status {}", capture.exit_code),
        )
        .with_context(stderr.trim().to_string()));
    }

    let by_number: HashMap<&str, &str> = requested
        .iter()
        .map(|id| (numeric_part(id), *id))
        .collect();
    let mut observed = HashMap::new();
    let mut in_table = false;
    for line in stdout.lines() {
        if line.starts_with("---") {
            in_table = true;
            continue;
        }
        if !in_table {
            continue;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 6 {
            continue;
        }
        // Long ids are truncated by qstat, so match on the numeric part.
        let Some(requested_id) = by_number.get(numeric_part(cols[0].trim_end_matches('*'))) else {
            continue;
        };
        let raw = cols[4].to_ascii_uppercase();
        let state = match raw.as_str() {
            "Q" | "H" | "W" | "T" => JobState::Queued,
            "R" | "E" | "B" | "S" | "U" => JobState::Running,
            // Finished rows are settled by the terminal query, which has the exit status.
            _ => continue,
        };
        observed.insert(
            requested_id.to_string(),
            Observation {
                state,
                raw,
                exit_code: None,
            },
        );
    }
    Ok(observed)
}

pub(super) fn terminal_query_command(id: &str) -> String {
    format!("qstat -x -f {id}")
}

pub(super) fn parse_terminal(capture: &ExecCapture) -> Option<Observation> {
    if !capture.success() {
        return None;
    }
    let stdout = capture.stdout_text();
    let mut job_state = None;
    let mut exit_status = None;
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "job_state" => job_state = Some(value.trim().to_ascii_uppercase()),
            "Exit_status" => exit_status = value.trim().parse::<i32>().ok(),
            _ => {}
        }
    }
    let raw = job_state?;
    let state = match raw.as_str() {
        "Q" | "H" | "W" | "T" => JobState::Queued,
        "R" | "E" | "B" | "S" | "U" => JobState::Running,
        "F" | "X" | "C" => match exit_status {
            Some(0) => JobState::Completed,
            Some(code) if PBS_KILLED_STATUSES.contains(&code) => JobState::Cancelled,
            Some(_) => JobState::Failed,
            None => JobState::Cancelled,
        },
        _ => JobState::Unknown,
    };
    Some(Observation {
        state,
        raw,
        exit_code: exit_status,
    })
}

pub(super) fn cancel_command(id: &str) -> String {
    format!("qdel {id}")
}
