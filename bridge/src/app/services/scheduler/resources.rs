// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Validation of the resource keys the bridge understands. Everything else is carried through
//! untouched for the scheduler to judge.

use crate::app::errors::{AppError, AppErrorKind, AppResult};
use crate::app::types::ResourceRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUnit {
    K,
    M,
    G,
    T,
}

impl MemoryUnit {
    pub fn slurm_suffix(self) -> &'static str {
        match self {
            MemoryUnit::K => "K",
            MemoryUnit::M => "M",
            MemoryUnit::G => "G",
            MemoryUnit::T => "T",
        }
    }

    pub fn pbs_suffix(self) -> &'static str {
        match self {
            MemoryUnit::K => "kb",
            MemoryUnit::M => "mb",
            MemoryUnit::G => "gb",
            MemoryUnit::T => "tb",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory {
    pub amount: u64,
    pub unit: MemoryUnit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSpec {
    pub time_secs: Option<u64>,
    pub nodes: Option<u32>,
    pub cores: Option<u32>,
    pub memory: Option<Memory>,
    pub partition: Option<String>,
    /// Unrecognized keys, in key order.
    pub passthrough: Vec<(String, String)>,
}

fn invalid(key: &str, value: &str, expected: &str) -> AppError {
    AppError::of(
        AppErrorKind::InvalidArgument,
        format!("invalid value {value:?} for resource '{key}': expected {expected}"),
    )
}

pub fn parse_resources(request: &ResourceRequest) -> AppResult<ResourceSpec> {
    let mut spec = ResourceSpec::default();
    for (raw_key, raw_value) in request {
        let key = raw_key.trim();
        let value = raw_value.trim();
        match key.to_ascii_lowercase().as_str() {
            "time" | "walltime" => {
                spec.time_secs =
                    Some(parse_time(value).ok_or_else(|| {
                        invalid(key, value, "minutes or [D-]HH:MM:SS")
                    })?);
            }
            "nodes" => spec.nodes = Some(parse_positive(key, value)?),
            "cores" | "cpus" => spec.cores = Some(parse_positive(key, value)?),
            "memory" | "mem" => {
                spec.memory = Some(
                    parse_memory(value)
                        .ok_or_else(|| invalid(key, value, "an integer with optional K/M/G/T"))?,
                );
            }
            "partition" | "queue" => {
                if value.is_empty() || value.chars().any(char::is_whitespace) {
                    return Err(invalid(key, value, "a name without whitespace"));
                }
                if let Some(existing) = &spec.partition
                    && existing != value
                {
                    return Err(AppError::of(
                        AppErrorKind::InvalidArgument,
                        format!("conflicting partition/queue values {existing:?} and {value:?}"),
                    ));
                }
                spec.partition = Some(value.to_string());
            }
            _ => {
                validate_passthrough_key(key)?;
                spec.passthrough.push((key.to_string(), value.to_string()));
            }
        }
    }
    Ok(spec)
}

fn parse_positive(key: &str, value: &str) -> AppResult<u32> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(key, value, "a positive integer")),
    }
}

fn validate_passthrough_key(key: &str) -> AppResult<()> {
    let body = key.trim_start_matches('-');
    let ok = !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(AppError::of(
            AppErrorKind::InvalidArgument,
            format!("resource key {key:?} contains unsupported characters"),
        ))
    }
}

/// Minutes, `HH:MM:SS`, or `D-HH:MM:SS`.
pub fn parse_time(value: &str) -> Option<u64> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        let minutes: u64 = value.parse().ok()?;
        return (minutes > 0).then(|| minutes.saturating_mul(60));
    }
    let secs = parse_slurm_duration(value)?;
    (secs > 0).then_some(secs)
}

/// Parses SLURM durations like "D-HH:MM:SS" or "HH:MM:SS" into seconds.
pub fn parse_slurm_duration(s: &str) -> Option<u64> {
    let s = s.trim();
    let (days, hms) = match s.split_once('-') {
        Some((d, rest)) => (d.parse::<u64>().ok()?, rest),
        None => (0, s),
    };

    let mut it = hms.split(':');
    let (h, m, sec) = (it.next()?, it.next()?, it.next()?);
    if it.next().is_some() {
        return None;
    }
    let (h, m, sec): (u64, u64, u64) = (h.parse().ok()?, m.parse().ok()?, sec.parse().ok()?);
    if m >= 60 || sec >= 60 {
        return None;
    }
    Some(
        days.saturating_mul(24 * 3600)
            .saturating_add(h * 3600)
            .saturating_add(m * 60)
            .saturating_add(sec),
    )
}

pub fn parse_memory(value: &str) -> Option<Memory> {
    let upper = value.to_ascii_uppercase();
    let trimmed = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, unit) = match trimmed.chars().last()? {
        'K' => (&trimmed[..trimmed.len() - 1], MemoryUnit::K),
        'M' => (&trimmed[..trimmed.len() - 1], MemoryUnit::M),
        'G' => (&trimmed[..trimmed.len() - 1], MemoryUnit::G),
        'T' => (&trimmed[..trimmed.len() - 1], MemoryUnit::T),
        c if c.is_ascii_digit() && trimmed.len() == upper.len() => (trimmed, MemoryUnit::M),
        _ => return None,
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    (amount > 0).then_some(Memory { amount, unit })
}

pub fn format_slurm_time(secs: u64) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    if days > 0 {
        format!("{days}-{h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}:{s:02}")
    }
}

pub fn format_walltime(secs: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pairs: &[(&str, &str)]) -> ResourceRequest {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_understood_keys() {
        let spec = parse_resources(&request(&[
            ("time", "1-02:00:00"),
            ("nodes", "2"),
            ("cores", "16"),
            ("memory", "32G"),
            ("partition", "short"),
            ("gres", "gpu:1"),
        ]))
        .unwrap();
        assert_eq!(spec.time_secs, Some(26 * 3600));
        assert_eq!(spec.nodes, Some(2));
        assert_eq!(spec.cores, Some(16));
        assert_eq!(
            spec.memory,
            Some(Memory {
                amount: 32,
                unit: MemoryUnit::G
            })
        );
        assert_eq!(spec.partition.as_deref(), Some("short"));
        assert_eq!(spec.passthrough, vec![("gres".into(), "gpu:1".into())]);
    }

    #[test]
    fn time_accepts_minutes() {
        assert_eq!(parse_time("90"), Some(5400));
        assert_eq!(parse_time("00:30:00"), Some(1800));
        assert_eq!(parse_time("0"), None);
        assert_eq!(parse_time("1:99:00"), None);
        assert_eq!(parse_time("soon"), None);
    }

    #[test]
    fn memory_units() {
        assert_eq!(
            parse_memory("512"),
            Some(Memory {
                amount: 512,
                unit: MemoryUnit::M
            })
        );
        assert_eq!(
            parse_memory("4gb"),
            Some(Memory {
                amount: 4,
                unit: MemoryUnit::G
            })
        );
        assert_eq!(parse_memory("G"), None);
        assert_eq!(parse_memory("4X"), None);
        assert_eq!(parse_memory("0G"), None);
    }

    #[test]
    fn rejects_bad_values() {
        for (key, value) in [
            ("nodes", "0"),
            ("cores", "-2"),
            ("memory", "lots"),
            ("partition", "two words"),
            ("time", "forever"),
        ] {
            let err = parse_resources(&request(&[(key, value)])).unwrap_err();
            assert_eq!(err.kind(), AppErrorKind::InvalidArgument, "{key}={value}");
        }
    }

    #[test]
    fn rejects_conflicting_partition_and_queue() {
        let err =
            parse_resources(&request(&[("partition", "a"), ("queue", "b")])).unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::InvalidArgument);
        assert!(parse_resources(&request(&[("partition", "a"), ("queue", "a")])).is_ok());
    }

    #[test]
    fn rejects_shell_metacharacters_in_passthrough_keys() {
        let err = parse_resources(&request(&[("x;rm -rf", "1")])).unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::InvalidArgument);
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_slurm_time(5400), "01:30:00");
        assert_eq!(format_slurm_time(26 * 3600 + 61), "1-02:01:01");
        assert_eq!(format_walltime(26 * 3600), "26:00:00");
    }
}
