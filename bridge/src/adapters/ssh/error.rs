// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
#[error("authentication_failure")]
pub struct AuthenticationFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyProblem {
    /// No known_hosts entry for the host.
    Unknown,
    /// An entry exists for the host with a different key.
    Changed { line: usize },
}

#[derive(Debug, ThisError)]
#[error("host key for {host}:{port} rejected ({problem:?})")]
pub struct HostKeyRejected {
    pub host: String,
    pub port: u16,
    pub problem: HostKeyProblem,
}
