// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod credentials;
pub mod file_sync;
pub mod jobs;
pub mod poller;
pub mod random;
pub mod scheduler;
pub mod sessions;
pub mod shell;
pub mod walk;

#[cfg(test)]
pub(crate) mod testing;
