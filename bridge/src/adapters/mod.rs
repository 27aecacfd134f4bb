// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod cli;
pub mod db;
pub mod keyring;
pub mod local;
pub mod ssh;
pub mod time;
