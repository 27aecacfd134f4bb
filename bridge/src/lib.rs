// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Dayhoff HPC bridge: credential lookup, SSH sessions, batch job tracking and file sync
//! between a workstation and a cluster login node.

pub mod adapters;
pub mod app;
pub mod config;
pub mod logging;
