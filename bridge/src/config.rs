// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::services::credentials::DEFAULT_CREDENTIAL_SYSTEM;
use crate::app::services::jobs::JobSettings;
use crate::app::services::scheduler::Scheduler;
use crate::app::types::{AuthMode, AuthSpec, SshConfig};

const APP_DIR_NAME: &str = "dayhoff";
const CONFIG_FILE_NAME: &str = "dayhoff.toml";
const CONFIG_ENV_VAR: &str = "DAYHOFF_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "bridge.sqlite";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_UNKNOWN_AFTER_FAILURES: u32 = 3;
const DEFAULT_GIVE_UP_AFTER_FAILURES: u32 = 100;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Ssh,
    Local,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Ssh => "ssh",
            TransportKind::Local => "local",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database_path: Option<String>,
    verbose: Option<bool>,
    poll_interval_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    unknown_after_failures: Option<u32>,
    give_up_after_failures: Option<u32>,
    #[serde(default)]
    hpc: FileHpcConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHpcConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    auth: Option<AuthMode>,
    identity_path: Option<String>,
    known_hosts: Option<String>,
    remote_root: Option<String>,
    credential_system: Option<String>,
    scheduler: Option<Scheduler>,
    transport: Option<TransportKind>,
    keepalive_secs: Option<u64>,
}

/// Connection profile for the configured cluster. `host` and `username` stay optional here;
/// commands that need a session fail with a clear message when they are missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpcConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub auth: AuthMode,
    pub identity_path: Option<PathBuf>,
    pub known_hosts: Option<PathBuf>,
    pub remote_root: Option<String>,
    pub credential_system: String,
    pub scheduler: Scheduler,
    pub transport: TransportKind,
    pub keepalive_secs: u64,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub verbose: bool,
    pub poll_interval_secs: u64,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub unknown_after_failures: u32,
    pub give_up_after_failures: u32,
    pub hpc: HpcConfig,
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            submit_timeout: self.command_timeout(),
            poll_timeout: self.command_timeout(),
            unknown_after_failures: self.unknown_after_failures,
            give_up_after_failures: self.give_up_after_failures,
        }
    }

    /// Builds the transport profile for the configured cluster.
    pub fn ssh_config(&self) -> Result<SshConfig> {
        let hpc = &self.hpc;
        let host = hpc
            .host
            .clone()
            .context("no HPC host configured; set [hpc] host in the config file or pass --host")?;
        let username = hpc.username.clone().context(
            "no HPC username configured; set [hpc] username in the config file or pass --user",
        )?;
        let auth = match hpc.auth {
            AuthMode::Key => AuthSpec {
                mode: AuthMode::Key,
                identity_path: hpc.identity_path.clone(),
            },
            AuthMode::Password => AuthSpec::password(),
        };
        Ok(SshConfig {
            host,
            port: hpc.port,
            username,
            auth,
            known_hosts_path: hpc.known_hosts.clone(),
            remote_root: hpc.remote_root.clone(),
            keepalive_secs: hpc.keepalive_secs,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub database_path: ConfigValue<PathBuf>,
    pub verbose: ConfigValue<bool>,
    pub poll_interval_secs: ConfigValue<u64>,
    pub command_timeout_secs: ConfigValue<u64>,
    pub connect_timeout_secs: ConfigValue<u64>,
    pub unknown_after_failures: ConfigValue<u32>,
    pub give_up_after_failures: ConfigValue<u32>,
    pub host: ConfigValue<Option<String>>,
    pub username: ConfigValue<Option<String>>,
    pub transport: ConfigValue<TransportKind>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

/// Command-line values; each one that is set wins over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub verbose: Option<bool>,
    pub poll_interval_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub unknown_after_failures: Option<u32>,
    pub give_up_after_failures: Option<u32>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub auth: Option<AuthMode>,
    pub identity_path: Option<PathBuf>,
    pub transport: Option<TransportKind>,
}

/// Picks the override when present, then the file value, then the default.
fn pick<T>(over: Option<T>, file: Option<T>, default: impl FnOnce() -> T) -> (T, ConfigSource) {
    match (over, file) {
        (Some(value), _) => (value, ConfigSource::Override),
        (None, Some(value)) => (value, ConfigSource::ConfigFile),
        (None, None) => (default(), ConfigSource::Default),
    }
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let (database_path, database_source) = match overrides.database_path {
        Some(path) => (expand_path(path), ConfigSource::Override),
        None => match file_config.database_path {
            Some(raw) => (resolve_path(&raw, base_dir), ConfigSource::ConfigFile),
            None => (
                default_database_path().with_context(|| {
                    "failed to resolve default database path; specify --database-path or set database_path in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let (verbose, verbose_source) = pick(overrides.verbose, file_config.verbose, || false);
    let (poll_interval_secs, poll_source) = pick(
        overrides.poll_interval_secs,
        file_config.poll_interval_secs,
        || DEFAULT_POLL_INTERVAL_SECS,
    );
    if poll_interval_secs == 0 {
        anyhow::bail!("poll_interval_secs must be at least 1");
    }
    let (command_timeout_secs, timeout_source) = pick(
        overrides.command_timeout_secs,
        file_config.command_timeout_secs,
        || DEFAULT_COMMAND_TIMEOUT_SECS,
    );
    if command_timeout_secs == 0 {
        anyhow::bail!("command_timeout_secs must be at least 1");
    }
    let (connect_timeout_secs, connect_timeout_source) = pick(
        overrides.connect_timeout_secs,
        file_config.connect_timeout_secs,
        || DEFAULT_CONNECT_TIMEOUT_SECS,
    );
    if connect_timeout_secs == 0 {
        anyhow::bail!("connect_timeout_secs must be at least 1");
    }
    let (unknown_after_failures, unknown_source) = pick(
        overrides.unknown_after_failures,
        file_config.unknown_after_failures,
        || DEFAULT_UNKNOWN_AFTER_FAILURES,
    );
    let (give_up_after_failures, give_up_source) = pick(
        overrides.give_up_after_failures,
        file_config.give_up_after_failures,
        || DEFAULT_GIVE_UP_AFTER_FAILURES,
    );
    if give_up_after_failures <= unknown_after_failures {
        anyhow::bail!(
            "give_up_after_failures ({give_up_after_failures}) must be above unknown_after_failures ({unknown_after_failures})"
        );
    }

    let file_hpc = file_config.hpc;
    let (host, host_source) = pick(overrides.host.map(Some), file_hpc.host.map(Some), || None);
    let (username, username_source) = pick(
        overrides.username.map(Some),
        file_hpc.username.map(Some),
        || None,
    );
    let (transport, transport_source) =
        pick(overrides.transport, file_hpc.transport, TransportKind::default);
    let port = overrides
        .port
        .or(file_hpc.port)
        .unwrap_or(DEFAULT_SSH_PORT);
    if port == 0 {
        anyhow::bail!("port must be between 1 and 65535");
    }
    let identity_path = match overrides.identity_path {
        Some(path) => Some(expand_path(path)),
        None => file_hpc
            .identity_path
            .as_deref()
            .map(|raw| resolve_path(raw, base_dir)),
    };
    let hpc = HpcConfig {
        host,
        port,
        username,
        auth: overrides.auth.or(file_hpc.auth).unwrap_or(AuthMode::Key),
        identity_path,
        known_hosts: file_hpc
            .known_hosts
            .as_deref()
            .map(|raw| resolve_path(raw, base_dir)),
        remote_root: file_hpc.remote_root.filter(|root| !root.trim().is_empty()),
        credential_system: file_hpc
            .credential_system
            .unwrap_or_else(|| DEFAULT_CREDENTIAL_SYSTEM.to_string()),
        scheduler: file_hpc.scheduler.unwrap_or_default(),
        transport,
        keepalive_secs: file_hpc.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS),
    };

    let config = Config {
        database_path,
        verbose,
        poll_interval_secs,
        command_timeout_secs,
        connect_timeout_secs,
        unknown_after_failures,
        give_up_after_failures,
        hpc,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        database_path: ConfigValue {
            value: config.database_path.clone(),
            source: database_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
        poll_interval_secs: ConfigValue {
            value: config.poll_interval_secs,
            source: poll_source,
        },
        command_timeout_secs: ConfigValue {
            value: config.command_timeout_secs,
            source: timeout_source,
        },
        connect_timeout_secs: ConfigValue {
            value: config.connect_timeout_secs,
            source: connect_timeout_source,
        },
        unknown_after_failures: ConfigValue {
            value: config.unknown_after_failures,
            source: unknown_source,
        },
        give_up_after_failures: ConfigValue {
            value: config.give_up_after_failures,
            source: give_up_source,
        },
        host: ConfigValue {
            value: config.hpc.host.clone(),
            source: host_source,
        },
        username: ConfigValue {
            value: config.hpc.username.clone(),
            source: username_source,
        },
        transport: ConfigValue {
            value: config.hpc.transport,
            source: transport_source,
        },
    };

    Ok(LoadResult { config, report })
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let path = PathBuf::from(shellexpand::tilde(raw).as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) if value.is_empty() => anyhow::bail!("{CONFIG_ENV_VAR} is set but empty"),
        Some(value) => Ok(Some(PathBuf::from(value))),
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME).join(DATABASE_FILE_NAME))
}
