// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use dayhoff_bridge::adapters;
use dayhoff_bridge::adapters::cli::commands::{Bridge, dispatch, error_to_json};
use dayhoff_bridge::app::ports::TransportConnector;
use dayhoff_bridge::app::services::credentials::CredentialStore;
use dayhoff_bridge::app::services::file_sync::FileSyncEngine;
use dayhoff_bridge::app::services::jobs::JobManager;
use dayhoff_bridge::app::services::sessions::SessionManager;
use dayhoff_bridge::config::{self, TransportKind};
use dayhoff_bridge::logging;

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => tracing::debug!(
            path = %path.display(),
            source = source.as_str(),
            present = report.config_file_present,
            "config path"
        ),
        (Some(path), None) => tracing::debug!(
            path = %path.display(),
            present = report.config_file_present,
            "config path"
        ),
        (None, _) => tracing::debug!("config path: (none)"),
    }
    tracing::debug!(
        value = %report.database_path.value.display(),
        source = report.database_path.source.as_str(),
        "config database_path"
    );
    tracing::debug!(
        value = report.poll_interval_secs.value,
        source = report.poll_interval_secs.source.as_str(),
        "config poll_interval_secs"
    );
    tracing::debug!(
        value = report.command_timeout_secs.value,
        source = report.command_timeout_secs.source.as_str(),
        "config command_timeout_secs"
    );
    tracing::debug!(
        value = report.connect_timeout_secs.value,
        source = report.connect_timeout_secs.source.as_str(),
        "config connect_timeout_secs"
    );
    tracing::debug!(
        unknown_after = report.unknown_after_failures.value,
        unknown_after_source = report.unknown_after_failures.source.as_str(),
        give_up_after = report.give_up_after_failures.value,
        give_up_after_source = report.give_up_after_failures.source.as_str(),
        "config poll failure thresholds"
    );
    tracing::debug!(
        host = report.host.value.as_deref().unwrap_or("(unset)"),
        host_source = report.host.source.as_str(),
        user = report.username.value.as_deref().unwrap_or("(unset)"),
        user_source = report.username.source.as_str(),
        transport = report.transport.value.as_str(),
        transport_source = report.transport.source.as_str(),
        "config hpc"
    );
    tracing::debug!(
        value = report.verbose.value,
        source = report.verbose.source.as_str(),
        "config verbose"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            database_path: opts.database_path,
            verbose: parsed.verbose_override,
            poll_interval_secs: opts.poll_interval_secs,
            command_timeout_secs: opts.command_timeout_secs,
            connect_timeout_secs: opts.connect_timeout_secs,
            unknown_after_failures: opts.unknown_after_failures,
            give_up_after_failures: opts.give_up_after_failures,
            host: opts.host,
            port: opts.port,
            username: opts.username,
            auth: opts.auth,
            identity_path: opts.identity_path,
            transport: opts.transport,
        },
    )?;
    logging::init(config.verbose);
    log_config_report(&report);
    config::ensure_database_dir(&config.database_path)?;

    let db = adapters::db::JobStore::open(&config.database_path).await?;
    let store = Arc::new(adapters::db::SqliteJobStore::new(db));
    let credentials = Arc::new(CredentialStore::new(
        Arc::new(adapters::keyring::KeyringStore),
        config.hpc.credential_system.clone(),
    ));
    let connector: Arc<dyn TransportConnector> = match config.hpc.transport {
        TransportKind::Ssh => Arc::new(adapters::ssh::SshConnector::new()),
        TransportKind::Local => Arc::new(adapters::local::LocalConnector::new()),
    };
    let sessions = Arc::new(SessionManager::new(connector, credentials.clone()));
    if let Ok(profile) = config.ssh_config() {
        sessions.register_profile(profile).await;
    }
    let jobs = Arc::new(JobManager::new(
        sessions.clone(),
        store,
        Arc::new(adapters::time::SystemClock),
        config.hpc.scheduler,
        config.job_settings(),
    ));
    jobs.restore().await?;
    let sync = FileSyncEngine::new(sessions.clone());

    let bridge = Bridge {
        config,
        credentials,
        sessions: sessions.clone(),
        jobs,
        sync,
    };
    let outcome = dispatch(&bridge, opts.command, parsed.sync_filters).await;
    sessions.shutdown().await;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&error_to_json(&err))?);
            Err(err.into())
        }
    }
}
