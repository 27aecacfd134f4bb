// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::app::services::jobs::JobManager;

/// Background task that refreshes every tracked job on a fixed interval.
///
/// The stop signal is only checked between cycles; a cycle in flight runs to completion.
pub struct JobPoller {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JobPoller {
    pub fn spawn(jobs: Arc<JobManager>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "job poller started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let updated = jobs.poll_all().await;
                tracing::debug!(updated = updated.len(), "poll cycle finished");
                if *stop_rx.borrow() {
                    break;
                }
            }
            tracing::info!("job poller stopped");
        });
        Self { stop_tx, task }
    }

    /// Signals the loop and waits for the current cycle, if any, to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "job poller task ended abnormally");
        }
    }
}
