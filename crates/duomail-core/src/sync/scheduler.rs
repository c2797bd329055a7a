use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{SyncCoordinator, SyncError};

/// Runs one background task per account: a pass on start, then every interval or when
/// triggered.
pub struct SyncScheduler {
    coordinator: SyncCoordinator,
    interval: Duration,
    shutdown: CancellationToken,
    tasks: Mutex<HashMap<String, (Arc<Notify>, JoinHandle<()>)>>,
}

impl SyncScheduler {
    pub fn new(coordinator: SyncCoordinator, shutdown: CancellationToken) -> Self {
        let interval = coordinator.settings().interval;
        Self {
            coordinator,
            interval,
            shutdown,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Arc<Notify>, JoinHandle<()>)>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts the account's task unless one is already running.
    pub fn spawn_account(&self, account_id: &str) {
        let mut tasks = self.tasks();
        if tasks
            .get(account_id)
            .is_some_and(|(_, handle)| !handle.is_finished())
        {
            return;
        }

        let notify = Arc::new(Notify::new());
        let handle = tokio::spawn(run_account_loop(
            self.coordinator.clone(),
            account_id.to_string(),
            self.interval,
            notify.clone(),
            self.shutdown.clone(),
        ));
        tasks.insert(account_id.to_string(), (notify, handle));
    }

    /// Wakes the account's task for an immediate pass. Returns `false` if no task exists.
    pub fn trigger(&self, account_id: &str) -> bool {
        match self.tasks().get(account_id) {
            Some((notify, _)) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self
            .tasks()
            .drain()
            .map(|(_, (_, handle))| handle)
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "sync task ended abnormally");
            }
        }
    }
}

async fn run_account_loop(
    coordinator: SyncCoordinator,
    account_id: String,
    interval: Duration,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
) {
    info!(account_id, ?interval, "sync task started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let result = AssertUnwindSafe(coordinator.sync_account(&account_id))
            .catch_unwind()
            .await;

        let delay = match result {
            Ok(Err(SyncError::QuotaExceeded { retry_after })) => interval.max(retry_after),
            Ok(_) => interval,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(account_id, error = %message, "sync pass panicked");
                interval
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(delay) => {}
            _ = notify.notified() => {}
        }
    }
    info!(account_id, "sync task stopped");
}
