//! Per-account reconciliation of the local replica against the remote change stream.

mod scheduler;

pub use scheduler::SyncScheduler;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::accounts::{AccountError, AccountRepository};
use crate::credentials::{AuthorizedError, CredentialError, CredentialManager};
use crate::emails::{MailStore, StoreError};
use crate::gmail::types::HistoryRecord;
use crate::labels::{LabelError, LabelRepository};
use crate::mapper::{MapperOptions, map_message};
use crate::remote::{AccessToken, ListMessagesParams, RemoteError, RemoteMail};

pub const DEFAULT_MAX_CACHED_MESSAGES: u64 = 2_000;
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(300);
const EVENT_CAPACITY: usize = 64;
const MAX_ITEM_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    pub max_cached_messages: u64,
    pub page_size: u32,
    pub pass_timeout: Duration,
    pub mapper: MapperOptions,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_cached_messages: DEFAULT_MAX_CACHED_MESSAGES,
            page_size: DEFAULT_PAGE_SIZE,
            pass_timeout: DEFAULT_PASS_TIMEOUT,
            mapper: MapperOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("history cursor expired")]
    CursorExpired,
    #[error("remote quota exceeded, retry after {retry_after:?}")]
    QuotaExceeded { retry_after: Duration },
    #[error("sync finished with {failure_count} failed items ({success_count} applied)")]
    PartialFailure {
        success_count: u64,
        failure_count: u64,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("sync already running for account {account_id}")]
    InProgress { account_id: String },
    #[error("account {account_id} must be re-authorized")]
    ReauthenticationRequired { account_id: String },
    #[error("credential error: {0}")]
    Credential(String),
    #[error("unexpected sync failure: {0}")]
    Unexpected(String),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::NetworkUnavailable(_) => "sync.network_unavailable",
            SyncError::CursorExpired => "sync.cursor_expired",
            SyncError::QuotaExceeded { .. } => "sync.quota_exceeded",
            SyncError::PartialFailure { .. } => "sync.partial_failure",
            SyncError::Storage(_) => "sync.storage",
            SyncError::InProgress { .. } => "sync.in_progress",
            SyncError::ReauthenticationRequired { .. } => "sync.reauthentication_required",
            SyncError::Credential(_) => "sync.credential",
            SyncError::Unexpected(_) => "sync.unexpected",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            SyncError::ReauthenticationRequired { .. } | SyncError::Unexpected(_)
        )
    }

    /// Whether the failure belongs on the account's `SyncState`.
    fn is_recorded(&self) -> bool {
        !matches!(
            self,
            SyncError::ReauthenticationRequired { .. }
                | SyncError::InProgress { .. }
                | SyncError::Unexpected(_)
        )
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<LabelError> for SyncError {
    fn from(err: LabelError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<AccountError> for SyncError {
    fn from(err: AccountError) -> Self {
        match err {
            AccountError::NotFound(id) => SyncError::Unexpected(format!("unknown account {id}")),
            other => SyncError::Storage(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    FullResync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub account_id: String,
    pub mode: SyncMode,
    pub applied: u64,
    /// Messages skipped because their payload could not be mapped.
    pub dropped: u64,
    pub evicted: u64,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started { account_id: String },
    Completed { account_id: String, report: SyncReport },
    Failed { account_id: String, error: SyncError },
}

#[derive(Debug, Default)]
struct Tally {
    applied: u64,
    failed: u64,
    dropped: u64,
}

/// Removes the account from the running set when the pass ends, including on cancellation.
struct RunningGuard {
    running: Arc<Mutex<HashSet<String>>>,
    account_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.account_id);
    }
}

#[derive(Clone)]
pub struct SyncCoordinator {
    accounts: AccountRepository,
    labels: LabelRepository,
    store: Arc<dyn MailStore>,
    remote: Arc<dyn RemoteMail>,
    credentials: CredentialManager,
    settings: SyncSettings,
    running: Arc<Mutex<HashSet<String>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    pub fn new(
        accounts: AccountRepository,
        labels: LabelRepository,
        store: Arc<dyn MailStore>,
        remote: Arc<dyn RemoteMail>,
        credentials: CredentialManager,
        settings: SyncSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            accounts,
            labels,
            store,
            remote,
            credentials,
            settings,
            running: Arc::new(Mutex::new(HashSet::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    fn try_start(&self, account_id: &str) -> Option<RunningGuard> {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !running.insert(account_id.to_string()) {
            return None;
        }
        Some(RunningGuard {
            running: self.running.clone(),
            account_id: account_id.to_string(),
        })
    }

    /// Runs one reconciliation pass. A second call while a pass is running returns
    /// `InProgress` instead of queuing.
    #[tracing::instrument(skip(self))]
    pub async fn sync_account(&self, account_id: &str) -> Result<SyncReport, SyncError> {
        let Some(_running) = self.try_start(account_id) else {
            return Err(SyncError::InProgress {
                account_id: account_id.to_string(),
            });
        };

        let _ = self.events.send(SyncEvent::Started {
            account_id: account_id.to_string(),
        });

        let result = match tokio::time::timeout(self.settings.pass_timeout, self.run_pass(account_id))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::NetworkUnavailable(format!(
                "sync pass exceeded {:?}",
                self.settings.pass_timeout
            ))),
        };

        match &result {
            Ok(report) => {
                info!(
                    account_id,
                    mode = ?report.mode,
                    applied = report.applied,
                    dropped = report.dropped,
                    evicted = report.evicted,
                    "sync pass complete"
                );
                let _ = self.events.send(SyncEvent::Completed {
                    account_id: account_id.to_string(),
                    report: report.clone(),
                });
            }
            Err(err) => {
                warn!(account_id, error = %err, code = err.code(), "sync pass failed");
                if err.is_recorded() {
                    if let Err(record_err) =
                        self.accounts.record_sync_error(account_id, &err.to_string()).await
                    {
                        warn!(account_id, error = %record_err, "failed to record sync error");
                    }
                }
                let _ = self.events.send(SyncEvent::Failed {
                    account_id: account_id.to_string(),
                    error: err.clone(),
                });
            }
        }

        result
    }

    async fn run_pass(&self, account_id: &str) -> Result<SyncReport, SyncError> {
        let state = self.accounts.sync_state(account_id).await?;

        // Fail fast without touching SyncState when the account needs a new sign-in.
        self.credentials
            .get_valid_token(account_id)
            .await
            .map_err(|err| credential_interruption(account_id, err))?;

        let mut tally = Tally::default();
        let (mode, cursor) = match state.cursor.as_deref() {
            Some(cursor) => {
                let incremental = self.run_incremental(account_id, cursor, &mut tally).await;
                match incremental {
                    Err(SyncError::CursorExpired) => {
                        info!(account_id, cursor, "history cursor expired, running full resync");
                        tally = Tally::default();
                        (
                            SyncMode::FullResync,
                            self.run_full_resync(account_id, &mut tally).await?,
                        )
                    }
                    other => (SyncMode::Incremental, other?),
                }
            }
            None => (
                SyncMode::FullResync,
                self.run_full_resync(account_id, &mut tally).await?,
            ),
        };

        let evicted = self
            .store
            .delete_oldest(account_id, self.settings.max_cached_messages)
            .await?;
        if evicted > 0 {
            debug!(account_id, evicted, "evicted oldest cached messages");
        }

        if tally.failed > 0 {
            return Err(SyncError::PartialFailure {
                success_count: tally.applied,
                failure_count: tally.failed,
            });
        }

        self.accounts
            .record_sync_success(account_id, &cursor, Utc::now())
            .await?;

        Ok(SyncReport {
            account_id: account_id.to_string(),
            mode,
            applied: tally.applied,
            dropped: tally.dropped,
            evicted,
            cursor: Some(cursor),
        })
    }

    /// Applies history since `cursor`. Returns the cursor to persist once the pass succeeds.
    async fn run_incremental(
        &self,
        account_id: &str,
        cursor: &str,
        tally: &mut Tally,
    ) -> Result<String, SyncError> {
        let mut page_token: Option<String> = None;
        let mut latest = cursor.to_string();
        let mut last_applied: Option<String> = None;
        let mut fetched = HashSet::new();

        let outcome: Result<(), SyncError> = async {
            loop {
                let response = self
                    .list_call(account_id, |token| {
                        let page_token = page_token.clone();
                        async move {
                            self.remote
                                .list_history(
                                    &token,
                                    cursor,
                                    page_token.as_deref(),
                                    Some(self.settings.page_size),
                                )
                                .await
                        }
                    })
                    .await?;

                if let Some(history_id) = response.history_id {
                    latest = history_id;
                }

                for record in &response.history {
                    self.apply_record(account_id, record, &mut fetched, tally)
                        .await?;
                    last_applied = Some(record.id.clone());
                }

                match response.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => return Ok(()),
                }
            }
        }
        .await;

        match outcome {
            Ok(()) => Ok(latest),
            Err(err @ SyncError::QuotaExceeded { .. }) => {
                // Everything up to the last whole record is durable; resume from there.
                if tally.failed == 0 {
                    if let Some(record_id) = last_applied.as_deref() {
                        self.accounts
                            .record_sync_checkpoint(account_id, record_id)
                            .await?;
                        debug!(account_id, record_id, "checkpointed cursor before quota stop");
                    }
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_record(
        &self,
        account_id: &str,
        record: &HistoryRecord,
        fetched: &mut HashSet<String>,
        tally: &mut Tally,
    ) -> Result<(), SyncError> {
        for change in &record.messages_added {
            if fetched.insert(change.message.id.clone()) {
                self.ingest(account_id, &change.message.id, tally).await?;
            }
        }

        // Label deltas are applied in arrival order; a message not cached locally is skipped.
        for change in &record.labels_added {
            self.store
                .modify_labels(account_id, &change.message.id, &change.label_ids, &[])
                .await?;
        }
        for change in &record.labels_removed {
            self.store
                .modify_labels(account_id, &change.message.id, &[], &change.label_ids)
                .await?;
        }

        for change in &record.messages_deleted {
            if self
                .store
                .delete_by_remote_id(account_id, &change.message.id)
                .await?
            {
                tally.applied += 1;
            }
        }
        Ok(())
    }

    /// Rebuilds the cache from the newest messages. Returns the fresh cursor.
    async fn run_full_resync(
        &self,
        account_id: &str,
        tally: &mut Tally,
    ) -> Result<String, SyncError> {
        // Read the head before listing so changes made during the resync are replayed later.
        let profile = self
            .list_call(account_id, |token| async move {
                self.remote.get_profile(&token).await
            })
            .await?;

        let labels = self
            .list_call(account_id, |token| async move {
                self.remote.list_labels(&token).await
            })
            .await?;
        self.labels.replace_all(account_id, &labels.labels).await?;

        let cleared = self.store.clear_account(account_id).await?;
        debug!(account_id, cleared, "cleared local cache for full resync");

        let cap = self.settings.max_cached_messages;
        let mut remaining = cap;
        let mut page_token: Option<String> = None;
        while remaining > 0 {
            let params = ListMessagesParams {
                query: None,
                label_ids: Vec::new(),
                page_token: page_token.clone(),
                max_results: Some(remaining.min(u64::from(self.settings.page_size)) as u32),
            };
            let page = self
                .list_call(account_id, |token| {
                    let params = &params;
                    async move { self.remote.list_messages(&token, params).await }
                })
                .await?;

            for stub in page.messages.iter().take(remaining as usize) {
                self.ingest(account_id, &stub.id, tally).await?;
                remaining -= 1;
            }

            match page.next_page_token {
                Some(token) if remaining > 0 => page_token = Some(token),
                _ => break,
            }
        }

        Ok(profile.history_id)
    }

    /// Fetches, maps and stores one message. Per-item failures are counted, not raised.
    async fn ingest(
        &self,
        account_id: &str,
        remote_id: &str,
        tally: &mut Tally,
    ) -> Result<(), SyncError> {
        let mut attempt = 0;
        let message = loop {
            attempt += 1;
            let result = self
                .credentials
                .call_authorized(account_id, |token: AccessToken| async move {
                    self.remote.get_message(&token, remote_id).await
                })
                .await;

            match result {
                Ok(message) => break message,
                Err(AuthorizedError::Remote(RemoteError::NotFound)) => {
                    debug!(account_id, message_id = remote_id, "message vanished remotely");
                    self.store.delete_by_remote_id(account_id, remote_id).await?;
                    return Ok(());
                }
                Err(AuthorizedError::Remote(err))
                    if err.is_transient() && attempt < MAX_ITEM_ATTEMPTS =>
                {
                    debug!(account_id, message_id = remote_id, error = %err, "retrying message fetch");
                }
                Err(AuthorizedError::Remote(
                    err @ (RemoteError::Transient(_)
                    | RemoteError::Decode(_)
                    | RemoteError::Rejected { .. }),
                )) => {
                    warn!(account_id, message_id = remote_id, error = %err, "message fetch failed");
                    tally.failed += 1;
                    return Ok(());
                }
                Err(err) => return Err(interruption(account_id, err)),
            }
        };

        match map_message(account_id, &message, &self.settings.mapper) {
            Ok(email) => {
                self.store.insert_or_update(&email).await?;
                tally.applied += 1;
            }
            Err(err) => {
                warn!(account_id, message_id = remote_id, error = %err, code = err.code(), "dropping unmappable message");
                tally.dropped += 1;
            }
        }
        Ok(())
    }

    /// A remote call whose failure ends the pass. Transient errors get one retry.
    async fn list_call<T, F, Fut>(&self, account_id: &str, op: F) -> Result<T, SyncError>
    where
        F: Fn(AccessToken) -> Fut,
        Fut: std::future::Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.credentials.call_authorized(account_id, &op).await {
                Ok(value) => return Ok(value),
                Err(AuthorizedError::Remote(err))
                    if err.is_transient() && attempt < MAX_ITEM_ATTEMPTS =>
                {
                    debug!(account_id, error = %err, "retrying remote list call");
                }
                Err(err) => return Err(interruption(account_id, err)),
            }
        }
    }
}

fn credential_interruption(account_id: &str, err: CredentialError) -> SyncError {
    match err {
        CredentialError::ReauthenticationRequired { .. } => SyncError::ReauthenticationRequired {
            account_id: account_id.to_string(),
        },
        other => SyncError::Credential(other.to_string()),
    }
}

fn interruption(account_id: &str, err: AuthorizedError) -> SyncError {
    match err {
        AuthorizedError::Credential(err) => credential_interruption(account_id, err),
        AuthorizedError::Remote(err) => match err {
            RemoteError::CursorExpired => SyncError::CursorExpired,
            RemoteError::RateLimited { retry_after } => SyncError::QuotaExceeded { retry_after },
            RemoteError::Network(msg) => SyncError::NetworkUnavailable(msg),
            RemoteError::Transient(msg) => SyncError::NetworkUnavailable(msg),
            RemoteError::AuthRejected => {
                SyncError::Credential("access token rejected after refresh".to_string())
            }
            other => SyncError::Unexpected(other.to_string()),
        },
    }
}
