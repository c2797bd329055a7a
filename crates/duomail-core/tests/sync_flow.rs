use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use duomail_core::gmail::{
    AttachmentBody, Draft, GmailClient, ListHistoryResponse, ListLabelsResponse,
    ListMessagesResponse, Message, OAuthClient, OAuthTokens, Profile,
};
use duomail_core::migrations::run_migrations;
use duomail_core::remote::ListMessagesParams;
use duomail_core::sync::SyncMode;
use duomail_core::{
    AccessToken, AccountRepository, CredentialManager, CredentialSettings, CredentialState,
    Database, EmailRepository, LabelRepository, MailStore, MemorySecretStore, RemoteError,
    RemoteMail, SyncCoordinator, SyncError, SyncEvent, SyncSettings,
};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_PREFIX: &str = "/gmail/v1/users/me";

struct Fixture {
    server: MockServer,
    coordinator: SyncCoordinator,
    accounts: AccountRepository,
    store: Arc<EmailRepository>,
    credentials: CredentialManager,
    account_id: String,
    _dir: TempDir,
}

async fn fixture(settings: SyncSettings, access_token: &str, expires_in: chrono::Duration) -> Fixture {
    fixture_with_remote(settings, access_token, expires_in, |client| {
        Arc::new(client) as Arc<dyn RemoteMail>
    })
    .await
}

async fn fixture_with_remote(
    settings: SyncSettings,
    access_token: &str,
    expires_in: chrono::Duration,
    wrap: impl FnOnce(GmailClient) -> Arc<dyn RemoteMail>,
) -> Fixture {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let db_path = dir
        .path()
        .join(format!("db_{}.sqlite", uuid::Uuid::new_v4()));
    let db = Database::new(&db_path).await.expect("create db");
    run_migrations(&db).await.expect("migrations");

    let accounts = AccountRepository::new(db.clone());
    let labels = LabelRepository::new(db.clone());
    let store = Arc::new(EmailRepository::new(db));

    let http = reqwest::Client::new();
    let remote = wrap(
        GmailClient::new(http.clone()).with_api_base(format!("{}/gmail/v1/users", server.uri())),
    );
    let exchange = Arc::new(
        OAuthClient::new(http, "client", "secret")
            .with_token_endpoint(format!("{}/token", server.uri())),
    );
    let credentials = CredentialManager::new(
        Arc::new(MemorySecretStore::new()),
        exchange,
        CredentialSettings::default(),
    );

    let account = accounts
        .create("remote-1", "owner@example.com", Some("Owner".to_string()))
        .await
        .expect("create account");
    credentials
        .store_tokens(
            &account.id,
            OAuthTokens {
                access_token: access_token.to_string(),
                refresh_token: "refresh-1".to_string(),
                expires_at: Utc::now() + expires_in,
                scope: None,
            },
        )
        .await
        .expect("store tokens");

    let coordinator = SyncCoordinator::new(
        accounts.clone(),
        labels,
        store.clone(),
        remote,
        credentials.clone(),
        settings,
    );

    Fixture {
        server,
        coordinator,
        accounts,
        store,
        credentials,
        account_id: account.id,
        _dir: dir,
    }
}

fn message_json(id: &str, thread_id: &str, labels: &[&str], internal_date: &str) -> serde_json::Value {
    let plain = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("Body of {id}"));
    json!({
        "id": id,
        "threadId": thread_id,
        "labelIds": labels,
        "snippet": format!("Body of {id}"),
        "internalDate": internal_date,
        "payload": {
            "mimeType": "text/plain",
            "headers": [
                {"name": "From", "value": "Alice <alice@example.com>"},
                {"name": "To", "value": "owner@example.com"},
                {"name": "Subject", "value": format!("Subject {id}")}
            ],
            "body": {"size": 10, "data": plain}
        }
    })
}

async fn mount_head(server: &MockServer, history_id: &str) {
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/profile")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "emailAddress": "owner@example.com",
            "historyId": history_id
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/labels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "labels": [
                {"id": "INBOX", "name": "INBOX", "type": "system"},
                {"id": "UNREAD", "name": "UNREAD", "type": "system"},
                {"id": "Label_1", "name": "Receipts", "type": "user"}
            ]
        })))
        .mount(server)
        .await;
}

async fn mount_listing(server: &MockServer, ids: &[&str]) {
    let stubs: Vec<_> = ids
        .iter()
        .map(|id| json!({"id": id, "threadId": format!("t-{id}")}))
        .collect();
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/messages")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "messages": stubs })))
        .mount(server)
        .await;
}

async fn mount_message(server: &MockServer, body: serde_json::Value) {
    let id = body["id"].as_str().expect("id").to_string();
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/messages/{id}")))
        .and(query_param("format", "full"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Drops the connection on the first fetches of selected messages, then delegates.
struct DroppedConnections {
    inner: GmailClient,
    remaining: Mutex<HashMap<String, u32>>,
}

impl DroppedConnections {
    fn new(inner: GmailClient, failures: &[(&str, u32)]) -> Self {
        Self {
            inner,
            remaining: Mutex::new(
                failures
                    .iter()
                    .map(|(id, count)| (id.to_string(), *count))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl RemoteMail for DroppedConnections {
    async fn list_history(
        &self,
        token: &AccessToken,
        start_history_id: &str,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListHistoryResponse, RemoteError> {
        self.inner
            .list_history(token, start_history_id, page_token, max_results)
            .await
    }

    async fn get_message(&self, token: &AccessToken, id: &str) -> Result<Message, RemoteError> {
        let dropped = {
            let mut remaining = self.remaining.lock().expect("lock");
            match remaining.get_mut(id) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    true
                }
                _ => false,
            }
        };
        if dropped {
            return Err(RemoteError::Network("connection reset".into()));
        }
        self.inner.get_message(token, id).await
    }

    async fn list_messages(
        &self,
        token: &AccessToken,
        params: &ListMessagesParams,
    ) -> Result<ListMessagesResponse, RemoteError> {
        self.inner.list_messages(token, params).await
    }

    async fn get_profile(&self, token: &AccessToken) -> Result<Profile, RemoteError> {
        self.inner.get_profile(token).await
    }

    async fn list_labels(&self, token: &AccessToken) -> Result<ListLabelsResponse, RemoteError> {
        self.inner.list_labels(token).await
    }

    async fn modify_labels(
        &self,
        token: &AccessToken,
        id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<Message, RemoteError> {
        self.inner.modify_labels(token, id, add, remove).await
    }

    async fn create_draft(
        &self,
        token: &AccessToken,
        raw: &str,
        thread_id: Option<&str>,
    ) -> Result<Draft, RemoteError> {
        self.inner.create_draft(token, raw, thread_id).await
    }

    async fn get_attachment(
        &self,
        token: &AccessToken,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentBody, RemoteError> {
        self.inner
            .get_attachment(token, message_id, attachment_id)
            .await
    }
}

#[tokio::test]
async fn first_pass_rebuilds_cache_and_records_cursor() {
    let f = fixture(SyncSettings::default(), "live", chrono::Duration::hours(1)).await;
    mount_head(&f.server, "500").await;
    mount_listing(&f.server, &["m1", "m2"]).await;
    mount_message(&f.server, message_json("m1", "t-m1", &["INBOX", "UNREAD"], "1730000000000")).await;
    mount_message(&f.server, message_json("m2", "t-m2", &["INBOX"], "1730000100000")).await;

    let mut events = f.coordinator.subscribe();
    let report = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect("sync succeeds");

    assert_eq!(report.mode, SyncMode::FullResync);
    assert_eq!(report.applied, 2);
    assert_eq!(report.dropped, 0);
    assert_eq!(report.cursor.as_deref(), Some("500"));
    assert_eq!(f.store.count(&f.account_id).await.expect("count"), 2);

    let m1 = f
        .store
        .get_by_remote_id(&f.account_id, "m1")
        .await
        .expect("lookup")
        .expect("cached");
    assert_eq!(m1.subject.as_deref(), Some("Subject m1"));
    assert_eq!(m1.from_address.as_deref(), Some("alice@example.com"));
    assert!(!m1.flags.is_read);
    assert!(m1.flags.is_in_inbox);

    let state = f.accounts.sync_state(&f.account_id).await.expect("state");
    assert_eq!(state.cursor.as_deref(), Some("500"));
    assert!(state.last_success_at.is_some());
    assert!(state.last_error.is_none());

    assert!(matches!(
        events.recv().await.expect("started"),
        SyncEvent::Started { .. }
    ));
    assert!(matches!(
        events.recv().await.expect("completed"),
        SyncEvent::Completed { .. }
    ));
}

#[tokio::test]
async fn incremental_pass_applies_history_and_evicts_oldest() {
    let settings = SyncSettings {
        max_cached_messages: 2,
        ..SyncSettings::default()
    };
    let f = fixture(settings, "live", chrono::Duration::hours(1)).await;
    mount_head(&f.server, "500").await;
    mount_listing(&f.server, &["m1", "m2"]).await;
    mount_message(&f.server, message_json("m1", "t-m1", &["INBOX", "UNREAD"], "1730000000000")).await;
    mount_message(&f.server, message_json("m2", "t-m2", &["INBOX", "UNREAD"], "1730000100000")).await;
    mount_message(&f.server, message_json("m3", "t-m3", &["INBOX"], "1730000200000")).await;
    f.coordinator
        .sync_account(&f.account_id)
        .await
        .expect("initial sync");

    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/history")))
        .and(query_param("startHistoryId", "500"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "historyId": "510",
            "history": [
                {
                    "id": "505",
                    "labelsRemoved": [{"message": {"id": "m2"}, "labelIds": ["UNREAD"]}]
                },
                {
                    "id": "508",
                    "messagesAdded": [{"message": {"id": "m3"}}]
                }
            ]
        })))
        .mount(&f.server)
        .await;

    let report = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect("incremental sync");

    assert_eq!(report.mode, SyncMode::Incremental);
    assert_eq!(report.cursor.as_deref(), Some("510"));
    assert_eq!(report.evicted, 1);
    assert_eq!(f.store.count(&f.account_id).await.expect("count"), 2);
    assert!(
        f.store
            .get_by_remote_id(&f.account_id, "m1")
            .await
            .expect("lookup")
            .is_none(),
        "oldest message is evicted"
    );
    let m2 = f
        .store
        .get_by_remote_id(&f.account_id, "m2")
        .await
        .expect("lookup")
        .expect("m2 cached");
    assert!(m2.flags.is_read);
    assert!(!m2.label_ids.contains(&"UNREAD".to_string()));
}

#[tokio::test]
async fn expired_cursor_falls_back_to_full_resync() {
    let f = fixture(SyncSettings::default(), "live", chrono::Duration::hours(1)).await;
    f.accounts
        .record_sync_success(&f.account_id, "42", Utc::now())
        .await
        .expect("seed cursor");

    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/history")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&f.server)
        .await;
    mount_head(&f.server, "900").await;
    mount_listing(&f.server, &["m9"]).await;
    mount_message(&f.server, message_json("m9", "t-m9", &["INBOX"], "1730000000000")).await;

    let report = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect("falls back");

    assert_eq!(report.mode, SyncMode::FullResync);
    assert_eq!(report.cursor.as_deref(), Some("900"));
    assert_eq!(f.store.count(&f.account_id).await.expect("count"), 1);
}

#[tokio::test]
async fn unmappable_messages_are_dropped_without_failing_the_pass() {
    let f = fixture(SyncSettings::default(), "live", chrono::Duration::hours(1)).await;
    mount_head(&f.server, "700").await;
    mount_listing(&f.server, &["good", "bad"]).await;
    mount_message(&f.server, message_json("good", "t-good", &["INBOX"], "1730000000000")).await;
    mount_message(&f.server, message_json("bad", "t-bad", &["INBOX"], "not a date")).await;

    let report = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect("sync succeeds");

    assert_eq!(report.applied, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(f.store.count(&f.account_id).await.expect("count"), 1);
}

#[tokio::test]
async fn expiring_token_is_refreshed_before_remote_calls() {
    let f = fixture(SyncSettings::default(), "stale", chrono::Duration::seconds(-60)).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/profile")))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "emailAddress": "owner@example.com",
            "historyId": "77"
        })))
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/labels")))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"labels": []})))
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/messages")))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&f.server)
        .await;

    let report = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect("sync with refreshed token");
    assert_eq!(report.cursor.as_deref(), Some("77"));
    assert_eq!(
        f.credentials.state(&f.account_id).await.expect("state"),
        CredentialState::Valid
    );
}

#[tokio::test]
async fn revoked_grant_requires_reauthentication_and_leaves_sync_state_alone() {
    let f = fixture(SyncSettings::default(), "stale", chrono::Duration::seconds(-60)).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .mount(&f.server)
        .await;

    let err = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect_err("needs sign-in");
    assert_eq!(
        err,
        SyncError::ReauthenticationRequired {
            account_id: f.account_id.clone()
        }
    );
    assert!(!err.is_recoverable());

    let state = f.accounts.sync_state(&f.account_id).await.expect("state");
    assert!(state.last_error.is_none());
    assert!(state.cursor.is_none());
    assert_eq!(
        f.credentials.state(&f.account_id).await.expect("state"),
        CredentialState::Expired
    );
}

#[tokio::test]
async fn remote_quota_stops_the_pass_with_retry_hint() {
    let f = fixture(SyncSettings::default(), "live", chrono::Duration::hours(1)).await;
    mount_head(&f.server, "300").await;
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/messages")))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&f.server)
        .await;

    let err = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect_err("quota");
    assert_eq!(
        err,
        SyncError::QuotaExceeded {
            retry_after: Duration::from_secs(30)
        }
    );

    let state = f.accounts.sync_state(&f.account_id).await.expect("state");
    assert!(state.last_error.is_some());
    assert!(state.cursor.is_none(), "cursor only advances on success");
}

#[tokio::test]
async fn failing_item_is_retried_once_and_reported_as_partial_failure() {
    let f = fixture(SyncSettings::default(), "live", chrono::Duration::hours(1)).await;
    mount_head(&f.server, "600").await;
    mount_listing(&f.server, &["m1", "m2"]).await;
    mount_message(&f.server, message_json("m1", "t-m1", &["INBOX"], "1730000000000")).await;
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/messages/m2")))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&f.server)
        .await;

    let err = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect_err("one item failed");
    assert_eq!(
        err,
        SyncError::PartialFailure {
            success_count: 1,
            failure_count: 1
        }
    );

    assert!(
        f.store
            .get_by_remote_id(&f.account_id, "m1")
            .await
            .expect("lookup")
            .is_some()
    );
    let state = f.accounts.sync_state(&f.account_id).await.expect("state");
    assert!(state.cursor.is_none(), "failed items are retried by the next pass");
    assert!(state.last_success_at.is_none());
    assert!(state.last_error.is_some());
}

#[tokio::test]
async fn dropped_connection_on_one_message_is_retried() {
    let f = fixture_with_remote(
        SyncSettings::default(),
        "live",
        chrono::Duration::hours(1),
        |client| Arc::new(DroppedConnections::new(client, &[("m1", 1)])) as Arc<dyn RemoteMail>,
    )
    .await;
    mount_head(&f.server, "640").await;
    mount_listing(&f.server, &["m1", "m2"]).await;
    mount_message(&f.server, message_json("m1", "t-m1", &["INBOX"], "1730000000000")).await;
    mount_message(&f.server, message_json("m2", "t-m2", &["INBOX"], "1730000100000")).await;

    let report = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect("retry recovers");
    assert_eq!(report.applied, 2);
    assert_eq!(report.cursor.as_deref(), Some("640"));
    assert_eq!(f.store.count(&f.account_id).await.expect("count"), 2);
}

#[tokio::test]
async fn persistent_network_loss_aborts_the_pass() {
    let f = fixture_with_remote(
        SyncSettings::default(),
        "live",
        chrono::Duration::hours(1),
        |client| Arc::new(DroppedConnections::new(client, &[("m1", 2)])) as Arc<dyn RemoteMail>,
    )
    .await;
    mount_head(&f.server, "650").await;
    mount_listing(&f.server, &["m1", "m2"]).await;
    mount_message(&f.server, message_json("m2", "t-m2", &["INBOX"], "1730000100000")).await;

    let err = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect_err("network gone");
    assert!(matches!(err, SyncError::NetworkUnavailable(_)));

    let state = f.accounts.sync_state(&f.account_id).await.expect("state");
    assert!(state.cursor.is_none());
    assert!(state.last_error.is_some());
}

#[tokio::test]
async fn concurrent_pass_for_same_account_is_refused() {
    let f = fixture(SyncSettings::default(), "live", chrono::Duration::hours(1)).await;
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/profile")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "emailAddress": "owner@example.com",
                    "historyId": "800"
                }))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/labels")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"labels": []})))
        .mount(&f.server)
        .await;
    mount_listing(&f.server, &[]).await;

    let first = tokio::spawn({
        let coordinator = f.coordinator.clone();
        let account_id = f.account_id.clone();
        async move { coordinator.sync_account(&account_id).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect_err("already running");
    assert_eq!(
        err,
        SyncError::InProgress {
            account_id: f.account_id.clone()
        }
    );

    let report = first.await.expect("join").expect("first pass completes");
    assert_eq!(report.cursor.as_deref(), Some("800"));
    let state = f.accounts.sync_state(&f.account_id).await.expect("state");
    assert!(state.last_error.is_none(), "a refused pass is not recorded");
}

#[tokio::test]
async fn quota_stop_checkpoints_the_last_applied_record() {
    let f = fixture(SyncSettings::default(), "live", chrono::Duration::hours(1)).await;
    f.accounts
        .record_sync_success(&f.account_id, "100", Utc::now())
        .await
        .expect("seed cursor");

    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/history")))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "10"))
        .with_priority(1)
        .mount(&f.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{API_PREFIX}/history")))
        .and(query_param("startHistoryId", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "historyId": "120",
            "nextPageToken": "p2",
            "history": [
                {"id": "101", "messagesAdded": [{"message": {"id": "m5"}}]},
                {"id": "102", "messagesAdded": [{"message": {"id": "m6"}}]}
            ]
        })))
        .mount(&f.server)
        .await;
    mount_message(&f.server, message_json("m5", "t-m5", &["INBOX"], "1730000000000")).await;
    mount_message(&f.server, message_json("m6", "t-m6", &["INBOX"], "1730000100000")).await;

    let err = f
        .coordinator
        .sync_account(&f.account_id)
        .await
        .expect_err("quota");
    assert_eq!(
        err,
        SyncError::QuotaExceeded {
            retry_after: Duration::from_secs(10)
        }
    );

    let state = f.accounts.sync_state(&f.account_id).await.expect("state");
    assert_eq!(state.cursor.as_deref(), Some("102"));
    assert!(state.last_error.is_some());
    assert_eq!(f.store.count(&f.account_id).await.expect("count"), 2);
}
