use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::gmail::types::{
    AttachmentBody, CreateDraftRequest, Draft, DraftMessage, ListHistoryResponse,
    ListLabelsResponse, ListMessagesResponse, Message, ModifyMessageRequest, Profile,
};
use crate::remote::{AccessToken, DEFAULT_RETRY_AFTER, ListMessagesParams, RemoteError, RemoteMail};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GmailClient {
    http: Client,
    user_id: String,
    api_base: String,
    request_timeout: Duration,
}

impl GmailClient {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            user_id: "me".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.user_id, path)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        token: &AccessToken,
    ) -> Result<T, RemoteError> {
        let response = builder
            .bearer_auth(token.secret())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, retry_after, body));
        }

        let body = response.text().await.map_err(map_transport_error)?;
        serde_json::from_str(&body).map_err(|err| RemoteError::Decode(err.to_string()))
    }
}

#[async_trait]
impl RemoteMail for GmailClient {
    async fn list_history(
        &self,
        token: &AccessToken,
        start_history_id: &str,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListHistoryResponse, RemoteError> {
        let mut builder = self
            .http
            .get(self.url("history"))
            .query(&[("startHistoryId", start_history_id)]);
        if let Some(token) = page_token {
            builder = builder.query(&[("pageToken", token)]);
        }
        if let Some(max) = max_results {
            builder = builder.query(&[("maxResults", max)]);
        }

        // The history endpoint answers 404 when the start id has aged out.
        match self.send_json(builder, token).await {
            Err(RemoteError::NotFound) => Err(RemoteError::CursorExpired),
            other => other,
        }
    }

    async fn get_message(&self, token: &AccessToken, id: &str) -> Result<Message, RemoteError> {
        let builder = self
            .http
            .get(self.url(&format!("messages/{id}")))
            .query(&[("format", "full")]);
        self.send_json(builder, token).await
    }

    async fn list_messages(
        &self,
        token: &AccessToken,
        params: &ListMessagesParams,
    ) -> Result<ListMessagesResponse, RemoteError> {
        let mut builder = self.http.get(self.url("messages"));
        if let Some(q) = params.query.as_deref() {
            builder = builder.query(&[("q", q)]);
        }
        for label in &params.label_ids {
            builder = builder.query(&[("labelIds", label.as_str())]);
        }
        if let Some(page) = params.page_token.as_deref() {
            builder = builder.query(&[("pageToken", page)]);
        }
        if let Some(max) = params.max_results {
            builder = builder.query(&[("maxResults", max)]);
        }
        self.send_json(builder, token).await
    }

    async fn get_profile(&self, token: &AccessToken) -> Result<Profile, RemoteError> {
        self.send_json(self.http.get(self.url("profile")), token)
            .await
    }

    async fn list_labels(&self, token: &AccessToken) -> Result<ListLabelsResponse, RemoteError> {
        self.send_json(self.http.get(self.url("labels")), token)
            .await
    }

    async fn modify_labels(
        &self,
        token: &AccessToken,
        id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<Message, RemoteError> {
        let body = ModifyMessageRequest {
            add_label_ids: add.to_vec(),
            remove_label_ids: remove.to_vec(),
        };
        let builder = self
            .http
            .post(self.url(&format!("messages/{id}/modify")))
            .json(&body);
        self.send_json(builder, token).await
    }

    async fn create_draft(
        &self,
        token: &AccessToken,
        raw: &str,
        thread_id: Option<&str>,
    ) -> Result<Draft, RemoteError> {
        let body = CreateDraftRequest {
            message: DraftMessage {
                raw: raw.to_string(),
                thread_id: thread_id.map(str::to_string),
            },
        };
        let builder = self.http.post(self.url("drafts")).json(&body);
        self.send_json(builder, token).await
    }

    async fn get_attachment(
        &self,
        token: &AccessToken,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentBody, RemoteError> {
        let builder = self.http.get(self.url(&format!(
            "messages/{message_id}/attachments/{attachment_id}"
        )));
        self.send_json(builder, token).await
    }
}

fn retry_after(response: &reqwest::Response) -> Duration {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn map_status(status: StatusCode, retry_after: Duration, body: String) -> RemoteError {
    debug!(status = status.as_u16(), "remote request failed");
    match status {
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited { retry_after },
        StatusCode::FORBIDDEN if is_rate_limit_reason(&body) => {
            RemoteError::RateLimited { retry_after }
        }
        StatusCode::UNAUTHORIZED => RemoteError::AuthRejected,
        StatusCode::NOT_FOUND => RemoteError::NotFound,
        s if s.is_server_error() => RemoteError::Transient(format!("status {}", s.as_u16())),
        s => RemoteError::Rejected {
            status: s.as_u16(),
            body,
        },
    }
}

fn is_rate_limit_reason(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    lowered.contains("ratelimitexceeded") || lowered.contains("quotaexceeded")
}

fn map_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Transient(format!("request timed out: {err}"))
    } else if err.is_decode() {
        RemoteError::Decode(err.to_string())
    } else {
        RemoteError::Network(err.to_string())
    }
}
