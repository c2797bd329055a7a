use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::minutes(5);
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.compose",
    "https://www.googleapis.com/auth/gmail.modify",
];

const PKCE_VERIFIER_LEN: usize = 64;
const PKCE_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl OAuthTokens {
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now + buffer >= self.expires_at
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("missing refresh token")]
    MissingRefreshToken,
    #[error("refresh token or authorization code was rejected")]
    InvalidGrant,
    #[error("oauth client is no longer authorized: {0}")]
    ClientRevoked(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
}

impl OAuthError {
    pub fn code(&self) -> &'static str {
        match self {
            OAuthError::MissingRefreshToken => "oauth.missing_refresh_token",
            OAuthError::InvalidGrant => "oauth.invalid_grant",
            OAuthError::ClientRevoked(_) => "oauth.client_revoked",
            OAuthError::Http(_) => "oauth.http",
            OAuthError::Decode(_) => "oauth.decode",
            OAuthError::TokenEndpoint { .. } => "oauth.token_endpoint",
            OAuthError::InvalidExpires(_) => "oauth.invalid_expires",
        }
    }

    /// Whether the stored grant is dead and only a new interactive sign-in can help.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            OAuthError::InvalidGrant | OAuthError::MissingRefreshToken
        )
    }
}

/// Network side of the credential lifecycle: token grants and the consent URL.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn refresh(&self, tokens: &OAuthTokens) -> Result<OAuthTokens, OAuthError>;

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<OAuthTokens, OAuthError>;

    fn authorization_url(&self, state: &str, challenge: &str, redirect_uri: &str) -> String;
}

#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_endpoint: String,
    auth_endpoint: String,
    scopes: Vec<String>,
}

impl OAuthClient {
    pub fn new(
        http: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            auth_endpoint: AUTH_ENDPOINT.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    pub fn with_auth_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.auth_endpoint = endpoint.into();
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    async fn post_grant(
        &self,
        form: &[(&str, &str)],
        previous_refresh: Option<&str>,
    ) -> Result<OAuthTokens, OAuthError> {
        let response = self.http.post(&self.token_endpoint).form(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_endpoint_error(status.as_u16(), body));
        }

        let body = response.text().await?;
        let payload: TokenResponse = serde_json::from_str(&body)?;
        if payload.expires_in <= 0 {
            return Err(OAuthError::InvalidExpires(payload.expires_in));
        }

        let refresh_token = match (payload.refresh_token, previous_refresh) {
            (Some(token), _) if !token.is_empty() => token,
            (_, Some(previous)) => previous.to_string(),
            _ => return Err(OAuthError::MissingRefreshToken),
        };

        Ok(OAuthTokens {
            access_token: payload.access_token,
            refresh_token,
            expires_at: Utc::now() + Duration::seconds(payload.expires_in),
            scope: payload.scope,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
}

fn classify_endpoint_error(status: u16, body: String) -> OAuthError {
    if matches!(status, 400 | 401) {
        if let Ok(parsed) = serde_json::from_str::<TokenErrorResponse>(&body) {
            match parsed.error.as_str() {
                "invalid_grant" => return OAuthError::InvalidGrant,
                "invalid_client" | "unauthorized_client" => {
                    return OAuthError::ClientRevoked(parsed.error);
                }
                _ => {}
            }
        }
    }
    OAuthError::TokenEndpoint { status, body }
}

#[async_trait]
impl TokenExchange for OAuthClient {
    async fn refresh(&self, tokens: &OAuthTokens) -> Result<OAuthTokens, OAuthError> {
        if tokens.refresh_token.is_empty() {
            return Err(OAuthError::MissingRefreshToken);
        }

        let mut refreshed = self
            .post_grant(
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.as_str()),
                    ("refresh_token", tokens.refresh_token.as_str()),
                ],
                Some(tokens.refresh_token.as_str()),
            )
            .await?;
        if refreshed.scope.is_none() {
            refreshed.scope = tokens.scope.clone();
        }
        Ok(refreshed)
    }

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<OAuthTokens, OAuthError> {
        self.post_grant(
            &[
                ("grant_type", "authorization_code"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("code_verifier", verifier),
                ("redirect_uri", redirect_uri),
            ],
            None,
        )
        .await
    }

    fn authorization_url(&self, state: &str, challenge: &str, redirect_uri: &str) -> String {
        let scope = self.scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
        ];
        match reqwest::Url::parse_with_params(&self.auth_endpoint, &params) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}?client_id={}", self.auth_endpoint, self.client_id),
        }
    }
}

pub fn generate_pkce_verifier() -> String {
    let mut rng = OsRng;
    (0..PKCE_VERIFIER_LEN)
        .map(|_| PKCE_ALPHABET[rng.gen_range(0..PKCE_ALPHABET.len())] as char)
        .collect()
}

pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
