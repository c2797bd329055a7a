pub mod client;
pub mod oauth;
pub mod types;

pub use client::GmailClient;
pub use oauth::{OAuthClient, OAuthError, OAuthTokens, TokenExchange};
pub use types::*;
