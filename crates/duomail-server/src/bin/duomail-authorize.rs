use std::env;
use std::error::Error;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use duomail_core::credentials::{CallbackParams, CredentialManager};
use duomail_core::{
    AccessToken, AccountError, AccountRepository, Config, Database, RemoteMail, init_telemetry,
    migrations,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type AnyError = Box<dyn Error + Send + Sync>;

const CALLBACK_PATH: &str = "/oauth2callback";
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);
const SUCCESS_HTML: &str = r#"<!doctype html>
<html>
  <head><title>duomail</title></head>
  <body style="font-family: sans-serif;">
    <h2>You can close this window</h2>
    <p>Return to the terminal to finish setup.</p>
  </body>
</html>
"#;

#[derive(Clone)]
struct CallbackState {
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>,
}

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    let account_arg = parse_account_arg(env::args().skip(1))?;
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;
    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;
    let accounts = AccountRepository::new(db);

    if let Some(account_id) = &account_arg {
        // Fail before opening a browser when the account is unknown.
        accounts.get_by_id(account_id).await?;
    }

    let http = reqwest::Client::builder()
        .timeout(config.gmail.request_timeout())
        .build()?;
    let credentials = CredentialManager::new(
        config.auth.secret_store(),
        Arc::new(config.gmail.oauth_client(http.clone())),
        config.auth.credential_settings(),
    );
    let gmail = config.gmail.client(http);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let redirect_uri = format!("http://127.0.0.1:{}{}", listener.local_addr()?.port(), CALLBACK_PATH);

    let (sender, receiver) = oneshot::channel();
    let state = CallbackState {
        sender: Arc::new(Mutex::new(Some(sender))),
    };
    let app = Router::new()
        .route(CALLBACK_PATH, get(oauth_callback))
        .with_state(state);
    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let token = server_shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }
    });

    let request = credentials.begin_authorization(&redirect_uri, account_arg.as_deref());
    println!("Opening browser for Google consent...");
    if let Err(err) = maybe_open_browser(&request.url) {
        eprintln!("Could not open browser automatically: {err}. Please open the URL manually.");
    }
    println!(
        "If the browser did not open, paste this into a new tab:\n{}\n",
        request.url
    );
    println!("Listening on {redirect_uri} for the OAuth callback...\n");

    let params = match time::timeout(CALLBACK_TIMEOUT, receiver).await {
        Ok(Ok(params)) => params,
        Ok(Err(_)) => return Err("callback listener stopped before a response arrived".into()),
        Err(_) => return Err("Timed out waiting for OAuth callback (5 minutes)".into()),
    };
    server_shutdown.cancel();
    if let Ok(Err(err)) = server.await {
        warn!(error = %err, "callback listener exited with error");
    }

    let completed = credentials.complete_authorization(&params).await?;
    if let Some(account_id) = completed.account_id {
        info!(account_id = %account_id, "account re-authorized");
        println!("Re-authorized account {account_id}.");
        return Ok(());
    }

    let profile = gmail
        .get_profile(&AccessToken::new(completed.tokens.access_token.clone()))
        .await?;
    let account = match accounts.get_by_email(&profile.email_address).await {
        Ok(account) => account,
        Err(AccountError::NotFound(_)) => {
            accounts
                .create(
                    profile.email_address.clone(),
                    profile.email_address.clone(),
                    None,
                )
                .await?
        }
        Err(err) => return Err(err.into()),
    };
    credentials
        .store_tokens(&account.id, completed.tokens)
        .await?;

    info!(account_id = %account.id, email = %account.email, "account authorized");
    println!("Authorized {} as account {}.", account.email, account.id);
    Ok(())
}

async fn oauth_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    let failed = params.error.clone();
    let sender = state
        .sender
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    let Some(sender) = sender else {
        return (StatusCode::CONFLICT, Html("This authorization has already completed.".to_string()));
    };
    let _ = sender.send(params);

    match failed {
        Some(error) => (
            StatusCode::BAD_REQUEST,
            Html(format!("Authorization failed: {error}. Return to the terminal.")),
        ),
        None => (StatusCode::OK, Html(SUCCESS_HTML.to_string())),
    }
}

fn parse_account_arg(mut args: impl Iterator<Item = String>) -> Result<Option<String>, AnyError> {
    let mut account = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--account" => match args.next() {
                Some(id) if !id.trim().is_empty() => account = Some(id),
                _ => return Err("--account requires an account id".into()),
            },
            other => return Err(format!("unexpected argument: {other}").into()),
        }
    }
    Ok(account)
}

fn maybe_open_browser(url: &str) -> Result<(), AnyError> {
    let mut command = if cfg!(target_os = "macos") {
        let mut cmd = Command::new("open");
        cmd.arg(url);
        cmd
    } else if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "start", "", url]);
        cmd
    } else {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(url);
        cmd
    };

    let status = command.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("browser command exited with {status}").into())
    }
}
