use std::env;
use std::sync::Arc;

use duomail_core::credentials::CredentialManager;
use duomail_core::protocol::transport::{serve_stdio, serve_unix};
use duomail_core::spool::AttachmentSpool;
use duomail_core::sync::{SyncCoordinator, SyncEvent, SyncScheduler};
use duomail_core::{
    AccountRepository, Config, Database, Dispatcher, EmailRepository, LabelRepository,
    init_telemetry, migrations,
};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type AnyError = Box<dyn std::error::Error + Send + Sync>;

struct Services {
    accounts: AccountRepository,
    coordinator: SyncCoordinator,
    dispatcher: Dispatcher,
}

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let services = build_services(&config, db)?;
    let shutdown = CancellationToken::new();

    let scheduler = SyncScheduler::new(services.coordinator.clone(), shutdown.child_token());
    let accounts = services.accounts.list_all().await?;
    if accounts.is_empty() {
        warn!("no accounts configured; run duomail-authorize to add one");
    }
    for account in &accounts {
        scheduler.spawn_account(&account.id);
    }
    let events = tokio::spawn(log_sync_events(services.coordinator.clone(), shutdown.clone()));

    let socket = config.protocol.socket_path.clone().map(|path| {
        let dispatcher = services.dispatcher.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move { serve_unix(dispatcher, &path, shutdown).await })
    });

    let stdio = {
        let dispatcher = services.dispatcher.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(serve_stdio(dispatcher, shutdown))
    };

    info!(
        accounts = accounts.len(),
        socket = socket.is_some(),
        "duomail server started"
    );

    if socket.is_some() {
        shutdown_signal(shutdown.clone()).await;
    } else {
        // With stdio as the only transport the client closing stdin ends the process.
        tokio::select! {
            _ = shutdown_signal(shutdown.clone()) => {}
            result = stdio => match result {
                Ok(Ok(())) => info!("stdio client disconnected, shutting down"),
                Ok(Err(err)) => error!(error = %err, "stdio transport failed"),
                Err(err) => error!(error = %err, "stdio task panicked"),
            },
        }
    }

    shutdown.cancel();
    scheduler.shutdown().await;
    if let Some(socket) = socket {
        match socket.await {
            Ok(Err(err)) => error!(error = %err, "socket transport failed"),
            Err(err) => error!(error = %err, "socket task panicked"),
            Ok(Ok(())) => {}
        }
    }
    let _ = events.await;
    duomail_core::telemetry::shutdown_telemetry();
    Ok(())
}

fn build_services(config: &Config, db: Database) -> Result<Services, AnyError> {
    let http = reqwest::Client::builder()
        .timeout(config.gmail.request_timeout())
        .build()?;

    let credentials = CredentialManager::new(
        config.auth.secret_store(),
        Arc::new(config.gmail.oauth_client(http.clone())),
        config.auth.credential_settings(),
    );
    let remote = Arc::new(config.gmail.client(http));
    let store = Arc::new(EmailRepository::new(db.clone()));
    let accounts = AccountRepository::new(db.clone());
    let labels = LabelRepository::new(db);

    let coordinator = SyncCoordinator::new(
        accounts.clone(),
        labels.clone(),
        store.clone(),
        remote.clone(),
        credentials.clone(),
        config.sync.settings(),
    );
    let dispatcher = Dispatcher::new(
        accounts.clone(),
        labels,
        store,
        remote,
        credentials,
        AttachmentSpool::new(config.paths.attachment_spool.clone()),
        config.protocol.settings(),
    );

    Ok(Services {
        accounts,
        coordinator,
        dispatcher,
    })
}

async fn log_sync_events(coordinator: SyncCoordinator, shutdown: CancellationToken) {
    let mut events = coordinator.subscribe();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SyncEvent::Completed { report, .. }) => debug!(
                account_id = %report.account_id,
                applied = report.applied,
                dropped = report.dropped,
                evicted = report.evicted,
                "sync completed"
            ),
            Ok(SyncEvent::Failed { account_id, error }) => {
                debug!(account_id = %account_id, error = %error, "sync failed")
            }
            Ok(SyncEvent::Started { .. }) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "sync event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}
