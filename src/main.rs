use anyhow::{Context, Result};

use volai::api::{router, AppState};
use volai::config::Config;
use volai::registry::ModelRegistry;
use volai::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required by rustls 0.23+)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Set VOLAI_CONFIG or provide config/default.toml");
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let store = Store::new(&config.storage.database_path);
    store.init().context("failed to initialize database")?;
    ModelRegistry::new(&config.storage.models_dir)
        .ensure_dir()
        .context("failed to create models directory")?;

    let bind = config.server.bind.clone();
    tracing::info!(
        bind = %bind,
        database = %config.storage.database_path.display(),
        models_dir = %config.storage.models_dir.display(),
        chat = config.notifier.webhook_url.is_some(),
        email = config.notifier.smtp.is_some(),
        messaging = config.notifier.messaging_token.is_some(),
        "Starting volai"
    );

    let app = router(AppState::from_config(config));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;
    Ok(())
}
