use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use compass_backend::services::{
    EmailService, EntityStore, InMemoryEntityStore, LogMailer, Mailer, PgEntityStore, WebhookClient,
};
use compass_backend::workflows::{InMemoryStore, PgWorkflowStore};
use compass_backend::{app, build_engine, config, database, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,compass_backend=debug")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;

    let mailer: Arc<dyn Mailer> = if config.smtp.is_configured() {
        tracing::info!("SMTP configured via {}:{}", config.smtp.host, config.smtp.port);
        Arc::new(EmailService::new(&config.smtp))
    } else {
        tracing::warn!("SMTP not configured, workflow emails will only be logged");
        Arc::new(LogMailer)
    };
    let webhooks = WebhookClient::new(config.webhook_timeout(), config.webhook_signature_header.clone());

    let state = match &config.database_url {
        Some(url) => {
            let db_pool = database::create_pool(url).await?;
            database::migrate(&db_pool).await?;

            let entities: Arc<dyn EntityStore> = Arc::new(PgEntityStore::new(db_pool.clone()));
            let store = Arc::new(PgWorkflowStore::new(db_pool.clone()));
            AppState::new(build_engine(store, entities, mailer, webhooks), Some(db_pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage");
            let entities: Arc<dyn EntityStore> = InMemoryEntityStore::new();
            let store = Arc::new(InMemoryStore::new());
            AppState::new(build_engine(store, entities, mailer, webhooks), None)
        }
    };

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Compass automation server running on {}", config.server_addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
