//! Shiftwise API server

use tracing_subscriber::EnvFilter;

use shiftwise_api::{routes, AppState, Config};
use shiftwise_billing::StripeClient;
use shiftwise_shared::{create_migration_pool, create_pool, run_migrations};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    // Migrations run on a dedicated single-connection pool with longer timeouts
    let migration_pool = create_migration_pool(&config.database_url).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = create_pool(&config.database_url).await?;
    let stripe = StripeClient::from_env()?;

    let state = AppState::new(pool, config, stripe);
    let bind_address = state.config.bind_address.clone();
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "Shiftwise API listening");

    axum::serve(listener, app).await?;

    Ok(())
}
