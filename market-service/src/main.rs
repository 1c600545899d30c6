use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use market_service::api::{self, AppState};
use market_service::auth::TokenVerifier;
use market_service::memory::MemStore;
use market_service::pg::{DbPool, PgStore};
use market_service::purchase::PurchaseEngine;
use market_service::store::LedgerStore;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Parser)]
#[command(name = "market-service")]
struct Args {
    /// Postgres connection string; omit to run on the in-memory ledger
    /// store with seeded demo listings
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "JWT_SECRET", default_value = "devsecret")]
    jwt_secret: String,

    #[arg(long, env = "PORT", default_value = "8000")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    match args.database_url.clone() {
        Some(database_url) => {
            info!("Running database migrations...");
            let mut conn = PgConnection::establish(&database_url)?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
            info!("Migrations completed successfully");

            let config =
                AsyncDieselConnectionManager::<AsyncPgConnection>::new(&database_url);
            let pool: DbPool = diesel_async::pooled_connection::bb8::Pool::builder()
                .build(config)
                .await?;
            serve(PgStore::new(pool), &args).await
        }
        None => {
            info!("No database configured, serving demo listings from the in-memory store");
            let store = MemStore::new();
            seed_demo(&store).await;
            serve(store, &args).await
        }
    }
}

async fn seed_demo(store: &MemStore) {
    store.add_listing(1, 1, 5, 100).await;
    store.add_listing(1, 2, 12, 40).await;
    store.add_listing(1, 3, 30, 10).await;
    let account = store.add_account(1, 1_000).await;
    info!(account, "seeded demo wallet for buyer 1");
}

async fn serve<S: LedgerStore>(store: S, args: &Args) -> Result<()> {
    let state = AppState {
        engine: PurchaseEngine::new(store),
        verifier: TokenVerifier::new(&args.jwt_secret),
    };
    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Market service listening on http://0.0.0.0:{}", args.port);
    axum::serve(listener, app).await?;

    Ok(())
}
