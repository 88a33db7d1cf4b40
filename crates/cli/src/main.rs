use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use fred::interfaces::ClientLike;
use mycelium_auth::ApiKeyRecord;
use mycelium_bus::{Bus, NatsBus};
use mycelium_gateway::router::AppState;
use mycelium_gateway::{hub::Hub, router, shutdown};
use mycelium_store::{RedisCounterStore, SqliteApiKeyStore};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "mycelium", about = "Realtime pub/sub gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, env = "JSON_LOGS", default_value_t = false)]
    json_logs: bool,

    // Gateway arguments, used when no subcommand is given (or with `serve`).
    #[arg(long, global = true, env = "PORT", default_value_t = 8080)]
    port: u16,
    #[arg(long, global = true, env = "DATABASE_URL", default_value = "sqlite::memory:")]
    database_url: String,
    #[arg(long, global = true, env = "REDIS_ADDRESS", default_value = "127.0.0.1:6379")]
    redis_address: String,
    #[arg(long, global = true, env = "REDIS_PASSWORD")]
    redis_password: Option<String>,
    #[arg(long, global = true, env = "NATS_HOST", default_value = "127.0.0.1:4222")]
    nats_host: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server (default when no subcommand is provided).
    Serve,
    /// Insert or replace an api key in the tenant store.
    Seed(SeedArgs),
}

struct ServeArgs {
    port: u16,
    database_url: String,
    redis_address: String,
    redis_password: Option<String>,
    nats_host: String,
}

#[derive(Args)]
struct SeedArgs {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite::memory:")]
    database_url: String,
    #[arg(long)]
    id: String,
    #[arg(long)]
    secret: String,
    #[arg(long)]
    app_id: String,
    /// JSON object mapping `"*"` or a channel name to a CSV capability list,
    /// e.g. `{"*":"subscribe,publish"}`.
    #[arg(long)]
    capabilities: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command {
        None | Some(Commands::Serve) => {
            serve(ServeArgs {
                port: cli.port,
                database_url: cli.database_url,
                redis_address: cli.redis_address,
                redis_password: cli.redis_password,
                nats_host: cli.nats_host,
            })
            .await
        },
        Some(Commands::Seed(args)) => seed(args).await,
    }
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let pool = sqlx::SqlitePool::connect(&args.database_url).await?;
    SqliteApiKeyStore::init(&pool).await?;
    let api_key_store: Arc<dyn mycelium_auth::ApiKeyStore> = Arc::new(SqliteApiKeyStore::new(pool));

    let redis_url = match &args.redis_password {
        Some(password) => format!("redis://:{password}@{}", args.redis_address),
        None => format!("redis://{}", args.redis_address),
    };
    let redis_config = fred::types::config::Config::from_url(&redis_url)?;
    let redis_client = fred::clients::Client::new(redis_config, None, None, None);
    redis_client.init().await?;
    let counters = Arc::new(RedisCounterStore::new(redis_client));

    let bus: Arc<dyn Bus> = Arc::new(NatsBus::connect(&args.nats_host).await?);

    let hub = Arc::new(Hub::new(counters));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(bus_relay_task(Arc::clone(&bus), Arc::clone(&hub)));
    tokio::spawn(shutdown::run(shutdown_tx, Arc::clone(&hub)));

    let state = AppState {
        hub,
        api_key_store,
        bus,
        shutdown: shutdown_rx,
    };
    let app = router::build(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn bus_relay_task(bus: Arc<dyn Bus>, hub: Arc<Hub>) {
    if let Err(e) = mycelium_gateway::bus_relay::run(bus, hub).await {
        tracing::error!(error = %e, "bus relay terminated");
    }
}

async fn seed(args: SeedArgs) -> anyhow::Result<()> {
    serde_json::from_str::<serde_json::Value>(&args.capabilities)?;
    let pool = sqlx::SqlitePool::connect(&args.database_url).await?;
    SqliteApiKeyStore::init(&pool).await?;
    let store = SqliteApiKeyStore::new(pool);
    store
        .upsert(&ApiKeyRecord {
            id: args.id.clone(),
            secret: args.secret,
            capabilities: args.capabilities,
            app_id: args.app_id,
        })
        .await?;
    tracing::info!(id = %args.id, "api key seeded");
    Ok(())
}
