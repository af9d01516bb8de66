use chatwire::db::{init_db, sweep_stale_streams};
use chatwire::hardening::RetryPolicy;
use chatwire::server::router;
use chatwire::store::SqliteMessageStore;
use chatwire::uploader::FsImageUploader;
use chatwire::upstream::{OpenAiCompatProvider, UpstreamConfig};
use chatwire::{AppState, Args};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let _guard = chatwire::logging::init_tracing(&args.log_dir);
    chatwire::logging::setup_panic_hook();

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };
    match sweep_stale_streams(&db, args.stale_stream_hours).await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Recovered {} abandoned streams", n),
        Err(e) => tracing::warn!("Stale stream sweep failed: {}", e),
    }

    let api_key = match std::env::var("UPSTREAM_API_KEY") {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: UPSTREAM_API_KEY environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let provider = OpenAiCompatProvider::new(
        client,
        UpstreamConfig {
            base_url: args.upstream_base_url.clone(),
            api_key,
        },
        RetryPolicy::default(),
    );
    let store = SqliteMessageStore::new(db);
    let uploader = FsImageUploader::new(&args.upload_dir);

    let addr = format!("{}:{}", args.host, args.port);
    let state = Arc::new(AppState::build(
        args,
        Arc::new(store),
        Arc::new(provider),
        Arc::new(uploader),
    ));
    let tasks = state.tasks.clone();
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("chatwire listening on {}", addr);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown requested; draining streams");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
    }

    tasks.close();
    if tokio::time::timeout(Duration::from_secs(10), tasks.wait())
        .await
        .is_err()
    {
        tracing::warn!("Gave up waiting for {} stream tasks", tasks.len());
    }
}
