use axum::Router;
use axum::routing::{get, post};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway::cluster::ClusterManager;
use gateway::config::Config;
use gateway::handlers;
use gateway::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("gateway.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Box::leak(Box::new(_guard));
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("gateway starting up");
    tracing::info!("configuration loaded successfully");

    let cluster = ClusterManager::new();
    cluster.initialize(&config.cluster).await.map_err(|e| format!("failed to initialize cluster: {e}"))?;
    tracing::info!(node_count = cluster.node_count().await, "cluster initialized");

    let app_state = AppState::new(config.clone(), cluster.clone());

    // The circuit-breaker metrics endpoint is internal and must not carry
    // CORS headers, so it's composed outside the permissive CORS layer.
    let public_routes = Router::new()
        .route("/v1/messages", post(handlers::messages::create_message))
        .route("/v1/models", get(handlers::models::list_models))
        .route("/health", get(health_check))
        .layer(tower_http::cors::CorsLayer::permissive());

    let internal_routes =
        Router::new().route("/v1/circuit-breaker/metrics", get(handlers::metrics::get_circuit_breaker_metrics));

    let app = public_routes
        .merge(internal_routes)
        .with_state(app_state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cluster))
        .await?;

    Ok(())
}

async fn shutdown_signal(cluster: std::sync::Arc<ClusterManager>) {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining cluster manager");
    cluster.shutdown().await;
}

async fn health_check() -> &'static str {
    "OK"
}
