use collabsync::config::Config;
use collabsync::relay;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let state = relay::AppState::new(config.channel_capacity);

    let app = relay::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, render_interval_ms = config.session.render_interval.as_millis(), "relay listening");
    axum::serve(listener, app).await.expect("server failed");
}
