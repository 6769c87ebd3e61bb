use lms_auth::{app, config, initialize_state, telemetry};

#[tokio::main]
async fn main() {
    telemetry::setup_logging();

    // Read configuration file.
    let config = match config::Configuration::default().read() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid `url` on configuration");
            std::process::exit(1);
        },
    };

    let mut state = match initialize_state(config.clone()) {
        Ok(state) => state,
        Err(err) => {
            // Tokens cannot be issued nor verified, nothing to serve.
            tracing::error!(error = %err, "cannot initialize state");
            std::process::exit(1);
        },
    };

    match telemetry::setup_metrics_recorder() {
        Ok(handle) => state.metrics = Some(handle),
        Err(err) => tracing::warn!(error = %err, "prometheus recorder not installed"),
    }

    let listener = match tokio::net::TcpListener::bind(&config.address).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(address = %config.address, error = %err, "cannot bind address");
            std::process::exit(1);
        },
    };
    tracing::info!(address = %config.address, version = config.version(), "server started");

    if let Err(err) = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %err, "server stopped unexpectedly");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
