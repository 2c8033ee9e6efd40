use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waste_classifier::config::Config;
use waste_classifier::services::classifier::model_manager::ModelManager;
use waste_classifier::{construct_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting waste classifier service");

    let config = Config::from_env()?;
    tracing::info!(
        "Loaded configuration: model={}, gpu={}",
        config.model_id,
        config.use_gpu
    );

    let model_manager = ModelManager::new(&config.model_dir, &config.model_id, &config.model_base_url);
    if !model_manager.is_downloaded() {
        if !config.auto_download {
            return Err(format!(
                "Model files missing in {} and MODEL_AUTO_DOWNLOAD is off",
                model_manager.model_dir.display()
            )
            .into());
        }
        model_manager.download_model().await?;
    }

    let model = model_manager
        .load_model(config.use_gpu, config.intra_threads)
        .await?;
    let app = construct_router(AppState::new(Arc::new(model)));

    let addr = config.bind_addr();
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
