use crate::analyzer::ImageAnalyzer;
use crate::config::Config;
use crate::ort_captioner::OrtCaptioner;
use crate::ort_detector::OrtDetector;
use crate::server::HttpServer;

use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let detector = match OrtDetector::new(&config.detector, &config.runtime) {
        Ok(detector) => detector,
        Err(e) => {
            tracing::error!("Failed to initialize detector: {:?}", e);
            return Err(e.into());
        }
    };

    let captioner = match OrtCaptioner::new(&config.captioner, &config.runtime) {
        Ok(captioner) => captioner,
        Err(e) => {
            tracing::error!("Failed to initialize captioner: {:?}", e);
            return Err(e);
        }
    };

    let analyzer = ImageAnalyzer::new(detector, captioner, &config.analysis);
    let server = HttpServer::new(analyzer, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
