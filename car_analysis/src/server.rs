use crate::{
    analyzer::ImageAnalyzer,
    config::ServerConfig,
    model_service::{Captioner, Detector},
    routes::api_routes,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

#[derive(Clone)]
pub struct SharedState<D: Detector, C: Captioner> {
    pub analyzer: ImageAnalyzer<D, C>,
    pub metrics: Arc<Metrics>,
}

pub fn build_router<D: Detector, C: Captioner>(
    state: SharedState<D, C>,
    max_upload_bytes: usize,
) -> Router {
    Router::new()
        .merge(api_routes())
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<D: Detector, C: Captioner>(
        analyzer: ImageAnalyzer<D, C>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let addr = config.get_address();

        let metrics = Arc::new(Metrics::new()?);
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let app_state = SharedState { analyzer, metrics };

        let router = build_router(app_state, config.max_upload_bytes).layer(metrics_layer);

        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
