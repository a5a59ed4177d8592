//! HTTP status page: a free-text summary followed by the scheduler's
//! `metrics` diagnostic.

use super::registry::ServiceRegistry;
use crate::config::StatusConfig;
use crate::error::Result;
use crate::scheduler::Scheduler;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

struct StatusState {
    summary: String,
    scheduler: Arc<dyn Scheduler>,
}

pub struct StatusChannel {
    local_addr: SocketAddr,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StatusChannel {
    pub async fn start(
        config: &StatusConfig,
        summary: String,
        scheduler: Arc<dyn Scheduler>,
        registry: &ServiceRegistry,
    ) -> Result<Self> {
        let state = Arc::new(StatusState { summary, scheduler });
        let app = Router::new()
            .route(&config.path, get(status_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(config.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, path = %config.path, "Status endpoint listening");

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = registry.register("status channel");
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = stop_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Status endpoint failed: {}", e);
            }
            drop(handle);
        });

        Ok(Self {
            local_addr,
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Status endpoint task failed: {}", e);
            }
        }
    }
}

async fn status_handler(State(state): State<Arc<StatusState>>) -> String {
    let mut body = state.summary.clone();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    body.push('\n');
    body.push_str(&state.scheduler.query("metrics"));
    body
}
