use super::registry::ServiceRegistry;
use crate::error::{AgentError, Result};
use crate::protocol::MessageFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Messages accepted by the connector loop.
#[derive(Debug)]
pub enum ConnectorMessage {
    Stop,
}

/// One item the server wants pushed on the agent's own schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCheck {
    pub key: String,
    pub delay: Delay,
}

/// Servers send the delay either as a number of seconds or as text
/// (`"30s"`, flexible intervals).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Delay {
    Seconds(u64),
    Text(String),
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::Seconds(secs) => write!(f, "{}s", secs),
            Delay::Text(text) => f.write_str(text),
        }
    }
}

/// Latest active-check list, shared with the control channel.
pub type ActiveChecks = Arc<RwLock<Vec<ActiveCheck>>>;

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Active checks are not fetched when unset.
    pub server: Option<String>,
    pub hostname: String,
    pub timeout: Duration,
    pub refresh: Duration,
}

#[derive(Serialize)]
struct ActiveChecksRequest<'a> {
    request: &'static str,
    host: &'a str,
}

#[derive(Deserialize)]
struct ActiveChecksResponse {
    response: String,
    #[serde(default)]
    info: Option<String>,
    #[serde(default)]
    data: Vec<ActiveCheck>,
}

/// Background poller for the server's active-check list.
pub struct ServerConnector {
    settings: Arc<ConnectorSettings>,
    checks: ActiveChecks,
    tx: Option<mpsc::Sender<ConnectorMessage>>,
    task: Option<JoinHandle<()>>,
}

impl ServerConnector {
    pub fn new(settings: ConnectorSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            checks: Arc::new(RwLock::new(Vec::new())),
            tx: None,
            task: None,
        }
    }

    pub fn active_checks(&self) -> ActiveChecks {
        Arc::clone(&self.checks)
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    pub fn start(&mut self, registry: &ServiceRegistry) {
        if self.tx.is_some() {
            warn!("Server connector already started");
            return;
        }

        let (tx, rx) = mpsc::channel(1);
        let handle = registry.register("server connector");
        let settings = Arc::clone(&self.settings);
        let checks = Arc::clone(&self.checks);

        self.task = Some(tokio::spawn(async move {
            run(settings, checks, rx).await;
            drop(handle);
        }));
        self.tx = Some(tx);
    }

    /// Deliver the stop message and wait for the loop to exit.
    pub async fn stop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        if tx.send(ConnectorMessage::Stop).await.is_err() {
            debug!("Server connector already exited");
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Server connector task failed: {}", e);
            }
        }
    }
}

async fn run(
    settings: Arc<ConnectorSettings>,
    checks: ActiveChecks,
    mut rx: mpsc::Receiver<ConnectorMessage>,
) {
    info!(
        server = settings.server.as_deref().unwrap_or("-"),
        refresh = ?settings.refresh,
        "Server connector started"
    );

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_refresh: Option<Instant> = None;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(ConnectorMessage::Stop) => debug!("Server connector received stop"),
                    None => debug!("Server connector channel closed"),
                }
                break;
            }
            _ = ticker.tick() => {
                let due = last_refresh.map_or(true, |at| at.elapsed() >= settings.refresh);
                if due {
                    last_refresh = Some(Instant::now());
                    refresh_active_checks(&settings, &checks).await;
                }
            }
        }
    }

    rx.close();
    info!("Server connector stopped");
}

async fn refresh_active_checks(settings: &ConnectorSettings, checks: &ActiveChecks) {
    let Some(server) = settings.server.as_deref() else {
        trace!("No server configured, skipping active checks refresh");
        return;
    };

    debug!(server = %server, "Refreshing active checks");
    match fetch_active_checks(server, &settings.hostname, settings.timeout).await {
        Ok(list) => {
            info!(server = %server, count = list.len(), "Active checks refreshed");
            *checks.write().await = list;
        }
        Err(e) => warn!(server = %server, "Cannot get active checks: {}", e),
    }
}

/// Ask `server` for the active checks assigned to `hostname`.
pub async fn fetch_active_checks(
    server: &str,
    hostname: &str,
    timeout: Duration,
) -> Result<Vec<ActiveCheck>> {
    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(server)).await {
        Ok(conn) => conn?,
        Err(_) => return Err(AgentError::timeout("connect", timeout)),
    };

    let request = serde_json::to_vec(&ActiveChecksRequest {
        request: "active checks",
        host: hostname,
    })?;
    MessageFrame::write(&mut stream, &request, timeout).await?;

    let payload = MessageFrame::read(&mut stream, timeout).await?;
    if payload.is_empty() {
        return Err(AgentError::protocol("server closed the connection without a reply"));
    }

    let response: ActiveChecksResponse = serde_json::from_slice(&payload)?;
    if response.response != "success" {
        return Err(AgentError::application(
            response
                .info
                .unwrap_or_else(|| format!("server answered \"{}\"", response.response)),
        ));
    }
    Ok(response.data)
}
