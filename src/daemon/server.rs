use super::connector::{ActiveChecks, ConnectorSettings, ServerConnector};
use super::listener::{ListenerContext, PassiveListener};
use super::registry::ServiceRegistry;
use super::status::StatusChannel;
use crate::config::AgentConfig;
use crate::scheduler::builtin::local_scheduler;
use crate::scheduler::procfs::{FileSource, OsFiles};
use crate::scheduler::{LocalScheduler, Scheduler};
use crate::value::CheckResult;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use crate::plugin::{launch_plugin, PluginCodec, PluginProcess};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const CONTROL_HELP: &str = "\
Remote control interface, available commands:
\tversion - display the agent version
\tmetrics - list available metrics and their request counters
\tactive_checks - list active checks received from the server
\thelp - display this help message";

pub struct Agent {
    config: AgentConfig,
    files: Arc<dyn FileSource>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            files: Arc::new(OsFiles),
        }
    }

    /// Read `/proc`-style files through `files` instead of the filesystem.
    pub fn with_files(mut self, files: Arc<dyn FileSource>) -> Self {
        self.files = files;
        self
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let signals = Signals::install()?;
        self.run_until(signals.recv()).await
    }

    /// Run until `shutdown` resolves, then stop every service and wait for
    /// all of them to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(version = VERSION, hostname = %self.config.hostname, "hostagent starting");
        let config = &self.config;
        let registry = ServiceRegistry::new();

        let scheduler = Arc::new(
            local_scheduler(&config.hostname, Arc::clone(&self.files))
                .context("Failed to register built-in metrics")?,
        );
        #[cfg(unix)]
        let plugins = start_plugins(config, &scheduler).await;

        let ctx = Arc::new(ListenerContext {
            scheduler: Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            timeout: config.timeout(),
            allowed_peers: config.allowed_peers.clone(),
        });
        let mut listener = PassiveListener::start(config.listen, ctx, &registry)
            .await
            .with_context(|| format!("Failed to listen on {}", config.listen))?;

        let mut connector = ServerConnector::new(ConnectorSettings {
            server: config.server.clone(),
            hostname: config.hostname.clone(),
            timeout: config.timeout(),
            refresh: config.refresh_active_checks(),
        });
        connector.start(&registry);

        #[cfg(unix)]
        let mut control = {
            let (channel, rx) =
                super::control::ControlChannel::bind(&config.control_socket, config.timeout(), &registry)
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to open control socket {}",
                            config.control_socket.display()
                        )
                    })?;
            spawn_control_consumer(
                rx,
                Arc::clone(&scheduler),
                connector.active_checks(),
                &registry,
            );
            channel
        };

        let mut status = match &config.status {
            Some(status_config) => Some(
                StatusChannel::start(
                    status_config,
                    status_summary(config),
                    Arc::clone(&scheduler) as Arc<dyn Scheduler>,
                    &registry,
                )
                .await
                .with_context(|| format!("Failed to listen on {}", status_config.listen))?,
            ),
            None => None,
        };

        info!(services = registry.active_count(), "hostagent ready");
        shutdown.await;
        info!("Shutting down");

        listener.stop().await;
        connector.stop().await;
        #[cfg(unix)]
        control.stop().await;
        if let Some(status) = status.as_mut() {
            status.stop().await;
        }

        #[cfg(unix)]
        for plugin in plugins {
            plugin.shutdown(config.timeout()).await;
        }

        registry.wait().await;
        info!("hostagent stopped");
        Ok(())
    }
}

/// Evaluate one key against the built-in and plugin metrics, then exit.
pub async fn test_key(config: &AgentConfig, key: &str) -> Result<CheckResult> {
    let scheduler = Arc::new(
        local_scheduler(&config.hostname, Arc::new(OsFiles))
            .context("Failed to register built-in metrics")?,
    );
    #[cfg(unix)]
    let plugins = start_plugins(config, &scheduler).await;

    let result = scheduler.perform_task(key, config.timeout()).await;

    #[cfg(unix)]
    for plugin in plugins {
        plugin.shutdown(config.timeout()).await;
    }
    Ok(result)
}

/// Launch configured plugins and route their metrics. A plugin that fails to
/// start is logged and skipped.
#[cfg(unix)]
async fn start_plugins(config: &AgentConfig, scheduler: &LocalScheduler) -> Vec<PluginProcess> {
    if config.plugins.is_empty() {
        return Vec::new();
    }

    let codec = Arc::new(PluginCodec::new());
    let socket_dir = crate::clienv::plugin_socket_dir();
    let mut started = Vec::new();

    for plugin in &config.plugins {
        let process = match launch_plugin(
            &plugin.name,
            &plugin.path,
            &socket_dir,
            Arc::clone(&codec),
            config.timeout(),
        )
        .await
        {
            Ok(process) => process,
            Err(e) => {
                error!(plugin = %plugin.name, "Failed to start plugin: {}", e);
                continue;
            }
        };

        for metric in &process.metrics {
            if let Err(e) = scheduler.register(metric, Arc::clone(&process.collector) as _) {
                warn!(plugin = %plugin.name, "{}", e);
            }
        }
        info!(
            plugin = %plugin.name,
            pid = ?process.pid(),
            metrics = process.metrics.len(),
            "Plugin started"
        );
        started.push(process);
    }
    started
}

#[cfg(unix)]
fn spawn_control_consumer(
    mut rx: tokio::sync::mpsc::Receiver<super::control::Client>,
    scheduler: Arc<LocalScheduler>,
    checks: ActiveChecks,
    registry: &ServiceRegistry,
) {
    let handle = registry.register("control consumer");
    tokio::spawn(async move {
        while let Some(mut client) = rx.recv().await {
            let reply = control_response(client.request(), scheduler.as_ref(), &checks).await;
            if let Err(e) = client.reply(&reply).await {
                warn!(command = %client.request(), "Cannot reply to control command: {}", e);
            }
            client.close().await;
        }
        debug!("Control consumer stopped");
        drop(handle);
    });
}

/// Text answer to one control command.
pub async fn control_response(
    command: &str,
    scheduler: &dyn Scheduler,
    checks: &ActiveChecks,
) -> String {
    match command {
        "version" => format!("hostagent {}", VERSION),
        "help" => CONTROL_HELP.to_string(),
        "metrics" => scheduler.query("metrics"),
        "active_checks" => {
            let checks = checks.read().await;
            if checks.is_empty() {
                return "no active checks".to_string();
            }
            checks
                .iter()
                .map(|check| format!("{:<32} {}\n", check.key, check.delay))
                .collect()
        }
        other => format!("Unknown command \"{}\"", other),
    }
}

fn status_summary(config: &AgentConfig) -> String {
    format!(
        "hostagent {}\nhostname: {}\nlisten: {}\nserver: {}\ntimeout: {}s\nplugins: {}\n",
        VERSION,
        config.hostname,
        config.listen,
        config.server.as_deref().unwrap_or("-"),
        config.timeout_secs,
        config.plugins.len()
    )
}

#[cfg(unix)]
struct Signals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigterm: signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?,
            sigint: signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?,
        })
    }

    async fn recv(mut self) {
        tokio::select! {
            _ = self.sigterm.recv() => info!("Received SIGTERM"),
            _ = self.sigint.recv() => info!("Received SIGINT"),
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C");
    }
}
