//! External plugin processes
//!
//! A plugin is a separate executable hosting one or more collectors. The
//! agent starts it with the path of a private Unix socket as its only
//! argument; the plugin connects back and the two sides speak the
//! length-prefixed JSON protocol in [`comms`].
//!
//! ```text
//! agent                          plugin
//!   | -- RegisterRequest  -------> |
//!   | <------- RegisterResponse -- |   (metric keys)
//!   | -- ExportRequest    -------> |
//!   | <---------------- Log ------ |   (any time)
//!   | <------- ExportResponse ---- |   (same id as the request)
//!   | -- Terminate        -------> |
//! ```

pub mod broker;
pub mod comms;

pub use broker::PluginBroker;
pub use comms::{GlobalOptions, MessageType, PluginCodec};

use crate::error::{AgentError, Result};
use crate::scheduler::Collector;
use crate::value::CheckValue;
use async_trait::async_trait;
use std::time::Duration;

/// Routes scheduler requests for a plugin's metrics to its broker.
///
/// Requests are not serialized: the broker matches each response to its
/// caller by id, so concurrent checks share one connection.
pub struct PluginCollector {
    name: String,
    broker: PluginBroker,
}

impl PluginCollector {
    pub fn new(broker: PluginBroker) -> Self {
        Self {
            name: broker.name().to_string(),
            broker,
        }
    }

    pub async fn terminate(&self) -> Result<()> {
        self.broker.terminate().await
    }
}

#[async_trait]
impl Collector for PluginCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(
        &self,
        key: &str,
        params: &[String],
        timeout: Duration,
    ) -> Result<Option<CheckValue>> {
        self.broker.export(key, params, timeout).await
    }
}

#[cfg(unix)]
pub use process::{launch_plugin, PluginProcess};

#[cfg(unix)]
mod process {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::process::Stdio;
    use std::sync::Arc;
    use tokio::net::UnixListener;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// A running plugin executable and its registered collector.
    pub struct PluginProcess {
        pub name: String,
        pub metrics: Vec<String>,
        pub collector: Arc<PluginCollector>,
        child: Child,
    }

    impl PluginProcess {
        pub fn pid(&self) -> Option<u32> {
            self.child.id()
        }

        /// Ask the plugin to exit, then reap it; kill if it lingers.
        pub async fn shutdown(mut self, timeout: Duration) {
            if let Err(e) = self.collector.terminate().await {
                warn!(plugin = %self.name, "Failed to send terminate request: {}", e);
            }
            match tokio::time::timeout(timeout, self.child.wait()).await {
                Ok(Ok(status)) => debug!(plugin = %self.name, %status, "Plugin exited"),
                Ok(Err(e)) => warn!(plugin = %self.name, "Failed to wait for plugin: {}", e),
                Err(_) => {
                    warn!(plugin = %self.name, "Plugin did not exit in time, killing");
                    if let Err(e) = self.child.kill().await {
                        warn!(plugin = %self.name, "Failed to kill plugin: {}", e);
                    }
                }
            }
        }
    }

    /// Start `path`, wait for it to connect back and complete registration.
    pub async fn launch_plugin(
        name: &str,
        path: &Path,
        socket_dir: &Path,
        codec: Arc<PluginCodec>,
        timeout: Duration,
    ) -> Result<PluginProcess> {
        let socket_path: PathBuf = socket_dir.join(format!("{}.sock", name));
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        std::fs::create_dir_all(socket_dir)?;

        let listener = UnixListener::bind(&socket_path)?;
        let mut child = Command::new(path)
            .arg(&socket_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::Plugin(format!(
                    "cannot start plugin \"{}\" at {}: {}",
                    name,
                    path.display(),
                    e
                ))
            })?;
        info!(plugin = %name, pid = ?child.id(), "Plugin process started");

        let accepted = tokio::time::timeout(timeout, listener.accept()).await;
        drop(listener);
        if let Err(e) = std::fs::remove_file(&socket_path) {
            debug!(path = %socket_path.display(), "Failed to remove plugin socket: {}", e);
        }

        let stream = match accepted {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(AgentError::timeout("plugin connect", timeout));
            }
        };

        let broker = PluginBroker::new(name, stream, codec, timeout);
        let metrics = match handshake(&broker, timeout).await {
            Ok(metrics) => metrics,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        Ok(PluginProcess {
            name: name.to_string(),
            metrics,
            collector: Arc::new(PluginCollector::new(broker)),
            child,
        })
    }

    /// Register, then validate and push the global options.
    async fn handshake(broker: &PluginBroker, timeout: Duration) -> Result<Vec<String>> {
        let metrics = broker.register().await?;
        broker.validate(None).await?;
        let options = GlobalOptions {
            timeout: timeout.as_secs().max(1) as u32,
            source_ip: None,
        };
        broker.configure(options, None).await?;
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::comms::{
        decode, read_message, write_message, ExportRequest, ExportResponse, Message,
    };
    use crate::scheduler::{LocalScheduler, Scheduler};
    use crate::value::CheckResult;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_scheduler_routes_to_plugin() {
        let (agent, mut plugin) = tokio::io::duplex(64 * 1024);
        let broker = PluginBroker::new(
            "Uptime",
            agent,
            Arc::new(PluginCodec::new()),
            Duration::from_secs(3),
        );

        tokio::spawn(async move {
            while let Ok((kind, payload)) = read_message(&mut plugin).await {
                if kind != MessageType::ExportRequest {
                    continue;
                }
                let request: ExportRequest = decode(&payload).unwrap();
                let mut response = ExportResponse::empty(request.id());
                response.value = Some(json!(format!("{}:{}", request.key, request.params.len())));
                write_message(&mut plugin, &response).await.unwrap();
            }
        });

        let scheduler = LocalScheduler::new();
        scheduler
            .register("plugin.uptime", Arc::new(PluginCollector::new(broker)))
            .unwrap();

        for _ in 0..3 {
            let result = scheduler
                .perform_task("plugin.uptime[a,b]", Duration::from_secs(3))
                .await;
            assert_eq!(result, CheckResult::value("plugin.uptime:2"));
        }
        assert!(scheduler.query("metrics").contains("Uptime"));
    }

    #[cfg(unix)]
    mod launch {
        use super::*;
        use crate::plugin::comms::{
            ConfigureRequest, RegisterRequest, RegisterResponse, ValidateRequest,
            ValidateResponse,
        };
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};
        use tokio::net::UnixStream;

        fn write_script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("plugin.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        async fn connect_when_ready(path: &Path) -> UnixStream {
            loop {
                if let Ok(stream) = UnixStream::connect(path).await {
                    return stream;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        #[tokio::test]
        async fn test_launch_registers_and_shuts_down() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "sleep 1");
            let socket_dir = dir.path().join("sockets");
            let socket_path = socket_dir.join("Fake.sock");

            let fake = tokio::spawn(async move {
                let mut conn = connect_when_ready(&socket_path).await;

                let (kind, payload) = read_message(&mut conn).await.unwrap();
                assert_eq!(kind, MessageType::RegisterRequest);
                let request: RegisterRequest = decode(&payload).unwrap();
                let mut response = RegisterResponse::empty(request.id());
                response.metrics = vec!["fake.ping".into()];
                write_message(&mut conn, &response).await.unwrap();

                let (_, payload) = read_message(&mut conn).await.unwrap();
                let request: ValidateRequest = decode(&payload).unwrap();
                write_message(&mut conn, &ValidateResponse::empty(request.id()))
                    .await
                    .unwrap();

                let (kind, payload) = read_message(&mut conn).await.unwrap();
                assert_eq!(kind, MessageType::Configure);
                let request: ConfigureRequest = decode(&payload).unwrap();
                assert_eq!(request.global_options.timeout, 3);

                let (kind, _) = read_message(&mut conn).await.unwrap();
                assert_eq!(kind, MessageType::Terminate);
            });

            let process = launch_plugin(
                "Fake",
                &script,
                &socket_dir,
                Arc::new(PluginCodec::new()),
                Duration::from_secs(3),
            )
            .await
            .unwrap();
            assert_eq!(process.metrics, vec!["fake.ping"]);
            assert!(process.pid().is_some());
            assert!(!socket_dir.join("Fake.sock").exists());

            tokio::time::timeout(Duration::from_secs(5), process.shutdown(Duration::from_secs(3)))
                .await
                .unwrap();
            fake.await.unwrap();
        }

        #[tokio::test]
        async fn test_plugin_that_never_connects_is_killed() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(dir.path(), "sleep 1\ntouch \"$(dirname \"$0\")/survived\"");
            let socket_dir = dir.path().join("sockets");

            let err = launch_plugin(
                "Silent",
                &script,
                &socket_dir,
                Arc::new(PluginCodec::new()),
                Duration::from_millis(300),
            )
            .await
            .err()
            .unwrap();
            assert!(err.is_timeout(), "got {err}");
            assert!(err.to_string().contains("plugin connect"));
            assert!(!socket_dir.join("Silent.sock").exists());

            tokio::time::sleep(Duration::from_millis(1500)).await;
            assert!(!dir.path().join("survived").exists());
        }
    }
}
