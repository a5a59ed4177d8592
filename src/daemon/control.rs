use super::registry::ServiceRegistry;
use crate::error::{AgentError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Longest wait for an existing instance to answer the startup liveness check.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

/// One control connection with its pending command line.
pub struct Client {
    request: String,
    stream: UnixStream,
    timeout: Duration,
}

impl Client {
    pub fn request(&self) -> &str {
        &self.request
    }

    /// Write the whole reply once. Closing is left to [`Client::close`].
    pub async fn reply(&mut self, text: &str) -> Result<()> {
        let timeout = self.timeout;
        let io = async {
            self.stream.write_all(text.as_bytes()).await?;
            self.stream.flush().await
        };
        match tokio::time::timeout(timeout, io).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(AgentError::timeout("control reply", timeout)),
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!("Control connection shutdown failed: {}", e);
        }
    }
}

/// Local control socket. Accepted commands are handed to a single consumer.
pub struct ControlChannel {
    path: PathBuf,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Bind `path` and start accepting. Fails when a live instance already
    /// answers on it; a stale socket file is replaced.
    pub async fn bind(
        path: &Path,
        timeout: Duration,
        registry: &ServiceRegistry,
    ) -> Result<(Self, mpsc::Receiver<Client>)> {
        if path.exists() {
            let answer = send_command(path, "version", timeout.min(LIVENESS_TIMEOUT)).await;
            match answer {
                Ok(reply) if !reply.is_empty() => {
                    return Err(AgentError::Config(format!(
                        "control socket {} is in use by another agent",
                        path.display()
                    )));
                }
                _ => {
                    debug!(path = %path.display(), "Removing stale control socket");
                    std::fs::remove_file(path)?;
                }
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
        info!(path = %path.display(), "Control channel listening");

        let (tx, rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = registry.register("control channel");
        let task = tokio::spawn(async move {
            accept_loop(listener, tx, stop_rx, timeout).await;
            drop(handle);
        });

        Ok((
            Self {
                path: path.to_path_buf(),
                stop_tx: Some(stop_tx),
                task: Some(task),
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Control channel task failed: {}", e);
            }
        }
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "Failed to remove control socket: {}", e);
            }
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    tx: mpsc::Sender<Client>,
    mut stop_rx: oneshot::Receiver<()>,
    timeout: Duration,
) {
    loop {
        // Hold a queue slot before accepting so that at most one command
        // waits for the consumer; later clients stay in the listen backlog.
        let permit = tokio::select! {
            _ = &mut stop_rx => break,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Control command consumer is gone, channel stops");
                    break;
                }
            }
        };

        let stream = tokio::select! {
            _ = &mut stop_rx => break,
            conn = listener.accept() => match conn {
                Ok((stream, _)) => stream,
                Err(e) if super::listener::is_temporary(&e) => {
                    warn!("Temporary control accept error: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("Control accept error, channel stops: {}", e);
                    break;
                }
            }
        };

        let client = tokio::select! {
            _ = &mut stop_rx => break,
            client = read_client(stream, timeout) => client,
        };
        let Some(client) = client else {
            continue;
        };
        debug!(command = %client.request, "Control command received");
        permit.send(client);
    }
    debug!("Control channel stopped");
}

async fn read_client(stream: UnixStream, timeout: Duration) -> Option<Client> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
        Ok(Ok(0)) => {
            trace!("Control connection closed without a command");
            return None;
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!("Cannot read control command: {}", e);
            return None;
        }
        Err(_) => {
            warn!("Control command not received within {:?}", timeout);
            return None;
        }
    }

    let request = line.trim().to_string();
    if request.is_empty() {
        return None;
    }
    Some(Client {
        request,
        stream: reader.into_inner(),
        timeout,
    })
}

/// Send one command to the control socket at `path` and return the reply.
pub async fn send_command(path: &Path, command: &str, timeout: Duration) -> Result<String> {
    let exchange = async {
        let mut stream = UnixStream::connect(path).await?;
        stream.write_all(format!("{}\n", command).as_bytes()).await?;
        stream.flush().await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Ok::<_, std::io::Error>(reply)
    };

    let reply = match tokio::time::timeout(timeout, exchange).await {
        Ok(res) => res?,
        Err(_) => return Err(AgentError::timeout("control command", timeout)),
    };
    Ok(String::from_utf8_lossy(&reply).into_owned())
}
