use super::passive::handle_passive_check;
use super::registry::ServiceRegistry;
use crate::config::peer_allowed;
use crate::error::Result;
use crate::protocol::MessageFrame;
use crate::scheduler::Scheduler;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Reply to structured requests until they are supported.
pub const UNSUPPORTED_JSON_REPLY: &str = r#"{"response":"failed","info":"unsupported request"}"#;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What every connection handler needs. Shared by all connections.
pub struct ListenerContext {
    pub scheduler: Arc<dyn Scheduler>,
    pub timeout: Duration,
    pub allowed_peers: Vec<IpAddr>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    /// Payload starting with `{`.
    Json(Vec<u8>),
    /// Plain-text item key.
    Passive(String),
}

/// Route one payload by its first byte.
pub fn classify(payload: Vec<u8>) -> Request {
    if payload.first() == Some(&b'{') {
        return Request::Json(payload);
    }
    let text = String::from_utf8_lossy(&payload);
    let key = text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
    Request::Passive(key.to_string())
}

/// Passive-check TCP listener.
pub struct PassiveListener {
    local_addr: SocketAddr,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PassiveListener {
    pub async fn start(
        addr: SocketAddr,
        ctx: Arc<ListenerContext>,
        registry: &ServiceRegistry,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Listening for passive checks");

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = registry.register("passive listener");
        let task = tokio::spawn(async move {
            accept_loop(listener, ctx, stop_rx).await;
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

    /// Close the socket. Connections already accepted run to completion.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Passive listener task failed: {}", e);
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!("Passive listener stopping");
                break;
            }
            conn = listener.accept() => match conn {
                Ok((stream, peer)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        handle_connection(ctx, stream, peer).await;
                    });
                }
                Err(e) if is_temporary(&e) => {
                    warn!("Temporary accept error: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!("Accept error, passive listener stops: {}", e);
                    break;
                }
            }
        }
    }
}

/// Read one frame from `stream` and dispatch it.
pub async fn handle_connection<S>(ctx: Arc<ListenerContext>, mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    trace!(peer = %peer, "Connection accepted");

    if !peer_allowed(&ctx.allowed_peers, peer.ip()) {
        warn!(peer = %peer, "Connection from peer not in allowed_peers rejected");
        return;
    }

    let payload = match MessageFrame::read(&mut stream, ctx.timeout).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!(peer = %peer, "Cannot read message: {}", e);
            return;
        }
    };
    if payload.is_empty() {
        warn!(peer = %peer, "empty data from {}", peer);
        return;
    }

    match classify(payload) {
        Request::Json(body) => {
            debug!(peer = %peer, len = body.len(), "Structured request is not supported");
            if let Err(e) =
                MessageFrame::write(&mut stream, UNSUPPORTED_JSON_REPLY.as_bytes(), ctx.timeout)
                    .await
            {
                warn!(peer = %peer, "Cannot send reply: {}", e);
            }
            if let Err(e) = stream.shutdown().await {
                debug!(peer = %peer, "Failed to close connection: {}", e);
            }
        }
        Request::Passive(key) => {
            let scheduler = Arc::clone(&ctx.scheduler);
            let timeout = ctx.timeout;
            tokio::spawn(handle_passive_check(scheduler, stream, peer, key, timeout));
        }
    }
}

/// Accept errors after which the listener keeps going.
pub(crate) fn is_temporary(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    #[cfg(unix)]
    if let Some(code) = e.raw_os_error() {
        return matches!(code, libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CheckResult;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    struct Ping;

    #[async_trait]
    impl Scheduler for Ping {
        async fn perform_task(&self, key: &str, _timeout: Duration) -> CheckResult {
            match key {
                "agent.ping" => CheckResult::value("1"),
                other => CheckResult::error(format!("Unknown metric {}", other)),
            }
        }

        fn query(&self, _request: &str) -> String {
            String::new()
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn context(allowed_peers: Vec<IpAddr>) -> Arc<ListenerContext> {
        Arc::new(ListenerContext {
            scheduler: Arc::new(Ping),
            timeout: TIMEOUT,
            allowed_peers,
        })
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(b"{\"request\":\"x\"}".to_vec()),
            Request::Json(b"{\"request\":\"x\"}".to_vec())
        );
        assert_eq!(
            classify(b"agent.ping".to_vec()),
            Request::Passive("agent.ping".into())
        );
        assert_eq!(
            classify(b"agent.ping\0\n".to_vec()),
            Request::Passive("agent.ping".into())
        );
        // Only the first byte counts.
        assert_eq!(
            classify(b" {\"request\":\"x\"}".to_vec()),
            Request::Passive(" {\"request\":\"x\"}".into())
        );
    }

    #[test]
    fn test_temporary_errors() {
        assert!(is_temporary(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::InvalidInput)));
        #[cfg(unix)]
        assert!(is_temporary(&io::Error::from_raw_os_error(libc::EMFILE)));
    }

    #[tokio::test]
    async fn test_json_request_gets_stub_reply() {
        let (agent, mut server) = tokio::io::duplex(4096);
        MessageFrame::write(&mut server, b"{\"request\":\"x\"}", TIMEOUT)
            .await
            .unwrap();

        handle_connection(context(Vec::new()), agent, peer()).await;

        let reply = MessageFrame::read(&mut server, TIMEOUT).await.unwrap();
        assert_eq!(reply, UNSUPPORTED_JSON_REPLY.as_bytes());
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_json_request_from_departed_peer_completes() {
        let (agent, mut server) = tokio::io::duplex(4096);
        MessageFrame::write(&mut server, b"{\"request\":\"x\"}", TIMEOUT)
            .await
            .unwrap();
        drop(server);

        tokio::time::timeout(TIMEOUT, handle_connection(context(Vec::new()), agent, peer()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_passive_request_is_answered() {
        let (agent, mut server) = tokio::io::duplex(4096);
        MessageFrame::write(&mut server, b"agent.ping", TIMEOUT)
            .await
            .unwrap();

        handle_connection(context(Vec::new()), agent, peer()).await;

        let reply = MessageFrame::read(&mut server, TIMEOUT).await.unwrap();
        assert_eq!(reply, b"1");
    }

    #[tokio::test]
    async fn test_disallowed_peer_gets_nothing() {
        let (agent, mut server) = tokio::io::duplex(4096);
        MessageFrame::write(&mut server, b"agent.ping", TIMEOUT)
            .await
            .unwrap();

        let ctx = context(vec!["10.0.0.5".parse().unwrap()]);
        handle_connection(ctx, agent, peer()).await;

        let reply = MessageFrame::read(&mut server, TIMEOUT).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_listener_serves_tcp_and_stops() {
        let registry = ServiceRegistry::new();
        let mut listener = PassiveListener::start(
            "127.0.0.1:0".parse().unwrap(),
            context(Vec::new()),
            &registry,
        )
        .await
        .unwrap();
        assert_eq!(registry.active_count(), 1);

        let mut conn = TcpStream::connect(listener.local_addr()).await.unwrap();
        MessageFrame::write(&mut conn, b"agent.ping", TIMEOUT)
            .await
            .unwrap();
        let reply = MessageFrame::read(&mut conn, TIMEOUT).await.unwrap();
        assert_eq!(reply, b"1");

        listener.stop().await;
        tokio::time::timeout(TIMEOUT, registry.wait()).await.unwrap();
        assert_eq!(registry.active_count(), 0);
    }
}
