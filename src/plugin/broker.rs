use super::comms::{
    self, CollectResponse, ExportResponse, GlobalOptions, LogRequest, Message, MessageType,
    PeriodResponse, PluginCodec, RegisterResponse, ValidateResponse,
};
use crate::error::{AgentError, Result};
use crate::value::CheckValue;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

const OUTBOX_CAPACITY: usize = 16;

/// A whole response frame, routed to the caller waiting on its id.
struct Reply {
    kind: MessageType,
    payload: Vec<u8>,
}

/// Callers waiting on a response, keyed by request id.
#[derive(Default)]
struct Routes {
    pending: HashMap<u32, oneshot::Sender<Reply>>,
    closed: bool,
}

type Waiters = Arc<Mutex<Routes>>;

/// Drives one plugin process over its IPC connection.
///
/// A reader task owns the read half and only ever consumes whole frames,
/// handing each response to the caller waiting on its id. A writer task
/// owns the write half and writes whole frames. Callers that time out or are
/// dropped leave both halves aligned on frame boundaries; their late
/// responses find no waiter and are discarded.
pub struct PluginBroker {
    name: String,
    codec: Arc<PluginCodec>,
    timeout: Duration,
    outbox: mpsc::Sender<Vec<u8>>,
    waiters: Waiters,
    reader: JoinHandle<()>,
}

/// Removes a waiter whose caller gave up before the response arrived.
struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    id: u32,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.waiters).pending.remove(&self.id);
    }
}

fn lock(waiters: &Waiters) -> std::sync::MutexGuard<'_, Routes> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PluginBroker {
    pub fn new<S>(
        name: impl Into<String>,
        stream: S,
        codec: Arc<PluginCodec>,
        timeout: Duration,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let waiters: Waiters = Arc::default();
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);

        let reader = tokio::spawn(read_loop(name.clone(), read_half, Arc::clone(&waiters)));
        tokio::spawn(write_loop(name.clone(), write_half, rx));

        Self {
            name,
            codec,
            timeout,
            outbox,
            waiters,
            reader,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handshake: returns the metric keys the plugin serves.
    pub async fn register(&self) -> Result<Vec<String>> {
        let request = self.codec.register_request();
        let response: RegisterResponse = self
            .call(&request, MessageType::RegisterResponse, self.timeout)
            .await?;
        if let Some(err) = response.error {
            return Err(AgentError::Plugin(format!(
                "plugin \"{}\" failed to register: {}",
                self.name, err
            )));
        }
        info!(plugin = %self.name, metrics = response.metrics.len(), "Plugin registered");
        Ok(response.metrics)
    }

    pub async fn export(
        &self,
        key: &str,
        params: &[String],
        timeout: Duration,
    ) -> Result<Option<CheckValue>> {
        let request = self
            .codec
            .export_request(key, params.to_vec(), timeout.as_secs().max(1) as u32);
        let response: ExportResponse = self
            .call(&request, MessageType::ExportResponse, timeout)
            .await?;
        if let Some(err) = response.error {
            return Err(AgentError::application(err));
        }
        match response.value {
            Some(value) => CheckValue::from_json(value),
            None => Ok(None),
        }
    }

    pub async fn validate(&self, private_options: Option<Value>) -> Result<()> {
        let request = self.codec.validate_request(private_options);
        let response: ValidateResponse = self
            .call(&request, MessageType::ValidateResponse, self.timeout)
            .await?;
        match response.error {
            Some(err) => Err(AgentError::Config(format!(
                "invalid configuration for plugin \"{}\": {}",
                self.name, err
            ))),
            None => Ok(()),
        }
    }

    /// Configuration is one-way; the plugin does not answer.
    pub async fn configure(
        &self,
        global_options: GlobalOptions,
        private_options: Option<Value>,
    ) -> Result<()> {
        let request = self.codec.configure_request(global_options, private_options);
        self.send(&request, Instant::now() + self.timeout).await
    }

    pub async fn period(&self, collector: &str) -> Result<Duration> {
        let request = self.codec.period_request(collector);
        let response: PeriodResponse = self
            .call(&request, MessageType::PeriodResponse, self.timeout)
            .await?;
        Ok(Duration::from_secs(response.period))
    }

    pub async fn collect(&self, collector: &str) -> Result<()> {
        let request = self.codec.collect_request(collector);
        let response: CollectResponse = self
            .call(&request, MessageType::CollectResponse, self.timeout)
            .await?;
        match response.error {
            Some(err) => Err(AgentError::application(err)),
            None => Ok(()),
        }
    }

    pub async fn terminate(&self) -> Result<()> {
        let request = self.codec.terminate_request();
        debug!(plugin = %self.name, "Sending terminate request");
        self.send(&request, Instant::now() + self.timeout).await
    }

    /// Queue one whole frame for the writer task.
    async fn send<T: Message>(&self, request: &T, deadline: Instant) -> Result<()> {
        let frame = comms::encode_message(request)?;
        match tokio::time::timeout_at(deadline, self.outbox.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(self.closed()),
            Err(_) => Err(AgentError::timeout("plugin write", self.timeout)),
        }
    }

    async fn call<Req, Resp>(
        &self,
        request: &Req,
        expected: MessageType,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + DeserializeOwned,
    {
        let deadline = Instant::now() + timeout;
        let id = request.id();
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = lock(&self.waiters);
            if routes.closed {
                return Err(self.closed());
            }
            routes.pending.insert(id, tx);
        }
        let _guard = WaiterGuard {
            waiters: &self.waiters,
            id,
        };

        self.send(request, deadline).await?;
        trace!(plugin = %self.name, id, kind = ?request.kind(), "Request sent");

        let reply = match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(self.closed()),
            Err(_) => return Err(AgentError::timeout("plugin request", timeout)),
        };
        if reply.kind != expected {
            return Err(AgentError::protocol(format!(
                "plugin \"{}\" sent {:?} while {:?} was expected",
                self.name, reply.kind, expected
            )));
        }
        comms::decode(&reply.payload)
    }

    fn closed(&self) -> AgentError {
        AgentError::Plugin(format!("connection to plugin \"{}\" is closed", self.name))
    }
}

impl Drop for PluginBroker {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(name: String, mut conn: ReadHalf<R>, waiters: Waiters)
where
    R: AsyncRead,
{
    loop {
        let (common, payload) = match comms::read_envelope(&mut conn).await {
            Ok(message) => message,
            Err(AgentError::Transport(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(plugin = %name, "Plugin closed the connection");
                break;
            }
            Err(e) => {
                error!(plugin = %name, "Cannot read from plugin: {}", e);
                break;
            }
        };

        if common.kind == MessageType::Log {
            match comms::decode::<LogRequest>(&payload) {
                Ok(log) => forward_log(&name, &log),
                Err(e) => warn!(plugin = %name, "Invalid log message: {}", e),
            }
            continue;
        }

        let waiter = lock(&waiters).pending.remove(&common.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(Reply {
                    kind: common.kind,
                    payload,
                });
            }
            // Left over from a request whose caller timed out.
            None => warn!(
                plugin = %name,
                id = common.id,
                kind = ?common.kind,
                "Discarding stale plugin response"
            ),
        }
    }

    // Dropping the senders wakes every waiter with a closed channel.
    let mut routes = lock(&waiters);
    routes.closed = true;
    routes.pending.clear();
}

async fn write_loop<W>(name: String, mut conn: WriteHalf<W>, mut rx: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite,
{
    while let Some(frame) = rx.recv().await {
        let written = async {
            conn.write_all(&frame).await?;
            conn.flush().await
        };
        if let Err(e) = written.await {
            warn!(plugin = %name, "Cannot write to plugin: {}", e);
            break;
        }
    }
    rx.close();
}

fn forward_log(plugin: &str, log: &LogRequest) {
    match log.severity {
        0 => info!(plugin = %plugin, "{}", log.message),
        1 | 2 => error!(plugin = %plugin, "{}", log.message),
        3 => warn!(plugin = %plugin, "{}", log.message),
        4 => debug!(plugin = %plugin, "{}", log.message),
        _ => trace!(plugin = %plugin, "{}", log.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::comms::{
        decode, read_message, write_message, CollectRequest, ConfigureRequest, ExportRequest,
        PeriodRequest, RegisterRequest, ValidateRequest,
    };
    use serde_json::json;
    use tokio::io::DuplexStream;

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn pair() -> (PluginBroker, DuplexStream, Arc<PluginCodec>) {
        let (agent, plugin) = tokio::io::duplex(64 * 1024);
        let codec = Arc::new(PluginCodec::new());
        (
            PluginBroker::new("Disk", agent, Arc::clone(&codec), TIMEOUT),
            plugin,
            codec,
        )
    }

    #[tokio::test]
    async fn test_register_handshake() {
        let (broker, mut plugin, _) = pair();
        let fake = tokio::spawn(async move {
            let (kind, payload) = read_message(&mut plugin).await.unwrap();
            assert_eq!(kind, MessageType::RegisterRequest);
            let request: RegisterRequest = decode(&payload).unwrap();
            let mut response = RegisterResponse::empty(request.id());
            response.metrics = vec!["vfs.fs.size".into(), "vfs.fs.inode".into()];
            write_message(&mut plugin, &response).await.unwrap();
        });

        let metrics = broker.register().await.unwrap();
        fake.await.unwrap();
        assert_eq!(metrics, vec!["vfs.fs.size", "vfs.fs.inode"]);
    }

    #[tokio::test]
    async fn test_export_with_interleaved_log_and_stale_response() {
        let (broker, mut plugin, codec) = pair();
        let fake = tokio::spawn(async move {
            let (_, payload) = read_message(&mut plugin).await.unwrap();
            let request: ExportRequest = decode(&payload).unwrap();
            assert_eq!(request.key, "vfs.fs.size");
            assert_eq!(request.params, vec!["/", "free"]);

            let mut stale = ExportResponse::empty(request.id().wrapping_sub(1));
            stale.value = Some(json!("stale"));
            write_message(&mut plugin, &stale).await.unwrap();
            write_message(&mut plugin, &codec.log_request(3, "slow mount"))
                .await
                .unwrap();

            let mut response = ExportResponse::empty(request.id());
            response.value = Some(json!(1024));
            write_message(&mut plugin, &response).await.unwrap();
        });

        let value = broker
            .export("vfs.fs.size", &["/".to_string(), "free".to_string()], TIMEOUT)
            .await
            .unwrap();
        fake.await.unwrap();
        assert_eq!(value, Some(CheckValue::Uint(1024)));
    }

    #[tokio::test]
    async fn test_late_split_response_keeps_stream_aligned() {
        let (broker, mut plugin, _) = pair();
        let fake = tokio::spawn(async move {
            let (_, payload) = read_message(&mut plugin).await.unwrap();
            let first: ExportRequest = decode(&payload).unwrap();
            let mut late = ExportResponse::empty(first.id());
            late.value = Some(json!("late"));
            let frame = comms::encode_message(&late).unwrap();

            // Header and half the payload, then stall past the caller's deadline.
            let split = 8 + (frame.len() - 8) / 2;
            plugin.write_all(&frame[..split]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            plugin.write_all(&frame[split..]).await.unwrap();

            let (_, payload) = read_message(&mut plugin).await.unwrap();
            let second: ExportRequest = decode(&payload).unwrap();
            let mut response = ExportResponse::empty(second.id());
            response.value = Some(json!("fresh"));
            write_message(&mut plugin, &response).await.unwrap();
        });

        let err = broker
            .export("web.page.get", &[], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let value = broker.export("web.page.get", &[], TIMEOUT).await.unwrap();
        fake.await.unwrap();
        assert_eq!(value, Some(CheckValue::Text("fresh".into())));
    }

    #[tokio::test]
    async fn test_concurrent_calls_routed_by_id() {
        let (broker, mut plugin, _) = pair();
        tokio::spawn(async move {
            let mut requests = Vec::new();
            for _ in 0..2 {
                let (_, payload) = read_message(&mut plugin).await.unwrap();
                requests.push(decode::<ExportRequest>(&payload).unwrap());
            }
            // Answer in reverse order.
            for request in requests.iter().rev() {
                let mut response = ExportResponse::empty(request.id());
                response.value = Some(json!(request.key));
                write_message(&mut plugin, &response).await.unwrap();
            }
        });

        let (a, b) = tokio::join!(
            broker.export("vfs.fs.size", &[], TIMEOUT),
            broker.export("vfs.fs.inode", &[], TIMEOUT),
        );
        assert_eq!(a.unwrap(), Some(CheckValue::Text("vfs.fs.size".into())));
        assert_eq!(b.unwrap(), Some(CheckValue::Text("vfs.fs.inode".into())));
    }

    #[tokio::test]
    async fn test_closed_plugin_fails_waiters() {
        let (broker, plugin, _) = pair();
        drop(plugin);
        let err = broker.export("vfs.fs.size", &[], TIMEOUT).await.unwrap_err();
        assert!(matches!(err, AgentError::Plugin(_)), "got {err}");
    }

    #[tokio::test]
    async fn test_export_error_is_application_error() {
        let (broker, mut plugin, _) = pair();
        tokio::spawn(async move {
            let (_, payload) = read_message(&mut plugin).await.unwrap();
            let request: ExportRequest = decode(&payload).unwrap();
            let mut response = ExportResponse::empty(request.id());
            response.error = Some("Cannot obtain filesystem information.".into());
            write_message(&mut plugin, &response).await.unwrap();
        });

        let err = broker.export("vfs.fs.size", &[], TIMEOUT).await.unwrap_err();
        assert!(matches!(err, AgentError::Application(_)));
        assert_eq!(err.to_string(), "Cannot obtain filesystem information.");
    }

    #[tokio::test]
    async fn test_unexpected_response_type_is_protocol_error() {
        let (broker, mut plugin, _) = pair();
        tokio::spawn(async move {
            let (_, payload) = read_message(&mut plugin).await.unwrap();
            let request: PeriodRequest = decode(&payload).unwrap();
            write_message(&mut plugin, &ExportResponse::empty(request.id()))
                .await
                .unwrap();
        });

        let err = broker.period("Disk").await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_silent_plugin_times_out() {
        let (broker, _plugin, _) = pair();
        let err = broker
            .export("vfs.fs.size", &[], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(lock(&broker.waiters).pending.is_empty());
    }

    #[tokio::test]
    async fn test_validate_configure_collect() {
        let (broker, mut plugin, _) = pair();
        let fake = tokio::spawn(async move {
            let (kind, payload) = read_message(&mut plugin).await.unwrap();
            assert_eq!(kind, MessageType::ValidateRequest);
            let request: ValidateRequest = decode(&payload).unwrap();
            write_message(&mut plugin, &ValidateResponse::empty(request.id()))
                .await
                .unwrap();

            let (kind, payload) = read_message(&mut plugin).await.unwrap();
            assert_eq!(kind, MessageType::Configure);
            let request: ConfigureRequest = decode(&payload).unwrap();
            assert_eq!(request.global_options.timeout, 3);

            let (_, payload) = read_message(&mut plugin).await.unwrap();
            let request: CollectRequest = decode(&payload).unwrap();
            assert_eq!(request.name, "Disk");
            let mut response = CollectResponse::empty(request.id());
            response.error = Some("device busy".into());
            write_message(&mut plugin, &response).await.unwrap();
        });

        broker.validate(Some(json!({"Path": "/"}))).await.unwrap();
        broker
            .configure(
                GlobalOptions {
                    timeout: 3,
                    source_ip: None,
                },
                None,
            )
            .await
            .unwrap();
        let err = broker.collect("Disk").await.unwrap_err();
        fake.await.unwrap();
        assert_eq!(err.to_string(), "device busy");
    }

    #[tokio::test]
    async fn test_terminate_is_one_way() {
        let (broker, mut plugin, _) = pair();
        broker.terminate().await.unwrap();
        let (kind, _) = read_message(&mut plugin).await.unwrap();
        assert_eq!(kind, MessageType::Terminate);
    }
}
