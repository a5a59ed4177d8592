use crate::protocol::MessageFrame;
use crate::scheduler::Scheduler;
use crate::value::CheckResult;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Prefix of a failed passive check response, followed by NUL and the error.
pub const NOTSUPPORTED: &str = "ZBX_NOTSUPPORTED";

/// Evaluate one passive-check key and answer with exactly one frame.
///
/// The connection is closed on every path; a failure is terminal for this
/// request and the peer has to reconnect.
pub async fn handle_passive_check<S>(
    scheduler: Arc<dyn Scheduler>,
    mut stream: S,
    peer: SocketAddr,
    key: String,
    timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(peer = %peer, key = %key, "Passive check request");

    let result = scheduler.perform_task(&key, timeout).await;
    let response = format_response(result);

    if let Err(e) = MessageFrame::write(&mut stream, &response, timeout).await {
        warn!(peer = %peer, key = %key, "Cannot send passive check response: {}", e);
    }
    if let Err(e) = stream.shutdown().await {
        debug!(peer = %peer, "Failed to close connection: {}", e);
    }
}

pub fn format_response(result: CheckResult) -> Vec<u8> {
    match result {
        CheckResult {
            error: Some(err), ..
        } => not_supported(&err),
        CheckResult {
            value: Some(value), ..
        } => value.into_bytes(),
        CheckResult {
            value: None,
            error: None,
        } => not_supported("No values received."),
    }
}

fn not_supported(err: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(NOTSUPPORTED.len() + 1 + err.len());
    out.extend_from_slice(NOTSUPPORTED.as_bytes());
    out.push(0);
    out.extend_from_slice(err.as_bytes());
    out
}
