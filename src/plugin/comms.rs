//! Agent <-> plugin process IPC messages
//!
//! Format: [4-byte data type (LE, 1 = JSON)][4-byte length (LE)][JSON payload]
//!
//! Every payload carries the `Common` envelope (`id`, `type`). Readers decode
//! the envelope first and leave the full typed decode to whoever dispatches
//! on the type.

use crate::error::{AgentError, Result};
use crate::protocol::MAX_PAYLOAD_SIZE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The only data type defined so far.
pub const JSON_TYPE: u32 = 1;

pub const PROTOCOL_VERSION: &str = "6.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum MessageType {
    RegisterRequest = 1,
    RegisterResponse = 2,
    Log = 3,
    ValidateRequest = 4,
    ValidateResponse = 5,
    Terminate = 6,
    ExportRequest = 7,
    ExportResponse = 8,
    Configure = 9,
    PeriodRequest = 10,
    PeriodResponse = 11,
    CollectRequest = 12,
    CollectResponse = 13,
}

impl TryFrom<u32> for MessageType {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        let kind = match value {
            1 => Self::RegisterRequest,
            2 => Self::RegisterResponse,
            3 => Self::Log,
            4 => Self::ValidateRequest,
            5 => Self::ValidateResponse,
            6 => Self::Terminate,
            7 => Self::ExportRequest,
            8 => Self::ExportResponse,
            9 => Self::Configure,
            10 => Self::PeriodRequest,
            11 => Self::PeriodResponse,
            12 => Self::CollectRequest,
            13 => Self::CollectResponse,
            other => return Err(format!("unknown message type {}", other)),
        };
        Ok(kind)
    }
}

impl From<MessageType> for u32 {
    fn from(kind: MessageType) -> Self {
        kind as u32
    }
}

/// Envelope present in every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Common {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: MessageType,
}

/// Access to the envelope of a typed message.
pub trait Message: Serialize {
    fn common(&self) -> &Common;

    fn id(&self) -> u32 {
        self.common().id
    }

    fn kind(&self) -> MessageType {
        self.common().kind
    }
}

macro_rules! impl_message {
    ($($ty:ty),* $(,)?) => {
        $(impl Message for $ty {
            fn common(&self) -> &Common {
                &self.common
            }
        })*
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(flatten)]
    pub common: Common,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    #[serde(flatten)]
    pub common: Common,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub interfaces: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequest {
    #[serde(flatten)]
    pub common: Common,
    pub severity: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    #[serde(flatten)]
    pub common: Common,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_options: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResponse {
    #[serde(flatten)]
    pub common: Common,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateRequest {
    #[serde(flatten)]
    pub common: Common,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    #[serde(flatten)]
    pub common: Common,
    pub key: String,
    #[serde(default)]
    pub params: Vec<String>,
    /// Seconds.
    pub timeout: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    #[serde(flatten)]
    pub common: Common,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalOptions {
    pub timeout: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureRequest {
    #[serde(flatten)]
    pub common: Common,
    pub global_options: GlobalOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_options: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodRequest {
    #[serde(flatten)]
    pub common: Common,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodResponse {
    #[serde(flatten)]
    pub common: Common,
    /// Seconds between collector runs.
    #[serde(default)]
    pub period: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectRequest {
    #[serde(flatten)]
    pub common: Common,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectResponse {
    #[serde(flatten)]
    pub common: Common,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl_message!(
    RegisterRequest,
    RegisterResponse,
    LogRequest,
    ValidateRequest,
    ValidateResponse,
    TerminateRequest,
    ExportRequest,
    ExportResponse,
    ConfigureRequest,
    PeriodRequest,
    PeriodResponse,
    CollectRequest,
    CollectResponse,
);

/// Mints correlation ids for requests. Ids start at 1 and wrap at `u32::MAX`.
#[derive(Debug)]
pub struct RequestIds {
    next: AtomicU32,
}

impl RequestIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Request builders. Every request gets a fresh id from the owned generator.
#[derive(Debug, Default)]
pub struct PluginCodec {
    ids: RequestIds,
}

impl PluginCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn common(&self, kind: MessageType) -> Common {
        Common {
            id: self.ids.next_id(),
            kind,
        }
    }

    pub fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            common: self.common(MessageType::RegisterRequest),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn log_request(&self, severity: u32, message: impl Into<String>) -> LogRequest {
        LogRequest {
            common: self.common(MessageType::Log),
            severity,
            message: message.into(),
        }
    }

    pub fn validate_request(&self, private_options: Option<Value>) -> ValidateRequest {
        ValidateRequest {
            common: self.common(MessageType::ValidateRequest),
            private_options,
        }
    }

    pub fn terminate_request(&self) -> TerminateRequest {
        TerminateRequest {
            common: self.common(MessageType::Terminate),
        }
    }

    pub fn export_request(
        &self,
        key: impl Into<String>,
        params: Vec<String>,
        timeout_secs: u32,
    ) -> ExportRequest {
        ExportRequest {
            common: self.common(MessageType::ExportRequest),
            key: key.into(),
            params,
            timeout: timeout_secs,
        }
    }

    pub fn configure_request(
        &self,
        global_options: GlobalOptions,
        private_options: Option<Value>,
    ) -> ConfigureRequest {
        ConfigureRequest {
            common: self.common(MessageType::Configure),
            global_options,
            private_options,
        }
    }

    pub fn period_request(&self, name: impl Into<String>) -> PeriodRequest {
        PeriodRequest {
            common: self.common(MessageType::PeriodRequest),
            name: name.into(),
        }
    }

    pub fn collect_request(&self, name: impl Into<String>) -> CollectRequest {
        CollectRequest {
            common: self.common(MessageType::CollectRequest),
            name: name.into(),
        }
    }
}

// Responses never mint ids: they echo the id of the request being answered.

impl RegisterResponse {
    pub fn empty(id: u32) -> Self {
        Self {
            common: Common {
                id,
                kind: MessageType::RegisterResponse,
            },
            metrics: Vec::new(),
            interfaces: 0,
            error: None,
        }
    }
}

impl ValidateResponse {
    pub fn empty(id: u32) -> Self {
        Self {
            common: Common {
                id,
                kind: MessageType::ValidateResponse,
            },
            error: None,
        }
    }
}

impl ExportResponse {
    pub fn empty(id: u32) -> Self {
        Self {
            common: Common {
                id,
                kind: MessageType::ExportResponse,
            },
            value: None,
            error: None,
        }
    }
}

impl PeriodResponse {
    pub fn empty(id: u32) -> Self {
        Self {
            common: Common {
                id,
                kind: MessageType::PeriodResponse,
            },
            period: 0,
        }
    }
}

impl CollectResponse {
    pub fn empty(id: u32) -> Self {
        Self {
            common: Common {
                id,
                kind: MessageType::CollectResponse,
            },
            error: None,
        }
    }
}

/// Serialize `message` into one frame: type tag, length, payload.
pub fn encode_message<T>(message: &T) -> Result<Vec<u8>>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(AgentError::protocol(format!(
            "plugin message size {} exceeds the maximum of {} bytes",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&JSON_TYPE.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Write `message` as one contiguous buffer.
pub async fn write_message<W, T>(conn: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let buf = encode_message(message)?;
    conn.write_all(&buf).await?;
    conn.flush().await?;
    Ok(())
}

/// Read one message. Only the envelope is decoded; the raw payload is
/// returned for the caller to decode into the concrete type.
pub async fn read_message<R>(conn: &mut R) -> Result<(MessageType, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let (common, payload) = read_envelope(conn).await?;
    Ok((common.kind, payload))
}

/// Like [`read_message`], keeping the correlation id as well.
///
/// Not cancel safe: dropping the future mid-frame loses the bytes already
/// consumed. Callers that time out must keep the reader running elsewhere.
pub async fn read_envelope<R>(conn: &mut R) -> Result<(Common, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut word = [0u8; 4];

    conn.read_exact(&mut word).await?;
    let data_type = u32::from_le_bytes(word);
    if data_type != JSON_TYPE {
        return Err(AgentError::protocol(format!(
            "unsupported plugin data type {}",
            data_type
        )));
    }

    conn.read_exact(&mut word).await?;
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(AgentError::protocol(format!(
            "plugin message size {} exceeds the maximum of {} bytes",
            len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    conn.read_exact(&mut payload).await?;

    let common: Common = serde_json::from_slice(&payload)
        .map_err(|e| AgentError::protocol(format!("invalid plugin message envelope: {}", e)))?;
    Ok((common, payload))
}

/// Second phase of a read: decode the raw payload into `T`.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}
