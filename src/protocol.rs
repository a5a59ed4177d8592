//! Agent <-> server wire framing.
//!
//! Every message on a passive-check or active-check connection is one frame:
//!
//! ```text
//! offset 0   'Z' 'B' 'X' 'D'   magic
//! offset 4   0x01              version
//! offset 5   u32 LE            payload length
//! offset 9   u32 LE            reserved (written as 0, ignored on read)
//! offset 13  payload           `length` bytes
//! ```
//!
//! The 8 bytes after the version byte are the historical 64-bit length
//! slot. Only the low 32 bits carry the length; the high half is reserved.

use crate::error::{AgentError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

pub const MAGIC: &[u8; 4] = b"ZBXD";
pub const VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 13;
/// Hard ceiling on a declared payload length (128 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 128 * 1024 * 1024;

/// Size of the first read; small requests arrive whole in it.
const INITIAL_READ_SIZE: usize = 2048;

pub struct MessageFrame;

impl MessageFrame {
    /// Prefix `payload` with the 13-byte header.
    pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(AgentError::protocol(format!(
                "message size {} exceeds the maximum of {} bytes",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let len = payload.len() as u32;
        let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
        result.extend_from_slice(MAGIC);
        result.push(VERSION);
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(&0u32.to_le_bytes());
        result.extend_from_slice(payload);
        Ok(result)
    }

    /// Validate a header and return the declared payload length.
    pub fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<usize> {
        if &header[..4] != MAGIC {
            return Err(AgentError::protocol("invalid message header magic"));
        }
        if header[4] != VERSION {
            return Err(AgentError::protocol(format!(
                "unsupported protocol version {:#04x}",
                header[4]
            )));
        }

        let len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(AgentError::protocol(format!(
                "message size {} exceeds the maximum of {} bytes",
                len, MAX_PAYLOAD_SIZE
            )));
        }
        Ok(len)
    }

    /// Read one frame and return its payload.
    ///
    /// The whole read shares one deadline, `timeout` from now. A source that
    /// reaches EOF before yielding any byte produces an empty payload.
    pub async fn read<R>(reader: &mut R, timeout: Duration) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; INITIAL_READ_SIZE];
        let mut total = 0;

        while total < HEADER_SIZE {
            let n = read_before(reader, &mut buf[total..], deadline, timeout).await?;
            if n == 0 {
                break;
            }
            total += n;
        }

        if total == 0 {
            return Ok(Vec::new());
        }
        if total < HEADER_SIZE {
            return Err(AgentError::protocol(format!(
                "message is missing header: got {} bytes",
                total
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&buf[..HEADER_SIZE]);
        let len = Self::parse_header(&header)?;

        let buffered = total - HEADER_SIZE;
        if buffered >= len {
            buf.truncate(HEADER_SIZE + len);
            buf.drain(..HEADER_SIZE);
            return Ok(buf);
        }

        let mut payload = vec![0u8; len];
        payload[..buffered].copy_from_slice(&buf[HEADER_SIZE..total]);
        let mut filled = buffered;

        while filled < len {
            let n = read_before(reader, &mut payload[filled..], deadline, timeout).await?;
            if n == 0 {
                return Err(AgentError::protocol(format!(
                    "short message: expected {} bytes, got {}",
                    len, filled
                )));
            }
            filled += n;
        }

        Ok(payload)
    }

    /// Frame `payload` and write it as one buffer.
    pub async fn write<W>(writer: &mut W, payload: &[u8], timeout: Duration) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = Self::encode(payload)?;
        let deadline = Instant::now() + timeout;

        let io = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout_at(deadline, io).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(AgentError::timeout("write", timeout)),
        }
    }
}

async fn read_before<R>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout_at(deadline, reader.read(buf)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(AgentError::timeout("read", timeout)),
    }
}
