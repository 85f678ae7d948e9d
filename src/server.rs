//! Remote heartbeat endpoint of a [`FailureMonitor`].
//!
//! Messages are length-prefixed little-endian frames:
//!
//! ```text
//! [message_length i32][request_id i32][op_code i32][body]
//! ```
//!
//! `HEARTBEAT` carries the 16-byte transaction id and is answered with an
//! empty `ACK` echoing the request id; anything malformed gets an `ERROR`
//! whose body is a UTF-8 message.

use std::io::{self, Cursor, Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::failure::{FailureMonitor, MonitorEndpoint};
use crate::txn::TxnId;
use crate::OptsvaError;

pub const OP_HEARTBEAT: i32 = 1;
pub const OP_ACK: i32 = 2;
pub const OP_ERROR: i32 = 3;

const HEADER_LEN: usize = 12;
const MAX_MESSAGE_LEN: usize = 4 * 1024;

#[derive(Debug)]
struct MsgHeader {
    message_length: i32,
    request_id: i32,
    op_code: i32,
}

impl MsgHeader {
    fn read_from_slice(buf: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(buf);
        Ok(Self {
            message_length: ReadBytesExt::read_i32::<LittleEndian>(&mut cursor)?,
            request_id: ReadBytesExt::read_i32::<LittleEndian>(&mut cursor)?,
            op_code: ReadBytesExt::read_i32::<LittleEndian>(&mut cursor)?,
        })
    }

    fn write_to_vec(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        WriteBytesExt::write_i32::<LittleEndian>(buf, self.message_length)?;
        WriteBytesExt::write_i32::<LittleEndian>(buf, self.request_id)?;
        WriteBytesExt::write_i32::<LittleEndian>(buf, self.op_code)?;
        Ok(())
    }

    fn body_len(&self) -> Result<usize, OptsvaError> {
        let total = usize::try_from(self.message_length)
            .map_err(|_| OptsvaError::Protocol(format!("negative message length {}", self.message_length)))?;
        if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&total) {
            return Err(OptsvaError::Protocol(format!("message length {total} out of range")));
        }
        Ok(total - HEADER_LEN)
    }
}

fn encode_message(request_id: i32, op_code: i32, body: &[u8]) -> Result<Vec<u8>, OptsvaError> {
    let total = HEADER_LEN + body.len();
    let message_length = i32::try_from(total)
        .map_err(|_| OptsvaError::Protocol(format!("message of {total} bytes is too large")))?;
    let mut buf = Vec::with_capacity(total);
    MsgHeader {
        message_length,
        request_id,
        op_code,
    }
    .write_to_vec(&mut buf)?;
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Binds `addr` and serves heartbeats for `monitor` until the task is
/// dropped or accepting fails.
pub async fn serve_monitor(addr: &str, monitor: Arc<FailureMonitor>) -> Result<(), OptsvaError> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "monitor endpoint listening");
    serve_monitor_on(listener, monitor).await
}

pub async fn serve_monitor_on(
    listener: TcpListener,
    monitor: Arc<FailureMonitor>,
) -> Result<(), OptsvaError> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(peer = %peer, "monitor client connected");
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, monitor).await {
                warn!(peer = %peer, error = %err, "monitor connection failed");
            }
        });
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    monitor: Arc<FailureMonitor>,
) -> Result<(), OptsvaError> {
    loop {
        let mut header_buf = [0u8; HEADER_LEN];
        if let Err(e) = socket.read_exact(&mut header_buf).await {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(e.into());
        }
        let header = MsgHeader::read_from_slice(&header_buf)?;
        let mut body = vec![0u8; header.body_len()?];
        socket.read_exact(&mut body).await?;

        let reply = match header.op_code {
            OP_HEARTBEAT => match <[u8; 16]>::try_from(body.as_slice()) {
                Ok(bytes) => {
                    monitor.heartbeat(TxnId::from_bytes(bytes));
                    encode_message(header.request_id, OP_ACK, &[])?
                }
                Err(_) => encode_message(
                    header.request_id,
                    OP_ERROR,
                    format!("heartbeat body must be 16 bytes, got {}", body.len()).as_bytes(),
                )?,
            },
            other => encode_message(
                header.request_id,
                OP_ERROR,
                format!("unknown op code {other}").as_bytes(),
            )?,
        };
        socket.write_all(&reply).await?;
    }
}

/// Blocking client for a monitor in another process. The connection is
/// opened lazily and re-opened after any transport error.
pub struct RemoteMonitor {
    addr: String,
    timeout: Duration,
    next_request: AtomicI32,
    connection: Mutex<Option<StdTcpStream>>,
}

impl std::fmt::Debug for RemoteMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMonitor")
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteMonitor {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(2),
            next_request: AtomicI32::new(1),
            connection: Mutex::new(None),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connect(&self) -> io::Result<StdTcpStream> {
        let stream = StdTcpStream::connect(self.addr.as_str())?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn transport(&self, err: impl std::fmt::Display) -> OptsvaError {
        OptsvaError::Transport(format!("{}: {err}", self.addr))
    }
}

impl MonitorEndpoint for RemoteMonitor {
    fn ping(&self, txn: TxnId) -> Result<(), OptsvaError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = encode_message(request_id, OP_HEARTBEAT, txn.as_bytes())?;

        let mut connection = self.connection.lock();
        if connection.is_none() {
            *connection = Some(self.connect().map_err(|e| self.transport(e))?);
        }
        let Some(stream) = connection.as_mut() else {
            return Err(self.transport("no connection"));
        };
        let result = exchange(stream, &frame, request_id);
        if let Err(err) = &result {
            if matches!(err, OptsvaError::Io(_)) {
                *connection = None;
            }
        }
        result.map_err(|err| match err {
            OptsvaError::Io(e) => self.transport(e),
            other => other,
        })
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

fn exchange(stream: &mut StdTcpStream, frame: &[u8], request_id: i32) -> Result<(), OptsvaError> {
    Write::write_all(stream, frame)?;
    let mut header_buf = [0u8; HEADER_LEN];
    Read::read_exact(stream, &mut header_buf)?;
    let header = MsgHeader::read_from_slice(&header_buf)?;
    let mut body = vec![0u8; header.body_len()?];
    Read::read_exact(stream, &mut body)?;

    if header.request_id != request_id {
        return Err(OptsvaError::Protocol(format!(
            "reply to request {} while waiting for {request_id}",
            header.request_id
        )));
    }
    match header.op_code {
        OP_ACK => Ok(()),
        OP_ERROR => Err(OptsvaError::Protocol(String::from_utf8_lossy(&body).into_owned())),
        other => Err(OptsvaError::Protocol(format!("unexpected reply op code {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let frame = encode_message(7, OP_HEARTBEAT, &[0xab; 16]).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 16);
        assert_eq!(&frame[..4], &28i32.to_le_bytes());
        assert_eq!(&frame[4..8], &7i32.to_le_bytes());
        assert_eq!(&frame[8..12], &OP_HEARTBEAT.to_le_bytes());

        let header = MsgHeader::read_from_slice(&frame).unwrap();
        assert_eq!(header.body_len().unwrap(), 16);
    }

    #[test]
    fn out_of_range_lengths_are_rejected() {
        let short = MsgHeader {
            message_length: 4,
            request_id: 1,
            op_code: OP_ACK,
        };
        assert!(short.body_len().is_err());
        let huge = MsgHeader {
            message_length: i32::MAX,
            request_id: 1,
            op_code: OP_ACK,
        };
        assert!(huge.body_len().is_err());
    }
}
