//! Multiplexing TCP client: the server may answer requests out of order, so
//! responses are matched back to callers by request id rather than by the
//! order frames were sent (§4.4).
use crate::{read_frame, write_frame, Frame, ProtocolError, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

/// Default per-request deadline (§4.4: "implicit per-request deadline,
/// default 30s").
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = DashMap<u16, oneshot::Sender<Frame>>;

/// A connected client. Cloning shares the same socket and pending-request
/// table; cheap to hand to multiple tasks.
#[derive(Clone)]
pub struct Client {
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    pending: Arc<Pending>,
    next_id: Arc<AtomicU16>,
    request_timeout: Duration,
}

impl Client {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream, DEFAULT_REQUEST_TIMEOUT))
    }

    pub async fn connect_with_timeout(addr: &str, request_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream, request_timeout))
    }

    fn from_stream(stream: TcpStream, request_timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        spawn_reader(read_half, pending.clone());
        Self {
            writer: Arc::new(Mutex::new(write_half)),
            pending,
            next_id: Arc::new(AtomicU16::new(1)),
            request_timeout,
        }
    }

    fn allocate_id(&self) -> u16 {
        // request-id is a u16; 0 is reserved for unsolicited server pushes.
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a raw opcode + payload and wait for the matching response frame.
    pub async fn call(&self, opcode: u8, payload: Vec<u8>) -> Result<Frame> {
        let request_id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let frame = Frame::request(opcode, request_id, payload);
        if let Err(e) = self.send(&frame).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => {
                if response.is_error() {
                    let err: crate::ErrorPayload = crate::decode(&response.payload)?;
                    return Err(ProtocolError::Server {
                        code: err.code,
                        message: err.message,
                    });
                }
                Ok(response)
            }
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(crate::Opcode::Ping as u8, Vec::new()).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        AsyncWriteExt::shutdown(&mut *writer).await?;
        Ok(())
    }
}

fn spawn_reader(mut reader: ReadHalf<TcpStream>, pending: Arc<Pending>) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if let Some((_, tx)) = pending.remove(&frame.request_id) {
                        let _ = tx.send(frame);
                    } else {
                        tracing::debug!(request_id = frame.request_id, "response for unknown or expired request");
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "connection reader exiting");
                    break;
                }
            }
        }
        // Connection is gone; wake every still-pending caller with an error
        // by dropping their sender, which turns their `rx.await` into Err.
        pending.clear();
    });
}
