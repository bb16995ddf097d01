//! Transport contract and the default raw-socket implementation.
//!
//! The engine never performs socket I/O itself. A [`Transport`] owns its
//! own reader/writer tasks; outbound frames are handed over through the
//! non-blocking [`Transport::send`], and decoded replies come back through
//! the engine's [`ResponseSink`]. Replies must arrive as a single logical
//! sequence per transport instance; the engine does not defend against
//! concurrent `on_response` calls from the same transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use directory_wire::{ReplyHeader, RequestHeader, REPLY_HEADER_SIZE, REQUEST_HEADER_SIZE};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Errors raised by the outbound send hand-off
#[derive(Error, Debug)]
pub enum TransportError {
    /// No usable connection
    #[error("transport not connected")]
    NotConnected,
}

/// Inbound callback implemented by the session engine.
pub trait ResponseSink: Send + Sync {
    /// A full reply frame was decoded
    fn on_response(&self, header: ReplyHeader, payload: Bytes);
    /// The connection dropped at the socket level
    fn on_disconnect(&self);
}

/// Connection-oriented transport for the directory protocol.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a connection; returns true only once it is usable.
    /// Decoded replies are delivered to `sink` until disconnect.
    async fn connect(&self, addr: SocketAddr, sink: Arc<dyn ResponseSink>)
        -> anyhow::Result<bool>;

    /// Queue a frame for sending. Non-blocking: the frame is handed to
    /// the transport's writer task. Raises when no connection is usable.
    fn send(&self, header: RequestHeader, payload: &Bytes) -> Result<(), TransportError>;

    /// Whether a socket-level connection is currently usable
    fn is_connected(&self) -> bool;

    /// Idempotent teardown of the current connection
    fn cleanup(&self);
}

/// Encode one outbound frame: u32 length, request header, payload.
fn encode_request_frame(header: RequestHeader, payload: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + REQUEST_HEADER_SIZE + payload.len());
    buf.put_u32((REQUEST_HEADER_SIZE + payload.len()) as u32);
    header.encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

struct TcpConn {
    frame_tx: mpsc::UnboundedSender<Bytes>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

/// Default raw-socket transport: length-prefixed frames over TCP, one
/// reader task invoking the sink and one writer task draining the send
/// queue.
#[derive(Default)]
pub struct TcpTransport {
    conn: Mutex<Option<TcpConn>>,
    connected: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Create a disconnected transport
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        addr: SocketAddr,
        sink: Arc<dyn ResponseSink>,
    ) -> anyhow::Result<bool> {
        self.cleanup();

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(%addr, "transport connected");

        let (mut read_half, mut write_half) = stream.into_split();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Bytes>();

        let connected = Arc::clone(&self.connected);
        connected.store(true, Ordering::SeqCst);

        let writer_connected = Arc::clone(&self.connected);
        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    error!("transport write failed: {}", e);
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_connected = Arc::clone(&self.connected);
        let reader = tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                if let Err(e) = read_half.read_exact(&mut len_buf).await {
                    debug!("transport read ended: {}", e);
                    break;
                }
                let frame_len = u32::from_be_bytes(len_buf) as usize;
                if frame_len < REPLY_HEADER_SIZE {
                    error!(frame_len, "short reply frame");
                    break;
                }

                let mut frame = vec![0u8; frame_len];
                if let Err(e) = read_half.read_exact(&mut frame).await {
                    debug!("transport read ended mid-frame: {}", e);
                    break;
                }

                let mut frame = Bytes::from(frame);
                let header = match ReplyHeader::decode(&mut frame) {
                    Ok(header) => header,
                    Err(e) => {
                        error!("undecodable reply header: {}", e);
                        break;
                    }
                };
                sink.on_response(header, frame);
            }

            reader_connected.store(false, Ordering::SeqCst);
            sink.on_disconnect();
        });

        let mut conn = self.conn.lock().expect("transport lock poisoned");
        *conn = Some(TcpConn {
            frame_tx,
            reader,
            writer,
        });
        Ok(true)
    }

    fn send(&self, header: RequestHeader, payload: &Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let conn = self.conn.lock().expect("transport lock poisoned");
        let conn = conn.as_ref().ok_or(TransportError::NotConnected)?;
        conn.frame_tx
            .send(encode_request_frame(header, payload))
            .map_err(|_| TransportError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn cleanup(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut conn = self.conn.lock().expect("transport lock poisoned");
        if let Some(conn) = conn.take() {
            conn.reader.abort();
            conn.writer.abort();
            debug!("transport torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use directory_wire::{ErrorCode, OpCode};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingSink {
        replies: Mutex<Vec<(ReplyHeader, Bytes)>>,
        arrived: Notify,
        disconnected: AtomicBool,
    }

    impl ResponseSink for RecordingSink {
        fn on_response(&self, header: ReplyHeader, payload: Bytes) {
            self.replies.lock().unwrap().push((header, payload));
            self.arrived.notify_waiters();
        }

        fn on_disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
            self.arrived.notify_waiters();
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_roundtrip() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        // Echo server: read one request frame, answer with a reply frame
        // carrying the request's xid.
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            socket.read_exact(&mut len_buf).await.unwrap();
            let mut frame = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            socket.read_exact(&mut frame).await.unwrap();

            let mut frame = Bytes::from(frame);
            let request = RequestHeader::decode(&mut frame).unwrap();

            let reply = ReplyHeader::new(request.xid, 77, ErrorCode::Ok);
            let mut buf = BytesMut::new();
            reply.encode(&mut buf);
            let payload = b"pong";
            let mut out = BytesMut::new();
            out.put_u32((buf.len() + payload.len()) as u32);
            out.put_slice(&buf);
            out.put_slice(payload);
            socket.write_all(&out).await.unwrap();
        });

        let transport = TcpTransport::new();
        let sink = Arc::new(RecordingSink::default());
        assert!(transport
            .connect(bound_addr, sink.clone())
            .await
            .unwrap());
        assert!(transport.is_connected());

        let mut header = RequestHeader::new(OpCode::Ping);
        header.xid = 9;
        transport.send(header, &Bytes::new()).unwrap();

        // Wait for the echoed reply.
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                let notified = sink.arrived.notified();
                if !sink.replies.lock().unwrap().is_empty() {
                    break;
                }
                notified.await;
            }
        })
        .await
        .unwrap();

        let replies = sink.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.xid, 9);
        assert_eq!(replies[0].0.dxid, 77);
        assert_eq!(replies[0].1, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = TcpTransport::new();
        let header = RequestHeader::new(OpCode::Ping);
        assert!(matches!(
            transport.send(header, &Bytes::new()),
            Err(TransportError::NotConnected)
        ));

        // cleanup on a disconnected transport is a no-op
        transport.cleanup();
        transport.cleanup();
    }
}
