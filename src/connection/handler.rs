//! Per-Connection Worker
//!
//! Each accepted socket gets its own task running a simple loop:
//!
//! ```text
//! read one frame  ──►  decode  ──►  dispatch to store  ──►  write reply
//!      ▲                                                        │
//!      └────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests on one connection are strictly serialized, so replies always come
//! back in request order. A malformed message is answered with an encoded
//! error and the loop continues; only I/O failures (or a clean EOF) end the
//! worker. A panic while handling a single message is confined: the peer
//! receives `!"unknown error"` and the connection is closed, the server and
//! every other connection keep running.
//!
//! ## Buffering
//!
//! TCP is a stream, so a read may carry half a message or several at once.
//! Incoming bytes accumulate in a `BytesMut`; a frame is split off at each
//! `\r` terminator and leftover bytes stay buffered for the next iteration,
//! which makes pipelined requests work for free.

use crate::protocol::{decode_message, prepare_message, Command, Message, Request, Value, WireError, CR};
use crate::storage::{Store, StoreError};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Ceiling on one frame; a peer that never sends `\r` is cut off here.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Initial capacity of the per-connection read buffer.
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Errors that end a connection worker.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream mid-frame.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The peer exceeded [`MAX_FRAME_SIZE`] without terminating a frame.
    #[error("frame size limit exceeded")]
    FrameTooLarge,
}

/// State for one client connection.
pub struct Connection {
    stream: BufWriter<TcpStream>,
    addr: SocketAddr,
    buffer: BytesMut,
    store: Arc<Store>,
    closing: watch::Receiver<bool>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        store: Arc<Store>,
        closing: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            store,
            closing,
        }
    }

    /// Drives the connection to completion.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "client connected");

        let result = self.serve().await;

        match &result {
            Ok(()) => debug!(client = %self.addr, "client disconnected"),
            Err(ConnectionError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                debug!(client = %self.addr, "connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "connection error"),
        }

        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Between requests the worker also watches the closing signal;
            // an in-flight request always runs to completion.
            let frame = tokio::select! {
                read = read_frame(&mut self.stream, &mut self.buffer) => {
                    match read? {
                        Some(frame) => frame,
                        None => return Ok(()),
                    }
                }
                result = self.closing.changed() => {
                    let _ = result;
                    debug!(client = %self.addr, "server closing, ending connection");
                    return Ok(());
                }
            };

            trace!(client = %self.addr, bytes = frame.len(), "frame received");
            let (reply, fatal) = respond(&self.store, &frame);

            self.stream.write_all(&reply).await?;
            self.stream.flush().await?;

            if fatal {
                warn!(client = %self.addr, "panic while handling message, closing connection");
                return Ok(());
            }
        }
    }
}

/// Reads one `\r`-terminated frame, buffering across reads.
///
/// Returns `None` on a clean EOF between frames.
async fn read_frame(
    stream: &mut BufWriter<TcpStream>,
    buffer: &mut BytesMut,
) -> Result<Option<Bytes>, ConnectionError> {
    loop {
        if let Some(pos) = buffer.iter().position(|&b| b == CR) {
            return Ok(Some(buffer.split_to(pos + 1).freeze()));
        }

        if buffer.len() >= MAX_FRAME_SIZE {
            return Err(ConnectionError::FrameTooLarge);
        }

        let n = stream.get_mut().read_buf(buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(ConnectionError::UnexpectedEof);
        }
    }
}

/// Produces the reply for one frame. The second element is true when the
/// handler panicked and the connection must be closed after the write.
fn respond(store: &Store, frame: &[u8]) -> (Vec<u8>, bool) {
    match catch_unwind(AssertUnwindSafe(|| process(store, frame))) {
        Ok(reply) => (reply, false),
        Err(_) => (prepare_message(&Value::from(&WireError::Unknown)), true),
    }
}

fn process(store: &Store, frame: &[u8]) -> Vec<u8> {
    match decode_message(frame) {
        // Parse failures are reported to the peer; the connection lives on.
        Err(err) => prepare_message(&Value::from(&err)),
        // A bare value is echoed back encoded.
        Ok(Message::Value(v)) => prepare_message(&v),
        Ok(Message::Request(req)) => dispatch(store, req),
    }
}

fn dispatch(store: &Store, req: Request) -> Vec<u8> {
    match req.cmd {
        Command::Get => match store.get(&req.key) {
            // The stored bytes are already encoded; terminate and ship.
            Ok(raw) => {
                let mut reply = Vec::with_capacity(raw.len() + 1);
                reply.extend_from_slice(&raw);
                reply.push(CR);
                reply
            }
            // Get-of-missing answers nil rather than an error frame.
            Err(StoreError::NotFound) => prepare_message(&Value::Nil),
            Err(err) => prepare_message(&Value::error(err.to_string())),
        },
        Command::Set => {
            store.set(&req.key, req.value, req.ttl);
            prepare_message(&Value::Nil)
        }
        Command::Update => match store.update(&req.key, req.value, req.ttl) {
            Ok(()) => prepare_message(&Value::Nil),
            Err(err) => prepare_message(&Value::error(err.to_string())),
        },
        Command::Remove => match store.remove(&req.key) {
            Ok(()) => prepare_message(&Value::Nil),
            Err(err) => prepare_message(&Value::error(err.to_string())),
        },
        Command::Keys => {
            let keys = store.keys().into_iter().map(Value::Str).collect();
            prepare_message(&Value::List(keys))
        }
    }
}

/// Runs one client connection to completion, logging its outcome.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    store: Arc<Store>,
    closing: watch::Receiver<bool>,
) {
    let conn = Connection::new(stream, addr, store, closing);
    if let Err(e) = conn.run().await {
        debug!(client = %addr, error = %e, "connection ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_value_frame;
    use tokio::net::TcpListener;

    async fn start_test_server() -> (SocketAddr, Arc<Store>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Store::new(4));
        let (closing_tx, closing_rx) = watch::channel(false);

        let accept_store = Arc::clone(&store);
        tokio::spawn(async move {
            // Keeps the closing channel open for the lifetime of the server.
            let _closing_tx = closing_tx;
            while let Ok((stream, client_addr)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    Arc::clone(&accept_store),
                    closing_rx.clone(),
                ));
            }
        });

        (addr, store)
    }

    async fn read_reply(client: &mut TcpStream) -> Vec<u8> {
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = client.read(&mut byte).await.unwrap();
            assert!(n > 0, "connection closed before frame terminator");
            reply.push(byte[0]);
            if byte[0] == CR {
                return reply;
            }
        }
    }

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"+\nsome_key\n$\"value\"\n0\r")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");

        client.write_all(b"#\nsome_key\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"$\"value\"\r");

        client.write_all(b"-\nsome_key\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");

        client.write_all(b"#\nsome_key\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");
    }

    #[tokio::test]
    async fn get_missing_is_nil() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"#\nmissing\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");
    }

    #[tokio::test]
    async fn stored_bytes_come_back_verbatim() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // A map survives byte-for-byte, key order included.
        let payload: &[u8] = b":2\n$\"hello\"\n$\"world\"\n$\"cool\"\n&1";
        let mut request = b"+\nm\n".to_vec();
        request.extend_from_slice(payload);
        request.extend_from_slice(b"\n0\r");
        client.write_all(&request).await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");

        client.write_all(b"#\nm\r").await.unwrap();
        let mut want = payload.to_vec();
        want.push(CR);
        assert_eq!(read_reply(&mut client).await, want);
    }

    #[tokio::test]
    async fn malformed_message_keeps_connection_open() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b">\r").await.unwrap();
        assert_eq!(
            read_reply(&mut client).await,
            b"!\"unsupported command\"\r"
        );

        // The same connection still serves well-formed requests.
        client.write_all(b"#\nk\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");
    }

    #[tokio::test]
    async fn update_and_remove_missing_report_not_found() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"^\nghost\n$\"v\"\n0\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"!\"not found\"\r");

        client.write_all(b"-\nghost\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"!\"not found\"\r");
    }

    #[tokio::test]
    async fn keys_lists_stored_keys() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        for key in ["a", "b", "c"] {
            let request = format!("+\n{}\n$\"v\"\n0\r", key);
            client.write_all(request.as_bytes()).await.unwrap();
            assert_eq!(read_reply(&mut client).await, b"*\r");
        }

        client.write_all(b"~\r").await.unwrap();
        let reply = read_reply(&mut client).await;
        let value = decode_value_frame(&reply).unwrap();
        let mut keys: Vec<String> = value
            .into_list()
            .unwrap()
            .into_iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn bare_value_is_echoed() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"$\"hi\"\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"$\"hi\"\r");
    }

    #[tokio::test]
    async fn pipelined_requests_answer_in_order() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"+\nk1\n$\"v1\"\n0\r+\nk2\n$\"v2\"\n0\r#\nk1\r#\nk2\r")
            .await
            .unwrap();

        assert_eq!(read_reply(&mut client).await, b"*\r");
        assert_eq!(read_reply(&mut client).await, b"*\r");
        assert_eq!(read_reply(&mut client).await, b"$\"v1\"\r");
        assert_eq!(read_reply(&mut client).await, b"$\"v2\"\r");
    }

    #[tokio::test]
    async fn split_frame_across_writes() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"+\nk\n$\"va").await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        client.write_all(b"lue\"\n0\r").await.unwrap();

        assert_eq!(read_reply(&mut client).await, b"*\r");
    }

    #[tokio::test]
    async fn ttl_expires_over_the_wire() {
        let (addr, _) = start_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // 20ms in nanoseconds.
        client
            .write_all(b"+\nk\n$\"v\"\n20000000\r")
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");

        client.write_all(b"#\nk\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"$\"v\"\r");

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        client.write_all(b"#\nk\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");
    }

    #[tokio::test]
    async fn closing_signal_ends_idle_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(Store::new(4));
        let (closing_tx, closing_rx) = watch::channel(false);

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    Arc::clone(&store),
                    closing_rx.clone(),
                ));
            }
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"#\nk\r").await.unwrap();
        assert_eq!(read_reply(&mut client).await, b"*\r");

        closing_tx.send(true).unwrap();

        // The worker exits and the socket reads EOF.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
