//! Reference Client
//!
//! A small pooled client for the wire protocol. A fixed number of
//! connections are dialed up front and parked in a channel; every request
//! borrows one, writes a single frame, reads the single `\r`-terminated
//! response frame, and returns the connection to the pool. Requests block on
//! pool availability, so the pool size caps in-flight requests.
//!
//! Error frames from the server are re-materialized into their typed form:
//! `!"not found"` becomes [`ClientError::NotFound`], the remaining canonical
//! strings surface as [`ClientError::Server`]. A missing key read through
//! [`Client::get`] is *not* an error: the server answers nil, and nil is what
//! the caller gets.

use crate::protocol::{decode_value_frame, encode_request, Command, Value, WireError, CR};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The server's response could not be decoded.
    #[error("protocol error: {0}")]
    Wire(WireError),

    /// The server reported an absent key for update or remove.
    #[error("not found")]
    NotFound,

    /// Any other error frame from the server.
    #[error("server error: {0}")]
    Server(WireError),

    /// The client was closed.
    #[error("client closed")]
    Terminated,

    /// The server answered with a shape the operation does not expect.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// A pooled cache client.
pub struct Client {
    addr: String,
    pool_tx: mpsc::Sender<TcpStream>,
    pool_rx: Mutex<mpsc::Receiver<TcpStream>>,
    closing: watch::Sender<bool>,
}

impl Client {
    /// Dials `pool_size` connections to `addr` (at least one).
    pub async fn connect(addr: &str, pool_size: usize) -> Result<Client, ClientError> {
        let pool_size = pool_size.max(1);
        let (pool_tx, pool_rx) = mpsc::channel(pool_size);

        for _ in 0..pool_size {
            let conn = dial(addr).await?;
            let _ = pool_tx.send(conn).await;
        }

        let (closing, _) = watch::channel(false);
        debug!(addr, pool_size, "client connected");

        Ok(Client {
            addr: addr.to_string(),
            pool_tx,
            pool_rx: Mutex::new(pool_rx),
            closing,
        })
    }

    /// Fetches the value stored under `key`.
    ///
    /// Returns [`Value::Nil`] when the key is absent or expired; the wire
    /// does not distinguish that from a stored nil.
    pub async fn get(&self, key: &str) -> Result<Value, ClientError> {
        let frame = encode_request(Command::Get, key, None, Duration::ZERO);
        self.request(&frame).await
    }

    /// Stores `value` under `key`. A zero `ttl` means the entry never
    /// expires.
    pub async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), ClientError> {
        let frame = encode_request(Command::Set, key, Some(value), ttl);
        self.request(&frame).await.map(|_| ())
    }

    /// Replaces the value and TTL of an existing key.
    pub async fn update(&self, key: &str, value: &Value, ttl: Duration) -> Result<(), ClientError> {
        let frame = encode_request(Command::Update, key, Some(value), ttl);
        self.request(&frame).await.map(|_| ())
    }

    /// Deletes the entry under `key`.
    pub async fn remove(&self, key: &str) -> Result<(), ClientError> {
        let frame = encode_request(Command::Remove, key, None, Duration::ZERO);
        self.request(&frame).await.map(|_| ())
    }

    /// Lists every key the server currently knows.
    pub async fn keys(&self) -> Result<Vec<String>, ClientError> {
        let frame = encode_request(Command::Keys, "", None, Duration::ZERO);
        let value = self.request(&frame).await?;

        match value {
            Value::List(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Str(s) => Some(s),
                    other => {
                        warn!(value = %other, "keys listing carried a non-string entry");
                        None
                    }
                })
                .collect()),
            other => Err(ClientError::UnexpectedResponse(other.to_string())),
        }
    }

    /// Closes the pool. In-flight requests finish; later calls fail with
    /// [`ClientError::Terminated`].
    pub async fn close(&self) {
        // send_replace rather than send: the flag must flip even when no
        // acquire is currently subscribed.
        self.closing.send_replace(true);
        let mut pool = self.pool_rx.lock().await;
        while pool.try_recv().is_ok() {}
        debug!("client closed");
    }

    async fn request(&self, frame: &[u8]) -> Result<Value, ClientError> {
        let mut conn = self.acquire().await?;

        let reply = match exchange(&mut conn, frame).await {
            Ok(reply) => {
                self.release(conn).await;
                reply
            }
            Err(e) => {
                // The stream state is unknown; replace it rather than pool it.
                drop(conn);
                match dial(&self.addr).await {
                    Ok(fresh) => self.release(fresh).await,
                    Err(dial_err) => {
                        warn!(error = %dial_err, "failed to replace broken connection")
                    }
                }
                return Err(ClientError::Io(e));
            }
        };

        let value = decode_value_frame(&reply).map_err(ClientError::Wire)?;
        if let Value::Error(text) = &value {
            return Err(match WireError::from_wire_text(text) {
                WireError::NotFound => ClientError::NotFound,
                err => ClientError::Server(err),
            });
        }
        Ok(value)
    }

    async fn acquire(&self) -> Result<TcpStream, ClientError> {
        // Subscribe before checking the flag so a close racing this call
        // either trips the check or fires `changed`.
        let mut closing = self.closing.subscribe();
        if *closing.borrow() {
            return Err(ClientError::Terminated);
        }
        let mut pool = self.pool_rx.lock().await;

        tokio::select! {
            conn = pool.recv() => conn.ok_or(ClientError::Terminated),
            _ = closing.changed() => Err(ClientError::Terminated),
        }
    }

    async fn release(&self, conn: TcpStream) {
        if *self.closing.borrow() {
            // The pool was already drained; let the connection drop.
            return;
        }
        let _ = self.pool_tx.send(conn).await;
    }
}

async fn dial(addr: &str) -> Result<TcpStream, std::io::Error> {
    let conn = TcpStream::connect(addr).await?;
    conn.set_nodelay(true)?;
    Ok(conn)
}

/// One blocking request/response exchange on a single connection.
async fn exchange(conn: &mut TcpStream, frame: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    conn.write_all(frame).await?;

    let mut reply = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-response",
            ));
        }
        for &b in &buf[..n] {
            reply.push(b);
            if b == CR {
                return Ok(reply);
            }
        }
    }
}
