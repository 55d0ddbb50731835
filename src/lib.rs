//! # cindercache: a network-accessible in-memory TTL cache
//!
//! cindercache is a single-node, plaintext TCP cache. Clients issue five
//! commands (get, set, update, remove, keys) over a simple marker-driven
//! wire format and receive typed replies. Values are arbitrary structured
//! payloads (strings, ints, nils, errors, lists, maps) that the server
//! stores as the exact bytes the client sent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         cindercache                          │
//! │                                                              │
//! │  ┌────────────┐    ┌──────────────┐    ┌─────────────────┐   │
//! │  │ TCP server │───>│  Connection  │───>│  Frame decoder  │   │
//! │  │ (accept)   │    │   worker     │    │  (protocol)     │   │
//! │  └────────────┘    └──────┬───────┘    └─────────────────┘   │
//! │                           │                                  │
//! │                           ▼                                  │
//! │         ┌──────────────────────────────────────┐             │
//! │         │                Store                 │             │
//! │         │  shard 0 │ shard 1 │ … │ shard N-1   │◄── Sweeper  │
//! │         │  RwLock  │ RwLock  │   │ RwLock      │             │
//! │         └──────────────────────────────────────┘             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design highlights
//!
//! - **Opaque-bytes storage**: set/update payloads are captured as raw
//!   encoded byte slices (the decoder walks the value grammar without
//!   materializing it), so a get replies with the exact original bytes and
//!   the hot path never re-encodes.
//! - **Sharded locking**: keys hash onto independent `RwLock`-guarded
//!   shards, letting readers and writers of unrelated keys proceed in
//!   parallel.
//! - **Lazy + periodic expiry**: an expired entry reports not-found on read
//!   and is queued for a re-checked background delete; a sweeper also walks
//!   all shards on a fixed interval.
//! - **Fault isolation**: a malformed message is answered with an encoded
//!   error and the connection continues; a panic while serving one message
//!   closes only that connection.
//!
//! ## Quick start
//!
//! ```ignore
//! use cindercache::client::Client;
//! use cindercache::protocol::Value;
//! use cindercache::server;
//! use cindercache::storage::StoreKind;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handle = server::run(StoreKind::Memory, 32, "127.0.0.1:3000").await?;
//!
//!     let client = Client::connect("127.0.0.1:3000", 3).await?;
//!     client.set("greeting", &Value::str("hello"), Duration::ZERO).await?;
//!     assert_eq!(client.get("greeting").await?, Value::str("hello"));
//!
//!     handle.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

pub use client::{Client, ClientError};
pub use protocol::{Command, Request, Value, WireError};
pub use server::{run, ServerHandle};
pub use storage::{Store, StoreError, StoreKind};

/// Default TCP port the server listens on.
pub const DEFAULT_PORT: u16 = 3000;

/// Default shard count used by the server binary.
pub const DEFAULT_BSIZE: usize = 32;
