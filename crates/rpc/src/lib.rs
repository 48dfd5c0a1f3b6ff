//! Connection-level RPC engine.
//!
//! A client opens a byte stream, writes its [`Options`] and then exchanges
//! header/body frames using the negotiated codec. Requests carry a sequence
//! number chosen by the client; the server runs each request on its own task
//! and replies in whatever order the handlers finish, so replies are matched
//! by sequence number rather than by arrival order.
//!
//! # Features
//!
//! - **Concurrent dispatch**: One task per request, with writes serialized
//!   under a per-connection send lock
//! - **Graceful drain**: A connection closes only after every outstanding
//!   handler has written its reply
//! - **Pluggable codecs**: JSON lines or checksummed CBOR frames, chosen per
//!   connection
//! - **Typed handlers**: Register async closures; arguments and replies are
//!   decoded and encoded for you
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use proven_rpc::{Client, Registry, Server, ServerConfig};
//! use tokio::net::TcpListener;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = Registry::new();
//!     registry.register("Arith.Double", |n: i64| async move { Ok::<_, String>(n * 2) })?;
//!
//!     let listener = TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!     let server = Arc::new(Server::new(registry, ServerConfig::default()));
//!     tokio::spawn(server.accept(listener));
//!
//!     let client = Client::dial(addr).await?;
//!     let doubled: i64 = client.call("Arith.Double", &21).await?;
//!     assert_eq!(doubled, 42);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod server;

// Re-export commonly used types
pub use client::{Call, Client, ClientBuilder, ClientConfig};
pub use error::{Error, HandshakeError, Result};
pub use handshake::{MAGIC_NUMBER, MAX_OPTIONS_SIZE, Options};
pub use registry::{CallContext, Invocation, MethodHandler, Registry, SequenceReply};
pub use server::{Server, ServerConfig, accept};

pub use proven_rpc_codec::{CodecError, CodecType, Header};
