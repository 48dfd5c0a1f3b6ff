//! Shared fixtures for the RPC integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use proven_rpc::{CallContext, Registry, Server, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumArgs {
    pub a: i64,
    pub b: i64,
}

/// Registry with a handful of arithmetic and diagnostic methods.
pub fn test_registry() -> Registry {
    let mut registry = Registry::new();

    registry
        .register("Arith.Sum", |args: SumArgs| async move {
            Ok::<_, String>(args.a + args.b)
        })
        .unwrap();

    registry
        .register("Arith.Div", |(a, b): (i64, i64)| async move {
            if b == 0 {
                return Err("divide by zero".to_string());
            }
            Ok(a / b)
        })
        .unwrap();

    // Later arguments finish first, so replies come back out of order
    registry
        .register("Arith.Double", |n: i64| async move {
            let delay = 20u64.saturating_sub(n.unsigned_abs() % 20);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, String>(n * 2)
        })
        .unwrap();

    registry
        .register("Echo.Echo", |msg: String| async move { Ok::<_, String>(msg) })
        .unwrap();

    registry
        .register_with_context("Seq.Echo", |ctx: CallContext, _: ()| async move {
            Ok::<_, String>(ctx.seq)
        })
        .unwrap();

    registry
        .register("Block.Forever", |_: ()| async move {
            std::future::pending::<()>().await;
            Ok::<u32, String>(0)
        })
        .unwrap();

    registry
}

/// Binds a server on an ephemeral port and accepts connections in the
/// background.
pub async fn spawn_server(registry: Registry) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Arc::new(Server::new(registry, ServerConfig::default()));
    tokio::spawn(proven_rpc::accept(server, listener));

    addr
}
