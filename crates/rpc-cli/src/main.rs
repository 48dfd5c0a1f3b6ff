//! CLI binary to run an RPC server or call one.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::sync::Arc;

use clap::{Parser, Subcommand};
use proven_rpc::{Client, Registry, SequenceReply, Server, ServerConfig};
use proven_rpc_codec::CodecType;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Call arguments were not valid JSON
    #[error("invalid arguments: {0}")]
    Args(#[from] serde_json::Error),

    /// Listener or connection error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// RPC library error
    #[error(transparent)]
    Rpc(#[from] proven_rpc::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on or connect to
    #[arg(long, default_value = "127.0.0.1:9999", env = "PROVEN_RPC_ADDR")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Serve the built-in demo methods until interrupted
    Serve,

    /// Call a method and print the reply as JSON
    Call {
        /// Codec negotiated with the server
        #[arg(long, default_value = "application/json", env = "PROVEN_RPC_CODEC")]
        codec: CodecType,

        /// Number of concurrent calls to issue
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Method name, e.g. `Echo.Echo`
        method: String,

        /// Arguments as a JSON document
        #[arg(default_value = "null")]
        args: String,
    },
}

fn demo_registry() -> Result<Registry, Error> {
    let mut registry = Registry::new();

    registry.register("Echo.Echo", |value: Value| async move {
        Ok::<_, String>(value)
    })?;

    registry.register("Arith.Sum", |numbers: Vec<i64>| async move {
        numbers
            .into_iter()
            .try_fold(0i64, i64::checked_add)
            .ok_or("sum overflows")
    })?;

    Ok(registry.with_fallback(SequenceReply))
}

async fn serve(addr: &str, shutdown_token: CancellationToken) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    let server = Arc::new(Server::new(demo_registry()?, ServerConfig::default()));

    tokio::select! {
        result = server.accept(listener) => result?,
        () = shutdown_token.cancelled() => info!("Shutting down"),
    }

    Ok(())
}

async fn call(
    addr: &str,
    codec: CodecType,
    count: usize,
    method: &str,
    args: &str,
    shutdown_token: CancellationToken,
) -> Result<(), Error> {
    let args: Value = serde_json::from_str(args)?;
    let client = Client::builder().codec_type(codec).dial(addr).await?;

    let (done, mut calls) = mpsc::channel(count.max(1));
    for _ in 0..count {
        client.go_with::<_, Value>(method, &args, done.clone()).await;
    }
    drop(done);

    let mut failed = None;
    let collect = async {
        while let Some(call) = calls.recv().await {
            match call.result {
                Ok(reply) => println!("{} {}", call.seq, reply),
                Err(e) => {
                    error!(seq = call.seq, "call failed: {}", e);
                    failed = Some(e);
                }
            }
        }
    };

    tokio::select! {
        () = collect => {}
        () = shutdown_token.cancelled() => info!("Interrupted, abandoning pending calls"),
    }

    if let Err(e) = client.close().await {
        error!("close failed: {}", e);
    }

    failed.map_or(Ok(()), |e| Err(e.into()))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let shutdown_token = CancellationToken::new();

    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for interrupt: {}", e);
            return;
        }

        info!("Received interrupt signal");
        signal_shutdown_token.cancel();
    });

    match args.command {
        Command::Serve => serve(&args.addr, shutdown_token).await,
        Command::Call {
            codec,
            count,
            method,
            args: call_args,
        } => call(&args.addr, codec, count, &method, &call_args, shutdown_token).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[tokio::test]
    async fn test_call_returns_when_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Accept the connection and never answer
        tokio::spawn(async move {
            let _stream = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let shutdown_token = CancellationToken::new();
        shutdown_token.cancel();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            call(
                &addr,
                CodecType::Json,
                1,
                "Echo.Echo",
                "\"hi\"",
                shutdown_token,
            ),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
