//! RPC server implementation.

use crate::error::Result;
use crate::handshake::{MAX_OPTIONS_SIZE, read_options};
use crate::registry::{CallContext, Invocation, Registry};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use proven_rpc_codec::framing::MAX_FRAME_SIZE;
use proven_rpc_codec::{CodecReader, CodecType, CodecWriter, Header};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Writing half of a connection, shared by every handler on it.
type SharedWriter = Arc<Mutex<Box<dyn CodecWriter>>>;

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum frame size accepted from clients.
    pub max_frame_size: usize,
    /// Maximum size of the handshake options.
    pub max_options_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            max_options_size: MAX_OPTIONS_SIZE,
        }
    }
}

/// RPC server dispatching requests to a [`Registry`].
#[derive(Debug)]
pub struct Server {
    registry: Registry,
    config: ServerConfig,
}

impl Server {
    /// Create a new RPC server.
    #[must_use]
    pub const fn new(registry: Registry, config: ServerConfig) -> Self {
        Self { registry, config }
    }

    /// Methods served by this server.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Accepts connections until the listener fails, serving each one on its
    /// own task.
    ///
    /// # Errors
    ///
    /// Returns the listener error that stopped the loop.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("RPC server listening on {}", addr);
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("rpc server: accept error: {}", e);
                    return Err(e.into());
                }
            };

            debug!("New connection from {}", addr);
            let server = Arc::clone(&self);
            tokio::spawn(
                async move { server.serve_conn(stream).await }
                    .instrument(info_span!("rpc_conn", %addr)),
            );
        }
    }

    /// Serves a single connection until it fails or the client hangs up.
    ///
    /// The connection is dropped without a reply if the handshake fails.
    #[instrument(skip_all)]
    pub async fn serve_conn<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let options = match read_options(&mut stream, self.config.max_options_size).await {
            Ok(options) => options,
            Err(e) => {
                error!("rpc server: options error: {}", e);
                return;
            }
        };

        debug!(codec = %options.codec_type, "handshake complete");
        let (reader, writer) = options
            .codec_type
            .new_codec(stream, self.config.max_frame_size);

        self.serve_codec(options.codec_type, reader, writer).await;
    }

    async fn serve_codec(
        &self,
        codec_type: CodecType,
        mut reader: Box<dyn CodecReader>,
        writer: Box<dyn CodecWriter>,
    ) {
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let tracker = TaskTracker::new();

        loop {
            let mut header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => {
                    if e.is_eof() {
                        debug!("Connection closed by client");
                    } else {
                        error!("rpc server: read header error: {}", e);
                    }
                    break;
                }
            };

            match self.read_request(codec_type, &header, reader.as_mut()).await {
                Ok(invocation) => {
                    tracker.spawn(handle_request(
                        header,
                        invocation,
                        codec_type,
                        Arc::clone(&writer),
                    ));
                }
                Err(e) => {
                    warn!(seq = header.seq, "{}", e);
                    header.error = e;
                    send_response(&writer, &header, codec_type.empty_body()).await;
                }
            }
        }

        tracker.close();
        tracker.wait().await;

        if let Err(e) = writer.lock().await.close().await {
            debug!("rpc server: close error: {}", e);
        }
    }

    /// Reads the body for `header` and prepares its invocation. The error is
    /// the text sent back to the client.
    async fn read_request(
        &self,
        codec_type: CodecType,
        header: &Header,
        reader: &mut dyn CodecReader,
    ) -> std::result::Result<Invocation, String> {
        let Some(handler) = self.registry.resolve(&header.service_method) else {
            if let Err(e) = reader.discard_body().await {
                debug!("rpc server: discard body error: {}", e);
            }
            return Err(format!(
                "rpc server: can't find method {}",
                header.service_method
            ));
        };

        let ctx = CallContext {
            seq: header.seq,
            service_method: header.service_method.clone(),
        };

        reader
            .read_body()
            .await
            .and_then(|body| handler.prepare(ctx, codec_type, &body))
            .map_err(|e| format!("rpc server: read body: {e}"))
    }
}

/// Accepts connections on `listener` for `server`.
///
/// # Errors
///
/// Returns the listener error that stopped the loop.
pub async fn accept(server: Arc<Server>, listener: TcpListener) -> Result<()> {
    server.accept(listener).await
}

async fn handle_request(
    mut header: Header,
    invocation: Invocation,
    codec_type: CodecType,
    writer: SharedWriter,
) {
    let body = match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            header.error = e;
            codec_type.empty_body()
        }
        Err(_) => {
            error!(seq = header.seq, method = %header.service_method, "handler panicked");
            header.error = "rpc server: handler panicked".to_string();
            codec_type.empty_body()
        }
    };

    send_response(&writer, &header, body).await;
}

async fn send_response(writer: &SharedWriter, header: &Header, body: Bytes) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write(header, body).await {
        error!("rpc server: write response error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{Options, write_options};

    use proven_rpc_codec::JSON;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, duplex};
    use tracing_test::traced_test;

    fn echo_server() -> Arc<Server> {
        let mut registry = Registry::new();
        registry
            .register("Echo.Echo", |msg: String| async move { Ok::<_, String>(msg) })
            .unwrap();
        Arc::new(Server::new(registry, ServerConfig::default()))
    }

    #[tokio::test]
    async fn test_json_wire_exchange() {
        let server = echo_server();
        let (mut client, conn) = duplex(4096);
        let serving = tokio::spawn(async move { server.serve_conn(conn).await });

        client
            .write_all(
                format!("{{\"MagicNumber\":4294932343,\"CodecType\":\"{JSON}\"}}\n").as_bytes(),
            )
            .await
            .unwrap();
        client
            .write_all(b"{\"ServiceMethod\":\"Echo.Echo\",\"Seq\":7,\"Error\":\"\"}\n\"hi\"\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut lines = BufReader::new(client).lines();
        let header: Header = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(header, Header::new("Echo.Echo", 7));
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "\"hi\"");
        assert!(lines.next_line().await.unwrap().is_none());

        serving.await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_method_keeps_serving() {
        let server = echo_server();
        let (client, conn) = duplex(4096);
        let serving = tokio::spawn(async move { server.serve_conn(conn).await });

        let (read_half, mut write_half) = tokio::io::split(client);
        write_options(&mut write_half, &Options::new(CodecType::Json))
            .await
            .unwrap();
        write_half
            .write_all(b"{\"ServiceMethod\":\"Nope.Nope\",\"Seq\":1}\n1\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let header: Header = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(header.seq, 1);
        assert_eq!(header.error, "rpc server: can't find method Nope.Nope");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "null");

        write_half
            .write_all(b"{\"ServiceMethod\":\"Echo.Echo\",\"Seq\":2}\n\"again\"\n")
            .await
            .unwrap();
        write_half.shutdown().await.unwrap();

        let header: Header = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(header, Header::new("Echo.Echo", 2));
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "\"again\"");

        serving.await.unwrap();
        assert!(logs_contain("can't find method Nope.Nope"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_handshake_failure_drops_connection() {
        let server = echo_server();
        let (mut client, conn) = duplex(4096);

        client
            .write_all(b"{\"MagicNumber\":1,\"CodecType\":\"application/json\"}\n")
            .await
            .unwrap();
        server.serve_conn(conn).await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        assert!(logs_contain("invalid magic number: 0x1"));
    }

    #[tokio::test]
    async fn test_panicking_handler_answered() {
        let mut registry = Registry::new();
        registry
            .register("Boom.Boom", |n: u32| async move {
                if n > 0 {
                    panic!("boom");
                }
                Ok::<_, String>(n)
            })
            .unwrap();
        let server = Server::new(registry, ServerConfig::default());

        let (client, conn) = duplex(4096);
        let serving = tokio::spawn(async move { server.serve_conn(conn).await });

        let (read_half, mut write_half) = tokio::io::split(client);
        write_options(&mut write_half, &Options::default())
            .await
            .unwrap();
        write_half
            .write_all(b"{\"ServiceMethod\":\"Boom.Boom\",\"Seq\":1}\n1\n")
            .await
            .unwrap();
        write_half.shutdown().await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let header: Header = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(header.error, "rpc server: handler panicked");

        serving.await.unwrap();
    }
}
