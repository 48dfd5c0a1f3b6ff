//! RPC client implementation.
//!
//! A client owns one connection. Calls are written under a send lock and
//! parked in a pending table keyed by sequence number; a single background
//! task reads responses and completes the matching call. When that task stops,
//! for any reason, every call still pending fails with the error that stopped
//! it.

use crate::error::{Error, Result};
use crate::handshake::{Options, write_options};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use proven_rpc_codec::framing::MAX_FRAME_SIZE;
use proven_rpc_codec::{CodecError, CodecReader, CodecType, CodecWriter, Header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, error, info_span, instrument, warn};

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Codec negotiated with the server.
    pub codec_type: CodecType,
    /// Capacity of the completion channel created by [`Client::go`].
    pub done_capacity: usize,
    /// Maximum frame size accepted from the server.
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            codec_type: CodecType::default(),
            done_capacity: 10,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Builder for creating RPC clients.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the codec negotiated with the server.
    #[must_use]
    pub const fn codec_type(mut self, codec_type: CodecType) -> Self {
        self.config.codec_type = codec_type;
        self
    }

    /// Set the capacity of channels created by [`Client::go`]. Zero is
    /// treated as one.
    #[must_use]
    pub const fn done_capacity(mut self, capacity: usize) -> Self {
        self.config.done_capacity = capacity;
        self
    }

    /// Set the maximum frame size accepted from the server.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Performs the handshake over `stream` and starts the receiver.
    ///
    /// # Errors
    ///
    /// Returns an error if the options cannot be written.
    pub async fn connect<S>(self, mut stream: S) -> Result<Client>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let options = Options::new(self.config.codec_type);
        if let Err(e) = write_options(&mut stream, &options).await {
            error!("rpc client: options error: {}", e);
            return Err(e.into());
        }

        let (reader, writer) = options
            .codec_type
            .new_codec(stream, self.config.max_frame_size);

        Ok(Client::start(self.config, reader, writer))
    }

    /// Connects to `addr` over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn dial(self, addr: impl ToSocketAddrs) -> Result<Client> {
        let stream = TcpStream::connect(addr).await?;
        self.connect(stream).await
    }
}

/// Outcome of one call, delivered on its completion channel.
pub struct Call<R> {
    /// Sequence number, or 0 if the call was rejected before being sent.
    pub seq: u64,
    /// Method that was called.
    pub service_method: String,
    /// Decoded reply or the error that ended the call.
    pub result: Result<R>,
}

impl<R> Call<R> {
    /// Decoded reply, if the call succeeded.
    pub fn reply(&self) -> Option<&R> {
        self.result.as_ref().ok()
    }

    /// Error that ended the call, if any.
    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    /// Consumes the call, returning the reply or its error.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the call.
    pub fn into_result(self) -> Result<R> {
        self.result
    }
}

impl<R: fmt::Debug> fmt::Debug for Call<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("seq", &self.seq)
            .field("service_method", &self.service_method)
            .field("result", &self.result)
            .finish()
    }
}

/// Encoded reply body or the error ending the call.
type Completion = std::result::Result<Bytes, Error>;

/// Delivers a call exactly once, given its sequence number.
type PendingCall = Box<dyn FnOnce(u64, Completion) -> BoxFuture<'static, ()> + Send>;

struct State {
    seq: u64,
    pending: HashMap<u64, PendingCall>,
    closing: bool,
    shutdown: bool,
}

struct Inner {
    codec_type: CodecType,
    writer: tokio::sync::Mutex<Box<dyn CodecWriter>>,
    state: parking_lot::Mutex<State>,
}

impl Inner {
    /// Assigns the next sequence number, or hands the call back if the client
    /// is going away.
    fn register_call(&self, call: PendingCall) -> std::result::Result<u64, PendingCall> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(call);
        }

        let seq = state.seq;
        state.pending.insert(seq, call);
        state.seq += 1;
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<PendingCall> {
        self.state.lock().pending.remove(&seq)
    }

    async fn send<A>(&self, service_method: &str, args: &A, call: PendingCall)
    where
        A: Serialize + ?Sized,
    {
        let mut writer = self.writer.lock().await;

        let seq = match self.register_call(call) {
            Ok(seq) => seq,
            Err(call) => {
                drop(writer);
                call(0, Err(Error::Shutdown)).await;
                return;
            }
        };

        let header = Header::new(service_method, seq);
        debug!(seq, method = service_method, "sending request");

        let result = match self.codec_type.encode(args) {
            Ok(body) => writer.write(&header, body).await,
            Err(e) => Err(e),
        };
        drop(writer);

        if let Err(e) = result {
            warn!(seq, "rpc client: send error: {}", e);
            // The receiver may have swept the call already
            if let Some(call) = self.remove_call(seq) {
                call(seq, Err(e.into())).await;
            }
        }
    }

    /// Marks the client shut down and fails every pending call with `err`.
    async fn terminate(&self, err: Error) {
        let writer = self.writer.lock().await;
        let pending = {
            let mut state = self.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.pending)
        };
        drop(writer);

        if !pending.is_empty() {
            debug!(count = pending.len(), "failing pending calls: {}", err);
        }

        for (seq, call) in pending {
            call(seq, Err(err.clone())).await;
        }
    }
}

/// RPC client bound to a single connection.
pub struct Client {
    inner: Arc<Inner>,
    done_capacity: usize,
    shutdown_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl Client {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connects to `addr` over TCP with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn dial(addr: impl ToSocketAddrs) -> Result<Self> {
        ClientBuilder::new().dial(addr).await
    }

    fn start(
        config: ClientConfig,
        reader: Box<dyn CodecReader>,
        writer: Box<dyn CodecWriter>,
    ) -> Self {
        let inner = Arc::new(Inner {
            codec_type: config.codec_type,
            writer: tokio::sync::Mutex::new(writer),
            state: parking_lot::Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(
            receive(Arc::clone(&inner), reader, shutdown_rx)
                .instrument(info_span!("rpc_client", codec = %config.codec_type)),
        );

        Self {
            inner,
            done_capacity: config.done_capacity,
            shutdown_tx: parking_lot::Mutex::new(Some(shutdown_tx)),
        }
    }

    /// Sends a request and delivers its outcome on `done`.
    ///
    /// Returns once the request has been written, or once the outcome has
    /// been delivered if it could not be.
    pub async fn go_with<A, R>(&self, service_method: &str, args: &A, done: mpsc::Sender<Call<R>>)
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let codec_type = self.inner.codec_type;
        let method = service_method.to_string();

        let call: PendingCall = Box::new(move |seq: u64, completion: Completion| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                let result = completion
                    .and_then(|body| codec_type.decode(&body).map_err(Error::ReplyBody));
                let call = Call {
                    seq,
                    service_method: method,
                    result,
                };

                if done.send(call).await.is_err() {
                    debug!(seq, "rpc client: completion dropped");
                }
            })
        });

        self.inner.send(service_method, args, call).await;
    }

    /// Sends a request, returning the channel its outcome will arrive on.
    pub async fn go<A, R>(&self, service_method: &str, args: &A) -> mpsc::Receiver<Call<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, rx) = mpsc::channel(self.done_capacity.max(1));
        self.go_with(service_method, args, done).await;
        rx
    }

    /// Sends a request and waits for its reply.
    ///
    /// # Errors
    ///
    /// Returns the remote error, a transport error, or [`Error::Shutdown`]
    /// if the client is closed.
    #[instrument(skip(self, args))]
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, mut rx) = mpsc::channel(1);
        self.go_with(service_method, args, done).await;
        rx.recv().await.ok_or(Error::Shutdown)?.into_result()
    }

    /// Closes the connection. Pending calls fail with [`Error::Shutdown`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the client is already closed or torn
    /// down, or the error from closing the transport.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closing || state.shutdown {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }

        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(());
        }

        self.inner.writer.lock().await.close().await?;
        Ok(())
    }

    /// Whether the client can still send requests.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Client")
            .field("codec_type", &self.inner.codec_type)
            .field("next_seq", &state.seq)
            .field("pending", &state.pending.len())
            .field("closing", &state.closing)
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

type Response = (Header, std::result::Result<Bytes, CodecError>);

async fn read_response(
    reader: &mut dyn CodecReader,
) -> std::result::Result<Response, CodecError> {
    let header = reader.read_header().await?;
    let body = reader.read_body().await;
    Ok((header, body))
}

/// Reads responses until the connection fails or the client is closed, then
/// fails whatever is still pending.
async fn receive(
    inner: Arc<Inner>,
    mut reader: Box<dyn CodecReader>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let err = loop {
        let response = tokio::select! {
            biased;
            _ = &mut shutdown_rx => break Error::Shutdown,
            response = read_response(reader.as_mut()) => response,
        };

        let (header, body) = match response {
            Ok(response) => response,
            Err(e) => {
                if e.is_eof() {
                    debug!("Connection closed by server");
                } else {
                    error!("rpc client: read header error: {}", e);
                }
                break e.into();
            }
        };

        let seq = header.seq;
        match (inner.remove_call(seq), body) {
            (Some(call), body) if header.is_error() => {
                call(seq, Err(Error::Remote(header.error))).await;
                if let Err(e) = body {
                    break e.into();
                }
            }
            (Some(call), Err(e)) => {
                call(seq, Err(Error::ReplyBody(e.clone()))).await;
                break e.into();
            }
            (None, Err(e)) => break e.into(),
            (None, Ok(_)) => debug!(seq, "rpc client: no pending call"),
            (Some(call), Ok(body)) => call(seq, Ok(body)).await,
        }
    };

    inner.terminate(err).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{MAX_OPTIONS_SIZE, read_options};

    use async_trait::async_trait;
    use futures::SinkExt;
    use proven_rpc_codec::JsonReader;
    use proven_rpc_codec::framing::{Frame, FrameCodec, FrameKind};
    use tokio::io::duplex;
    use tokio_util::codec::FramedWrite;

    struct BrokenPipeWriter;

    #[async_trait]
    impl CodecWriter for BrokenPipeWriter {
        async fn write(
            &mut self,
            _header: &Header,
            _body: Bytes,
        ) -> std::result::Result<(), CodecError> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into())
        }

        async fn close(&mut self) -> std::result::Result<(), CodecError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_peer_gone_leaves_nothing_pending() {
        let (conn, mut peer) = duplex(4096);
        let client = Client::builder().connect(conn).await.unwrap();

        read_options(&mut peer, MAX_OPTIONS_SIZE).await.unwrap();
        drop(peer);

        let result: Result<String> = client.call("Foo.Sum", "rpc req 1").await;
        assert!(result.is_err());
        assert!(client.inner.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_without_sequence() {
        let (conn, mut peer) = duplex(4096);
        let client = Client::builder().connect(conn).await.unwrap();
        read_options(&mut peer, MAX_OPTIONS_SIZE).await.unwrap();

        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(matches!(client.close().await, Err(Error::Shutdown)));

        let mut done = client.go::<_, String>("Foo.Sum", "rpc req 1").await;
        let call = done.recv().await.unwrap();
        assert_eq!(call.seq, 0);
        assert_eq!(call.service_method, "Foo.Sum");
        assert!(matches!(call.error(), Some(Error::Shutdown)));

        // Rejected calls never consume a sequence number
        assert_eq!(client.inner.state.lock().seq, 1);
    }

    #[tokio::test]
    async fn test_write_failure_fails_only_that_call() {
        // The read side stays open, so only the failed write can end the call
        let (conn, _peer) = duplex(4096);
        let reader = Box::new(JsonReader::new(conn, MAX_FRAME_SIZE));
        let client = Client::start(ClientConfig::default(), reader, Box::new(BrokenPipeWriter));

        let result: Result<String> = client.call("Foo.Sum", "rpc req 1").await;
        assert!(matches!(
            result,
            Err(Error::Codec(CodecError::Io(e))) if e.kind() == std::io::ErrorKind::BrokenPipe
        ));

        assert!(client.inner.state.lock().pending.is_empty());
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_remote_error_reported_when_body_unreadable() {
        let (conn, mut peer) = duplex(4096);
        let client = Client::builder()
            .codec_type(CodecType::Cbor)
            .connect(conn)
            .await
            .unwrap();
        read_options(&mut peer, MAX_OPTIONS_SIZE).await.unwrap();

        let mut done = client.go::<_, String>("Foo.Sum", "rpc req 1").await;

        let mut header = Header::new("Foo.Sum", 1);
        header.error = "boom".to_string();
        let payload = CodecType::Cbor.encode(&header).unwrap();

        // A second header stands where the body should be
        let mut frames = FramedWrite::new(peer, FrameCodec::new());
        frames
            .send(Frame::new(FrameKind::Header, payload.clone()))
            .await
            .unwrap();
        frames
            .send(Frame::new(FrameKind::Header, payload))
            .await
            .unwrap();

        let call = done.recv().await.unwrap();
        assert_eq!(call.seq, 1);
        assert!(matches!(call.error(), Some(Error::Remote(msg)) if msg == "boom"));
    }
}
