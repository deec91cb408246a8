//! RPC server: handler registry, listener, and per-connection serving.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bytespool;

use super::client::{DEFAULT_RECEIVE_TIMEOUT, DEFAULT_SEND_TIMEOUT, configure_stream};
use super::codec::{Codec, MsgpackCodec, RequestHeader, ResponseHeader, append_frame, encode_frame, read_frame, write_all};
use super::errors::{HandlersError, ListenError};

/// Method name of the liveness built-in. Always registered; replies `1`.
pub const METHOD_PING: &str = "BuiltIn.Ping";

type BoxedHandler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Dispatch table keyed by `"Type.Method"` strings.
pub struct HandlerRegistry<C: Codec = MsgpackCodec> {
    codec: C,
    handlers: HashMap<String, BoxedHandler>,
}

impl<C: Codec> HandlerRegistry<C> {
    fn new(codec: C) -> Self {
        Self {
            codec,
            handlers: HashMap::new(),
        }
    }

    /// Publish `handler` under `service_method`.
    ///
    /// The name must have the `Type.Method` shape and be unused; violations
    /// are `RpcFailure`. Argument and reply types go through the server
    /// codec, so both sides must agree on them.
    pub fn register<Args, Reply, F>(
        &mut self,
        service_method: &str,
        handler: F,
    ) -> Result<(), HandlersError>
    where
        Args: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
        F: Fn(Args) -> Result<Reply, String> + Send + Sync + 'static,
    {
        let mut parts = service_method.splitn(2, '.');
        let service = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default();
        if service.is_empty() || method.is_empty() {
            return Err(HandlersError::RpcFailure(format!(
                "method name {service_method:?} is not of the form Type.Method"
            )));
        }

        if self.handlers.contains_key(service_method) {
            return Err(HandlersError::RpcFailure(format!(
                "method {service_method:?} already registered"
            )));
        }

        let codec = self.codec.clone();
        self.handlers.insert(
            service_method.to_string(),
            Box::new(move |raw| {
                let args: Args = codec.decode(raw).map_err(|err| err.to_string())?;
                let reply = handler(args)?;
                let mut buf = Vec::new();
                codec.encode(&reply, &mut buf).map_err(|err| err.to_string())?;
                Ok(buf)
            }),
        );
        Ok(())
    }

    fn dispatch(&self, service_method: &str, raw_args: &[u8]) -> Option<Result<Vec<u8>, String>> {
        self.handlers.get(service_method).map(|handler| handler(raw_args))
    }
}

/// A set of related handlers registered together, mirroring the
/// `Type.Method` grouping on the wire.
pub trait Handlers<C: Codec> {
    fn register(&self, registry: &mut HandlerRegistry<C>) -> Result<(), HandlersError>;
}

struct ServerInner<C: Codec> {
    host: String,
    port: String,
    address: String,
    codec: C,
    registry: RwLock<HandlerRegistry<C>>,
    send_timeout: Duration,
    receive_timeout: Duration,
}

/// RPC server. One task per accepted connection; requests on a connection
/// are answered in order.
pub struct Server<C: Codec = MsgpackCodec> {
    inner: Arc<ServerInner<C>>,
}

impl<C: Codec> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Server<MsgpackCodec> {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self::with_codec(MsgpackCodec, host, port)
    }
}

impl<C: Codec> Server<C> {
    pub fn with_codec(codec: C, host: impl Into<String>, port: impl Into<String>) -> Self {
        let host = host.into();
        let port = port.into();
        let address = format!("{host}:{port}");
        Self {
            inner: Arc::new(ServerInner {
                host,
                port,
                address,
                codec: codec.clone(),
                registry: RwLock::new(HandlerRegistry::new(codec)),
                send_timeout: DEFAULT_SEND_TIMEOUT,
                receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> &str {
        &self.inner.port
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Register every method of `handlers`.
    pub fn register_handlers<H: Handlers<C>>(&self, handlers: &H) -> Result<(), HandlersError> {
        let mut registry = self.inner.registry.write();
        handlers.register(&mut registry)
    }

    /// Bind the listener and publish the built-in methods.
    pub async fn listen(&self) -> Result<TcpListener, ListenError> {
        {
            let mut registry = self.inner.registry.write();
            registry
                .register::<(), i64, _>(METHOD_PING, |_args| {
                    debug!("ping");
                    Ok(1)
                })
                .map_err(|err| match err {
                    HandlersError::RpcFailure(message) => ListenError::RpcFailure(message),
                })?;
        }

        let listener = TcpListener::bind(&self.inner.address)
            .await
            .map_err(ListenError::ListenFailure)?;
        debug!(address = %self.inner.address, "listening for connections");
        Ok(listener)
    }

    /// Serve until `shutdown` fires. Per-connection failures are logged and
    /// never tear the server down.
    pub async fn accept_connections(&self, listener: TcpListener, shutdown: CancellationToken) {
        debug!(address = %self.inner.address, "accepting new connections");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(%err, "failed to accept connection");
                            continue;
                        }
                    };
                    if let Err(err) = configure_stream(&stream) {
                        warn!(%err, client = %remote, "failed to configure connection");
                        continue;
                    }

                    let server = self.clone();
                    let token = shutdown.clone();
                    tokio::spawn(async move {
                        server.serve_connection(stream, remote, token).await;
                    });
                }
            }
        }
        debug!(address = %self.inner.address, "accept loop stopped");
    }

    async fn serve_connection(
        &self,
        mut stream: TcpStream,
        remote: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let mut frame = bytespool::get();

        loop {
            // Idle between calls: wait for the next header with no deadline,
            // but bail out as soon as shutdown is requested.
            let header_read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = read_frame(&mut stream, &mut frame) => read,
            };
            if let Err(err) = header_read {
                if err.kind() != std::io::ErrorKind::UnexpectedEof {
                    debug!(%err, client = %remote, "failed to read request header");
                }
                break;
            }

            let header: RequestHeader = match self.inner.codec.decode(&frame) {
                Ok(header) => header,
                Err(err) => {
                    debug!(%err, client = %remote, "failed to decode request header");
                    break;
                }
            };

            let body_read = tokio::time::timeout(
                self.inner.receive_timeout,
                read_frame(&mut stream, &mut frame),
            )
            .await;
            match body_read {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(%err, client = %remote, "failed to read request body");
                    break;
                }
                Err(_) => {
                    debug!(client = %remote, "timed out reading request body");
                    break;
                }
            }

            let dispatched = {
                let registry = self.inner.registry.read();
                registry.dispatch(&header.service_method, &frame)
            };
            let (error, reply_bytes) = match dispatched {
                Some(Ok(bytes)) => (None, bytes),
                Some(Err(message)) => (Some(message), Vec::new()),
                None => (
                    Some(format!("rpc: unknown method {:?}", header.service_method)),
                    Vec::new(),
                ),
            };

            let response_header = ResponseHeader {
                service_method: header.service_method,
                seq: header.seq,
                error,
            };

            let mut wire = bytespool::get();
            if let Err(err) = encode_frame(&self.inner.codec, &response_header, &mut wire) {
                warn!(%err, client = %remote, "failed to encode response header");
                bytespool::put(wire);
                break;
            }
            append_frame(&reply_bytes, &mut wire);

            let written =
                tokio::time::timeout(self.inner.send_timeout, write_all(&mut stream, &wire)).await;
            bytespool::put(wire);
            match written {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(%err, client = %remote, "failed to write response");
                    break;
                }
                Err(_) => {
                    debug!(client = %remote, "timed out writing response");
                    break;
                }
            }
        }

        bytespool::put(frame);
        debug!(client = %remote, "connection closed");
    }
}
