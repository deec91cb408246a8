//! RPC client: a single connection with serialized request/reply calls.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::bytespool;

use super::codec::{Codec, MsgpackCodec, RequestHeader, ResponseHeader, encode_frame, read_frame, write_all};
use super::errors::{CallError, ConnectError, ReceiveError, SendError};

pub(crate) const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(10);

struct Connection {
    stream: TcpStream,
    seq: u64,
}

struct ClientInner<C: Codec> {
    host: String,
    port: String,
    address: String,
    codec: C,
    send_timeout: Duration,
    receive_timeout: Duration,
    connection: Mutex<Option<Connection>>,
}

/// Connection-oriented RPC client.
///
/// Cheap to clone; all clones share the same connection. Concurrent calls
/// are serialized by an internal mutex, matching the one-reply-per-request
/// framing of the transport.
pub struct Client<C: Codec = MsgpackCodec> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Codec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Client<MsgpackCodec> {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self::with_codec(MsgpackCodec, host, port)
    }
}

impl<C: Codec> Client<C> {
    pub fn with_codec(codec: C, host: impl Into<String>, port: impl Into<String>) -> Self {
        let host = host.into();
        let port = port.into();
        let address = format!("{host}:{port}");
        Self {
            inner: Arc::new(ClientInner {
                host,
                port,
                address,
                codec,
                send_timeout: DEFAULT_SEND_TIMEOUT,
                receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
                connection: Mutex::new(None),
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

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.lock().await.is_some()
    }

    /// Dial the remote endpoint. Keep-alive is enabled and Nagle batching is
    /// left on.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let _resolved = tokio::net::lookup_host(&self.inner.address)
            .await
            .map_err(ConnectError::InvalidAddress)?;

        let stream = TcpStream::connect(&self.inner.address)
            .await
            .map_err(ConnectError::ConnectionFailure)?;
        configure_stream(&stream).map_err(ConnectError::ConnectionFailure)?;

        debug!(address = %self.inner.address, "client connected");
        *self.inner.connection.lock().await = Some(Connection { stream, seq: 0 });
        Ok(())
    }

    /// Close the connection. Safe to call repeatedly or while disconnected.
    pub async fn disconnect(&self) {
        if self.inner.connection.lock().await.take().is_some() {
            debug!(address = %self.inner.address, "client disconnected");
        }
    }

    /// Issue one request and wait for its reply.
    ///
    /// Send and receive each honor their own deadline. A transport-level
    /// failure leaves the connection closed; the next call reports
    /// `NotConnected`.
    pub async fn call<Args, Reply>(
        &self,
        service_method: &str,
        args: &Args,
    ) -> Result<Reply, CallError>
    where
        Args: Serialize,
        Reply: DeserializeOwned,
    {
        let mut guard = self.inner.connection.lock().await;
        let connection = guard.as_mut().ok_or(SendError::NotConnected)?;
        connection.seq += 1;
        let seq = connection.seq;

        let header = RequestHeader {
            service_method: service_method.to_string(),
            seq,
        };

        let mut wire = bytespool::get();
        if let Err(err) = encode_frame(&self.inner.codec, &header, &mut wire)
            .and_then(|()| encode_frame(&self.inner.codec, args, &mut wire))
        {
            bytespool::put(wire);
            return Err(SendError::from(err).into());
        }

        let sent = tokio::time::timeout(
            self.inner.send_timeout,
            write_all(&mut connection.stream, &wire),
        )
        .await;
        bytespool::put(wire);

        match sent {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                *guard = None;
                return Err(SendError::WriteFailure(err).into());
            }
            Err(_) => {
                *guard = None;
                return Err(SendError::DeadlineExceeded.into());
            }
        }

        let received = tokio::time::timeout(
            self.inner.receive_timeout,
            read_response::<C, Reply>(&self.inner.codec, connection, seq),
        )
        .await;

        match received {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                if matches!(err, CallError::Receive(_)) {
                    *guard = None;
                }
                Err(err)
            }
            Err(_) => {
                *guard = None;
                Err(ReceiveError::DeadlineExceeded.into())
            }
        }
    }
}

async fn read_response<C: Codec, Reply: DeserializeOwned>(
    codec: &C,
    connection: &mut Connection,
    expected_seq: u64,
) -> Result<Reply, CallError> {
    let mut frame = bytespool::get();

    let result = async {
        read_frame(&mut connection.stream, &mut frame)
            .await
            .map_err(map_read_error)?;
        let header: ResponseHeader = codec.decode(&frame).map_err(ReceiveError::from)?;

        if header.seq != expected_seq {
            return Err(ReceiveError::ReadFailure(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("reply sequence {} does not match call {expected_seq}", header.seq),
            ))
            .into());
        }

        read_frame(&mut connection.stream, &mut frame)
            .await
            .map_err(map_read_error)?;

        if let Some(message) = header.error {
            return Err(CallError::Remote(message));
        }

        let reply: Reply = codec.decode(&frame).map_err(ReceiveError::from)?;
        Ok(reply)
    }
    .await;

    bytespool::put(frame);
    result
}

fn map_read_error(err: std::io::Error) -> ReceiveError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ReceiveError::Eof
    } else {
        ReceiveError::ReadFailure(err)
    }
}

/// Enable keep-alive and leave Nagle batching on for both client and
/// accepted server sockets.
pub(crate) fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(DEFAULT_KEEPALIVE_PERIOD);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    stream.set_nodelay(false)
}
