//! Length-framed, codec-pluggable RPC over TCP.

pub mod client;
pub mod codec;
pub mod errors;
pub mod server;

pub use client::Client;
pub use codec::{Codec, CodecError, MsgpackCodec, RequestHeader, ResponseHeader};
pub use errors::{CallError, ConnectError, HandlersError, ListenError, ReceiveError, SendError};
pub use server::{HandlerRegistry, Handlers, METHOD_PING, Server};
