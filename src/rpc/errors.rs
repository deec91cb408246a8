//! RPC error families.
//!
//! Each family is a small enumeration with a stable display form; variants
//! wrap the underlying error where one exists.

use thiserror::Error;

use super::codec::CodecError;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("InvalidAddress: {0}")]
    InvalidAddress(#[source] std::io::Error),
    #[error("ConnectionFailure: {0}")]
    ConnectionFailure(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("ListenFailure: {0}")]
    ListenFailure(#[source] std::io::Error),
    #[error("RpcFailure: {0}")]
    RpcFailure(String),
}

#[derive(Debug, Error)]
pub enum HandlersError {
    #[error("RpcFailure: {0}")]
    RpcFailure(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("NotConnected")]
    NotConnected,
    #[error("WriteFailure: {0}")]
    WriteFailure(#[source] std::io::Error),
    #[error("EncodeFailure: {0}")]
    EncodeFailure(#[from] CodecError),
    #[error("ContextCanceled")]
    ContextCanceled,
    #[error("DeadlineExceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("NotConnected")]
    NotConnected,
    #[error("ReadFailure: {0}")]
    ReadFailure(#[source] std::io::Error),
    #[error("DecodeFailure: {0}")]
    DecodeFailure(#[from] CodecError),
    #[error("ContextCanceled")]
    ContextCanceled,
    #[error("DeadlineExceeded")]
    DeadlineExceeded,
    #[error("EOF")]
    Eof,
}

/// A full request/reply exchange can fail on either leg, or be rejected by
/// the remote handler.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Receive(#[from] ReceiveError),
    #[error("remote error: {0}")]
    Remote(String),
}
