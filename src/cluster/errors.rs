//! Cluster operation error families.

use thiserror::Error;

use crate::rpc::CodecError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyOwnerError {
    #[error("BlankKey")]
    BlankKey,
    #[error("MissingOwner")]
    MissingOwner,
}

#[derive(Debug, Error)]
pub enum GetError {
    #[error("BlankKey")]
    BlankKey,
    #[error("KeyNotInOwnedHashSlot")]
    KeyNotInOwnedHashSlot,
    #[error("KeyNotFound")]
    KeyNotFound,
    #[error("DecodeFailure: {0}")]
    DecodeFailure(#[source] CodecError),
}

#[derive(Debug, Error)]
pub enum SetError {
    #[error("BlankKey")]
    BlankKey,
    #[error("KeyNotInOwnedHashSlot")]
    KeyNotInOwnedHashSlot,
    #[error("EncodeFailure: {0}")]
    EncodeFailure(#[source] CodecError),
}

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("BlankKey")]
    BlankKey,
    #[error("KeyNotInOwnedHashSlot")]
    KeyNotInOwnedHashSlot,
}

impl From<KeyOwnerError> for GetError {
    fn from(err: KeyOwnerError) -> Self {
        match err {
            KeyOwnerError::BlankKey => GetError::BlankKey,
            KeyOwnerError::MissingOwner => GetError::KeyNotFound,
        }
    }
}

impl From<KeyOwnerError> for SetError {
    fn from(err: KeyOwnerError) -> Self {
        match err {
            KeyOwnerError::BlankKey => SetError::BlankKey,
            KeyOwnerError::MissingOwner => SetError::KeyNotInOwnedHashSlot,
        }
    }
}

impl From<KeyOwnerError> for DeleteError {
    fn from(err: KeyOwnerError) -> Self {
        match err {
            KeyOwnerError::BlankKey => DeleteError::BlankKey,
            KeyOwnerError::MissingOwner => DeleteError::KeyNotInOwnedHashSlot,
        }
    }
}
