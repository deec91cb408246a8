//! Wire codec and frame layout.
//!
//! Every message on the wire is a frame: a big-endian `u32` length followed
//! by that many payload bytes. A call writes a header frame then a body
//! frame; a reply mirrors the pair. The payload encoding is pluggable
//! through [`Codec`]; MsgPack is the default.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Larger frames indicate a desynced or
/// hostile peer and poison the connection.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Serializes values for the transport. Implementations must be
/// deterministic: equal values encode to equal bytes.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// MsgPack codec with struct fields encoded by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode<T: Serialize>(&self, value: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        rmp_serde::encode::write_named(buf, value).map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))
    }
}

/// Call header preceding the argument body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RequestHeader {
    pub service_method: String,
    pub seq: u64,
}

/// Reply header preceding the reply body. `error` carries the remote
/// handler's failure, in which case the body frame is empty.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResponseHeader {
    pub service_method: String,
    pub seq: u64,
    pub error: Option<String>,
}

/// Append one length-prefixed frame containing the encoded `value` to `buf`.
pub(crate) fn encode_frame<C: Codec, T: Serialize>(
    codec: &C,
    value: &T,
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    codec.encode(value, buf)?;
    let len = (buf.len() - start - 4) as u32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Append one length-prefixed frame with a raw payload.
pub(crate) fn append_frame(payload: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Read one frame into `buf`, replacing its contents.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    buf.resize(len, 0);
    reader.read_exact(buf).await?;
    Ok(())
}

/// Write pre-assembled frames in one syscall-friendly burst.
pub(crate) async fn write_all<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Sample {
        count: i64,
        label: String,
    }

    #[test]
    fn msgpack_round_trip() {
        let codec = MsgpackCodec;
        let value = Sample {
            count: 42,
            label: "hello".to_string(),
        };

        let mut buf = Vec::new();
        codec.encode(&value, &mut buf).unwrap();
        let decoded: Sample = codec.decode(&buf).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn encoding_is_deterministic() {
        let codec = MsgpackCodec;
        let value = Sample {
            count: 7,
            label: "same".to_string(),
        };

        let mut first = Vec::new();
        let mut second = Vec::new();
        codec.encode(&value, &mut first).unwrap();
        codec.encode(&value, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let codec = MsgpackCodec;
        let header = RequestHeader {
            service_method: "Test.Method".to_string(),
            seq: 3,
        };

        let mut wire = Vec::new();
        encode_frame(&codec, &header, &mut wire).unwrap();
        encode_frame(&codec, &9u64, &mut wire).unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let mut frame = Vec::new();

        read_frame(&mut cursor, &mut frame).await.unwrap();
        let decoded: RequestHeader = codec.decode(&frame).unwrap();
        assert_eq!(decoded.service_method, "Test.Method");
        assert_eq!(decoded.seq, 3);

        read_frame(&mut cursor, &mut frame).await.unwrap();
        let body: u64 = codec.decode(&frame).unwrap();
        assert_eq!(body, 9);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = std::io::Cursor::new(wire);
        let mut frame = Vec::new();

        let err = read_frame(&mut cursor, &mut frame).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
