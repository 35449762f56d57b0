//! Payload codec: bincode-encoded `Telemetry` carried as an opaque mesh payload.

use crate::protocol::Telemetry;

/// Mesh packets are tiny; anything bigger than this is not ours.
const MAX_PAYLOAD_LEN: usize = 64;

/// Encode a telemetry payload for the mesh transport.
pub fn encode_payload(msg: &Telemetry) -> Result<Vec<u8>, PayloadEncodeError> {
    let bytes = bincode::serialize(msg).map_err(PayloadEncodeError::Encode)?;
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(PayloadEncodeError::TooLarge);
    }
    Ok(bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("payload too large")]
    TooLarge,
}

/// Decode a received payload. Garbage from foreign apps on the same port
/// decodes to an error and is dropped by the caller.
pub fn decode_payload(bytes: &[u8]) -> Result<Telemetry, PayloadDecodeError> {
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(PayloadDecodeError::TooLarge);
    }
    bincode::deserialize(bytes).map_err(PayloadDecodeError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadDecodeError {
    #[error("payload too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
