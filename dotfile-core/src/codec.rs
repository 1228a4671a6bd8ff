//! Revision payload codec (zstd)

use crate::error::{EngineError, Result};

/// zstd compression level used for every payload
pub const COMPRESSION_LEVEL: i32 = 3;

/// Compress raw content into a revision payload
pub fn compress(content: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(content, COMPRESSION_LEVEL)
        .map_err(|e| EngineError::CorruptPayload(format!("compression failed: {}", e)))
}

/// Decompress a revision payload back into raw content
///
/// Malformed or truncated payloads are never replaced by empty content.
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(payload)
        .map_err(|e| EngineError::CorruptPayload(format!("decompression failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_roundtrip() {
        let payload = compress(b"").unwrap();
        assert!(decompress(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_payload_is_corrupt() {
        let payload = compress(&b"alias ll='ls -la'\n".repeat(64)).unwrap();
        let truncated = &payload[..payload.len() / 2];
        assert!(matches!(decompress(truncated), Err(EngineError::CorruptPayload(_))));
    }

    #[test]
    fn test_garbage_payload_is_corrupt() {
        assert!(matches!(
            decompress(b"definitely not zstd"),
            Err(EngineError::CorruptPayload(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let payload = compress(&data).unwrap();
            prop_assert_eq!(decompress(&payload).unwrap(), data);
        }
    }
}
