//! Wire codec: MessagePack with named fields, then zstd.
//!
//! `decode(encode(v)) == v` for every [`crate::protocol::Request`] and
//! [`crate::protocol::Response`]. Named fields are required because
//! `Response` skips absent counters.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// zstd level used for every envelope.
pub const COMPRESSION_LEVEL: i32 = 3;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let packed =
        rmp_serde::to_vec_named(value).map_err(|e| CodecError::Serialization(e.to_string()))?;
    zstd::stream::encode_all(packed.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| CodecError::Compression(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let packed =
        zstd::stream::decode_all(bytes).map_err(|e| CodecError::Compression(e.to_string()))?;
    rmp_serde::from_slice(&packed).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorInfo, Request, Response};
    use crate::sqlite::{Params, Value};

    #[test]
    fn request_survives_the_wire() {
        let request = Request::new("rust@worker-1", "INSERT INTO t VALUES (?, ?, ?)")
            .with_params(Params::Batch(vec![
                vec![Value::Text("IBM".into()), Value::Real(45.0), Value::Null],
                vec![Value::Text("XOM".into()), Value::Integer(-7), Value::Blob(vec![0, 255])],
            ]))
            .execute_many(true);

        let decoded: Request = decode(&encode(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn response_keeps_absent_counters_absent() {
        let ok = Response::rows(vec![vec![Value::Integer(1), Value::Text("a".into())]])
            .with_lastrowid(Some(27));
        let decoded: Response = decode(&encode(&ok).unwrap()).unwrap();
        assert_eq!(decoded, ok);
        assert_eq!(decoded.rowcount, None);

        let failed = Response::failure(ErrorInfo::new("sqlite.OperationalError", "no such table: X"));
        let decoded: Response = decode(&encode(&failed).unwrap()).unwrap();
        assert_eq!(decoded, failed);
    }

    #[test]
    fn corrupt_stream_is_a_compression_error() {
        let err = decode::<Response>(b"definitely not zstd").unwrap_err();
        assert!(matches!(err, CodecError::Compression(_)));
    }

    #[test]
    fn valid_stream_with_wrong_shape_is_a_serialization_error() {
        let bytes = encode(&"just a string").unwrap();
        let err = decode::<Request>(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Serialization(_)));
    }
}
