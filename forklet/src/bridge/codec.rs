//! Framed codec for the result pipe.
//!
//! A frame is a 4-byte big-endian length followed by one JSON document. The
//! child encodes exactly one frame; the parent decodes it after the pipe
//! reaches EOF.
//!
//! serde_json writes some values it cannot read back (non-finite floats become
//! `null`), so the child encodes through [`JsonCodec::encode_verified`] and
//! treats a frame that does not decode as unencodable.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Length-prefixed JSON frames for one outcome type.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(u32::MAX as usize)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> JsonCodec<T> {
    /// Decode a buffer that must hold exactly one complete frame.
    pub fn decode_exact(&mut self, bytes: &[u8]) -> io::Result<T> {
        let mut src = BytesMut::from(bytes);
        let item = self.decode(&mut src)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated frame ({} bytes)", bytes.len()),
            )
        })?;
        if !src.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} trailing bytes after frame", src.len()),
            ));
        }
        Ok(item)
    }
}

impl<T: Serialize + DeserializeOwned> JsonCodec<T> {
    /// Encode `item` only if the resulting document decodes back as `T`.
    ///
    /// Never logs; this runs inside forked children. `item` is dropped before
    /// returning, so a panicking `Drop` unwinds out of here too.
    pub fn encode_verified(&mut self, item: T, dst: &mut BytesMut) -> io::Result<()> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        drop(item);
        serde_json::from_slice::<T>(&json).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("encoded frame does not decode: {}", e),
            )
        })?;
        self.inner.encode(Bytes::from(json), dst)
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                tracing::trace!(frame_bytes = bytes.len(), "Decoding result frame");
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Runs inside forked children: no tracing here, the subscriber's locks
        // may have been held by another parent thread at fork time.
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ErrorValue, Outcome, RESULT_UNENCODABLE};
    use serde::Serializer;
    use serde::ser::Error as _;
    use std::collections::BTreeMap;

    struct LiveHandle;

    impl Serialize for LiveHandle {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("live handles cannot be serialized"))
        }
    }

    #[test]
    fn codec_roundtrip_success() {
        let mut codec = JsonCodec::<Outcome<BTreeMap<String, Vec<i64>>>>::new();
        let mut buf = BytesMut::new();

        let mut value = BTreeMap::new();
        value.insert("primes".to_string(), vec![2, 3, 5, 7]);
        codec.encode(Outcome::success(value.clone()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, Outcome::success(value));
    }

    #[test]
    fn codec_roundtrip_failure() {
        let mut codec = JsonCodec::<Outcome<String>>::new();
        let mut buf = BytesMut::new();

        let raised = ErrorValue::new("app::Oops", "oops");
        codec.encode(Outcome::failure(raised.clone()), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, Outcome::failure(raised));
    }

    #[test]
    fn failed_encode_leaves_buffer_untouched() {
        let mut codec = JsonCodec::<Outcome<LiveHandle>>::new();
        let mut buf = BytesMut::new();

        let err = codec.encode(Outcome::success(LiveHandle), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(buf.is_empty());

        codec
            .encode(Outcome::unencodable(RESULT_UNENCODABLE, "LiveHandle"), &mut buf)
            .unwrap();
        assert!(!buf.is_empty());
    }

    #[test]
    fn verified_encode_rejects_non_finite_floats() {
        let mut codec = JsonCodec::<Outcome<f64>>::new();
        let mut buf = BytesMut::new();

        let err = codec
            .encode_verified(Outcome::success(f64::NAN), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(buf.is_empty());

        codec.encode_verified(Outcome::success(0.25), &mut buf).unwrap();
        assert_eq!(codec.decode_exact(&buf).unwrap(), Outcome::success(0.25));
    }

    #[test]
    fn frame_has_big_endian_length_prefix() {
        let mut codec = JsonCodec::<u32>::new();
        let mut buf = BytesMut::new();
        codec.encode(12345, &mut buf).unwrap();

        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..], b"12345");
    }

    #[test]
    fn decode_exact_rejects_truncated_frame() {
        let mut codec = JsonCodec::<u32>::new();
        let mut buf = BytesMut::new();
        codec.encode(12345, &mut buf).unwrap();

        let err = codec.decode_exact(&buf[..6]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn decode_exact_rejects_trailing_bytes() {
        let mut codec = JsonCodec::<u32>::new();
        let mut buf = BytesMut::new();
        codec.encode(1, &mut buf).unwrap();
        buf.extend_from_slice(b"junk");

        let err = codec.decode_exact(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_exact_rejects_invalid_json() {
        let mut codec = JsonCodec::<Outcome<u32>>::new();
        let mut frame = vec![0, 0, 0, 3];
        frame.extend_from_slice(b"{x}");

        let err = codec.decode_exact(&frame).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
