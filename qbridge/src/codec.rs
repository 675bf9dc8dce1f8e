//! Framed codec for the controller telemetry stream.
//!
//! Length-prefixed JSON frames: LengthDelimitedCodec for framing plus
//! serde_json for the payload. Works over any AsyncRead/AsyncWrite.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame. A telemetry snapshot is a few hundred
/// bytes of JSON; a length prefix past this marks a corrupt or
/// desynchronized stream, and the connection is torn down rather than
/// buffered against.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Frames messages with a 4-byte length prefix and serializes with JSON.
pub struct JsonFrameCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonFrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonFrameCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonFrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonFrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Domain, Telemetry};

    fn sample() -> Telemetry {
        Telemetry {
            t_unix_ms: 1_724_680_000_000,
            qber_pct: 1.8,
            sifted_rate_cps: 40_000.0,
            secure_rate_bps: 9_000.0,
            jitter_ps: 35.0,
            atm_loss_db_per_km: 3.0,
            dark_cps: 110.0,
            det_eff: 0.8,
            temperature_c: 20.0,
            site: "roof-east".to_string(),
            active_domain: Domain::Fso,
            scintillation_idx: 0.1,
        }
    }

    #[test]
    fn encode_then_decode_recovers_the_frame() {
        let mut codec = JsonFrameCodec::<Telemetry>::new();
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn partial_frame_yields_none() {
        let mut codec = JsonFrameCodec::<Telemetry>::new();
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let mut codec = JsonFrameCodec::<Telemetry>::new();
        let mut framer = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        framer
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut codec = JsonFrameCodec::<Telemetry>::new();
        let mut buf = BytesMut::new();
        // A prefix claiming a frame far past any telemetry snapshot.
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 32]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = JsonFrameCodec::<Telemetry>::new();
        let mut buf = BytesMut::new();
        let mut first = sample();
        first.qber_pct = 1.0;
        let mut second = sample();
        second.qber_pct = 2.0;
        codec.encode(first, &mut buf).unwrap();
        codec.encode(second, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().qber_pct, 1.0);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().qber_pct, 2.0);
    }
}
