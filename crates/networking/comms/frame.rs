//! Wire frames.
//!
//! Every frame is a 4-byte big-endian length prefix followed by UTF-8 JSON.
//! Apart from the `hello` session preamble, the kinds pair up: `deliver`
//! carries a remote method call and `notify` resolves its result; `redeem`
//! presents an OCAP URL token and
//! `resolve` answers with the granted descriptor. The `token` names the
//! target capability at the receiving peer; slots inside [`WireCapData`] are
//! token strings, not krefs, because krefs are meaningless outside their own
//! kernel.

use crate::error::CommsError;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on an encoded frame, matching the codec's sanity check.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// CapData as it travels between kernels: same body encoding, but slots are
/// opaque capability tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCapData {
    pub body: String,
    pub slots: Vec<String>,
}

impl WireCapData {
    pub fn is_error(&self) -> bool {
        self.body.starts_with(kestrel_common::capdata::ERROR_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Frame {
    /// Session preamble, sent once by the connecting side before any other
    /// frame so the receiver can attribute inbound traffic to a peer.
    #[serde(rename = "hello")]
    Hello { peer: String },
    /// A method call on the capability named by `token`. `result`, when
    /// present, is the id the sender expects back in a `notify`.
    #[serde(rename = "deliver")]
    Deliver {
        token: String,
        method: String,
        args: WireCapData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    /// Resolution of an earlier `deliver`'s result.
    #[serde(rename = "notify")]
    Notify {
        result: String,
        rejected: bool,
        args: WireCapData,
    },
    /// Redemption request for an issued OCAP URL token.
    #[serde(rename = "redeem")]
    Redeem { token: String, result: String },
    /// Answer to a `redeem`: args carry the granted descriptor, or an error
    /// body when the token is unknown.
    #[serde(rename = "resolve")]
    Resolve {
        result: String,
        rejected: bool,
        args: WireCapData,
    },
}

#[derive(Debug, Default)]
pub struct FrameCodec;

fn encode_json<T: Serialize>(value: &T, dst: &mut BytesMut) -> Result<(), CommsError> {
    let payload =
        serde_json::to_vec(value).map_err(|err| CommsError::MalformedFrame(err.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CommsError::FrameTooLarge(payload.len(), MAX_FRAME_SIZE));
    }
    dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(&payload);
    Ok(())
}

fn decode_json<T: for<'de> Deserialize<'de>>(
    src: &mut BytesMut,
) -> Result<Option<T>, CommsError> {
    if src.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let mut length_bytes = [0u8; LENGTH_PREFIX_SIZE];
    length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(CommsError::FrameTooLarge(length, MAX_FRAME_SIZE));
    }
    if src.len() < LENGTH_PREFIX_SIZE + length {
        src.reserve(LENGTH_PREFIX_SIZE + length - src.len());
        return Ok(None);
    }
    src.advance(LENGTH_PREFIX_SIZE);
    let payload = src.split_to(length);
    let value = serde_json::from_slice(&payload)
        .map_err(|err| CommsError::MalformedFrame(err.to_string()))?;
    Ok(Some(value))
}

impl Encoder<Frame> for FrameCodec {
    type Error = CommsError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CommsError> {
        encode_json(&frame, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CommsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CommsError> {
        decode_json(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode");
        codec
            .decode(&mut buf)
            .expect("decode")
            .expect("complete frame")
    }

    #[test]
    fn frames_round_trip() {
        let deliver = Frame::Deliver {
            token: "aabbcc".to_string(),
            method: "hello".to_string(),
            args: WireCapData {
                body: "#[\"world\"]".to_string(),
                slots: vec![],
            },
            result: Some("r1".to_string()),
        };
        assert_eq!(round_trip(deliver.clone()), deliver);

        let resolve = Frame::Resolve {
            result: "r1".to_string(),
            rejected: false,
            args: WireCapData {
                body: "#{\"token\":\"aabbcc\"}".to_string(),
                slots: vec!["aabbcc".to_string()],
            },
        };
        assert_eq!(round_trip(resolve.clone()), resolve);
    }

    #[test]
    fn kind_tags_are_stable() {
        let redeem = Frame::Redeem {
            token: "t".to_string(),
            result: "r".to_string(),
        };
        let json = serde_json::to_value(&redeem).expect("serialize");
        assert_eq!(json["kind"], "redeem");
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Redeem {
                    token: "t".to_string(),
                    result: "r".to_string(),
                },
                &mut buf,
            )
            .expect("encode");
        let mut partial = buf.split_to(buf.len() - 2);
        assert!(codec.decode(&mut partial).expect("decode").is_none());
        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).expect("decode").is_some());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CommsError::FrameTooLarge(_, _))
        ));
    }
}
