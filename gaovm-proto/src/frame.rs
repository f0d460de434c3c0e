//! Length-prefixed JSON framing.
//!
//! Every frame on a control socket is a 4-byte big-endian unsigned length
//! `N` followed by exactly `N` bytes of UTF-8 JSON encoding one top-level
//! object. `N` must be greater than zero; batch arrays are not part of the
//! protocol and fail the stream.

use serde_json::Value;

use crate::error::ProtoError;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Upper bound on a single frame payload. A peer announcing more than this
/// is treated as a framing violation rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode one message as a length-prefixed frame.
///
/// # Errors
/// Returns [`ProtoError::Framing`] if `message` is not a JSON object or
/// serializes to more than [`MAX_FRAME_LEN`] bytes.
pub fn encode_frame(message: &Value) -> Result<Vec<u8>, ProtoError> {
    if !message.is_object() {
        return Err(ProtoError::Framing(
            "outbound frame must be a single JSON object".to_owned(),
        ));
    }
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtoError::Framing(format!(
            "frame payload of {} bytes exceeds the {MAX_FRAME_LEN}-byte limit",
            payload.len()
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// Feed raw bytes with [`push`](Self::push) in whatever chunks the socket
/// delivers them; [`next_frame`](Self::next_frame) yields complete decoded
/// objects. Any framing violation is terminal: the caller must close the
/// stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    /// Returns [`ProtoError::Framing`] on a zero-length frame, an oversized
    /// frame, a payload that is not valid JSON, or a top-level value that is
    /// not an object (batch arrays included).
    pub fn next_frame(&mut self) -> Result<Option<Value>, ProtoError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Err(ProtoError::Framing("zero-length frame".to_owned()));
        }
        if len > MAX_FRAME_LEN {
            return Err(ProtoError::Framing(format!(
                "announced frame length {len} exceeds the {MAX_FRAME_LEN}-byte limit"
            )));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);

        let value: Value = serde_json::from_slice(&payload)
            .map_err(|e| ProtoError::Framing(format!("invalid JSON payload: {e}")))?;
        match value {
            Value::Object(_) => Ok(Some(value)),
            Value::Array(_) => Err(ProtoError::Framing(
                "batch arrays are not supported".to_owned(),
            )),
            other => Err(ProtoError::Framing(format!(
                "top-level value must be an object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Number of buffered, not-yet-consumed bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Vec<Value>, ProtoError> {
        let mut decoder = FrameDecoder::new();
        decoder.push(bytes);
        let mut out = Vec::new();
        while let Some(value) = decoder.next_frame()? {
            out.push(value);
        }
        Ok(out)
    }

    #[test]
    fn roundtrip_single_object() {
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let frame = encode_frame(&msg).expect("encode failed");
        let decoded = decode_all(&frame).expect("decode failed");
        assert_eq!(decoded, vec![msg], "decoded object must equal the input");
    }

    #[test]
    fn two_frames_in_one_read() {
        let a = json!({"id": 1});
        let b = json!({"id": 2});
        let mut bytes = encode_frame(&a).expect("encode a");
        bytes.extend(encode_frame(&b).expect("encode b"));
        let decoded = decode_all(&bytes).expect("decode failed");
        assert_eq!(decoded, vec![a, b], "both frames must decode in order");
    }

    #[test]
    fn partial_header_then_rest() {
        let msg = json!({"k": "v"});
        let frame = encode_frame(&msg).expect("encode failed");
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame[..2]);
        assert!(
            decoder.next_frame().expect("no error on partial").is_none(),
            "partial header must not yield a frame"
        );
        decoder.push(&frame[2..]);
        let decoded = decoder.next_frame().expect("decode failed");
        assert_eq!(decoded, Some(msg));
    }

    #[test]
    fn zero_length_frame_is_framing_error() {
        let bytes = 0u32.to_be_bytes();
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let err = decoder.next_frame().expect_err("zero length must fail");
        assert!(matches!(err, ProtoError::Framing(_)), "expected framing error, got {err}");
    }

    #[test]
    fn batch_array_is_framing_error() {
        let payload = b"[{\"id\":1}]";
        #[allow(clippy::cast_possible_truncation)]
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);
        let err = decode_all(&bytes).expect_err("array must fail");
        assert!(err.to_string().contains("batch"), "error must name batch rejection: {err}");
    }

    #[test]
    fn scalar_top_level_is_framing_error() {
        let payload = b"42";
        #[allow(clippy::cast_possible_truncation)]
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);
        let err = decode_all(&bytes).expect_err("scalar must fail");
        assert!(matches!(err, ProtoError::Framing(_)), "expected framing error, got {err}");
    }

    #[test]
    fn oversized_announced_length_is_framing_error() {
        #[allow(clippy::cast_possible_truncation)]
        let bytes = ((MAX_FRAME_LEN as u32) + 1).to_be_bytes();
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let err = decoder.next_frame().expect_err("oversized must fail");
        assert!(matches!(err, ProtoError::Framing(_)), "expected framing error, got {err}");
    }

    #[test]
    fn encode_rejects_non_object() {
        let err = encode_frame(&json!([1, 2])).expect_err("array must be rejected");
        assert!(matches!(err, ProtoError::Framing(_)), "expected framing error, got {err}");
    }

    proptest::proptest! {
        /// Decoding is invariant under how the byte stream is partitioned.
        #[test]
        fn proptest_partition_invariance(
            ids in proptest::collection::vec(0i64..1000, 1..8),
            cut in proptest::collection::vec(1usize..16, 0..32),
        ) {
            let frames: Vec<Value> = ids
                .iter()
                .map(|id| json!({"jsonrpc": "2.0", "id": id, "method": "ping"}))
                .collect();
            let mut bytes = Vec::new();
            for f in &frames {
                bytes.extend(encode_frame(f).expect("encode failed"));
            }

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            let mut offset = 0;
            let mut cuts = cut.into_iter();
            while offset < bytes.len() {
                let step = cuts.next().unwrap_or(bytes.len()).min(bytes.len() - offset);
                decoder.push(&bytes[offset..offset + step]);
                offset += step;
                while let Some(v) = decoder.next_frame().expect("decode failed") {
                    decoded.push(v);
                }
            }
            proptest::prop_assert_eq!(decoded, frames);
        }
    }
}
