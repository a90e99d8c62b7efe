use serde::{Deserialize, Serialize};

use crate::utils::{LanError, Result};

/// Upper bound for a single framed message. A 1 MiB chunk grows by ~4/3
/// under base64 plus envelope overhead, so 8 MiB leaves ample headroom.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// One protocol message: a transfer id plus a type-tagged body. Every TCP
/// write carries exactly one envelope, length-prefix framed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub transfer_id: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum MessageBody {
    #[serde(rename_all = "camelCase")]
    TransferRequest {
        sender_id: String,
        sender_name: String,
        file_name: String,
        file_size: u64,
        file_hash: String,
    },
    #[serde(rename_all = "camelCase")]
    TransferResponse {
        accepted: bool,
        receiver_id: String,
        receiver_name: String,
        file_path: String,
    },
    #[serde(rename_all = "camelCase")]
    FileData {
        chunk_index: u32,
        total_chunks: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    TransferComplete { success: bool, file_hash: String },
    #[serde(rename_all = "camelCase")]
    TransferCancel { reason: String },
}

impl Envelope {
    pub fn new(transfer_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            body,
        }
    }
}

/// Serialize an envelope to its JSON wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse one envelope from a complete payload. Unknown types and missing
/// fields surface as `LanError::Parse`.
pub fn decode(payload: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(payload).map_err(|e| LanError::Parse(e.to_string()))
}

/// Frame an envelope for TCP: 4-byte big-endian payload length, then the
/// JSON payload.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = encode(envelope)?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental length-prefix decoder. The socket layer delivers whatever
/// a read returned; this accumulates bytes and yields complete envelopes,
/// however the stream was segmented.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Envelope>> {
        self.buffer.extend_from_slice(bytes);

        let mut envelopes = Vec::new();
        loop {
            if self.buffer.len() < 4 {
                break;
            }

            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if len > MAX_FRAME_SIZE {
                return Err(LanError::MessageTooLarge(len));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            let envelope = decode(&self.buffer[4..4 + len])?;
            self.buffer.drain(..4 + len);
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: Envelope) {
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn request_roundtrip() {
        roundtrip(Envelope::new(
            "t-1",
            MessageBody::TransferRequest {
                sender_id: "abc".to_string(),
                sender_name: "Alice".to_string(),
                file_name: "report.pdf".to_string(),
                file_size: 123_456,
                file_hash: "deadbeef".to_string(),
            },
        ));
    }

    #[test]
    fn response_roundtrip() {
        roundtrip(Envelope::new(
            "t-1",
            MessageBody::TransferResponse {
                accepted: true,
                receiver_id: "def".to_string(),
                receiver_name: "Bob".to_string(),
                file_path: "/downloads/report.pdf".to_string(),
            },
        ));
    }

    #[test]
    fn file_data_preserves_binary_exactly() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let envelope = Envelope::new(
            "t-1",
            MessageBody::FileData {
                chunk_index: 7,
                total_chunks: 12,
                data: data.clone(),
            },
        );

        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        match decoded.body {
            MessageBody::FileData { data: got, .. } => assert_eq!(got, data),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn empty_data_roundtrip() {
        roundtrip(Envelope::new(
            "t-1",
            MessageBody::FileData {
                chunk_index: 0,
                total_chunks: 1,
                data: Vec::new(),
            },
        ));
    }

    #[test]
    fn complete_and_cancel_roundtrip() {
        roundtrip(Envelope::new(
            "t-2",
            MessageBody::TransferComplete {
                success: true,
                file_hash: "00ff".to_string(),
            },
        ));
        roundtrip(Envelope::new(
            "t-2",
            MessageBody::TransferCancel {
                reason: "Canceled by user".to_string(),
            },
        ));
    }

    #[test]
    fn unknown_type_is_parse_error() {
        let raw = br#"{"transferId":"t","type":"Bogus"}"#;
        assert!(matches!(decode(raw), Err(LanError::Parse(_))));
    }

    #[test]
    fn missing_field_is_parse_error() {
        let raw = br#"{"transferId":"t","type":"TransferCancel"}"#;
        assert!(matches!(decode(raw), Err(LanError::Parse(_))));
    }

    #[test]
    fn decoder_handles_byte_at_a_time_delivery() {
        let envelope = Envelope::new(
            "t-3",
            MessageBody::TransferCancel {
                reason: "slow stream".to_string(),
            },
        );
        let frame = encode_frame(&envelope).unwrap();

        let mut decoder = FrameDecoder::new();
        for byte in &frame[..frame.len() - 1] {
            assert!(decoder.push(std::slice::from_ref(byte)).unwrap().is_empty());
        }
        let out = decoder.push(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(out, vec![envelope]);
    }

    #[test]
    fn decoder_handles_coalesced_frames() {
        let first = Envelope::new(
            "a",
            MessageBody::TransferComplete {
                success: true,
                file_hash: String::new(),
            },
        );
        let second = Envelope::new(
            "b",
            MessageBody::TransferCancel {
                reason: "x".to_string(),
            },
        );

        let mut combined = encode_frame(&first).unwrap();
        combined.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        let out = decoder.push(&combined).unwrap();
        assert_eq!(out, vec![first, second]);
    }

    #[test]
    fn decoder_rejects_oversize_frame() {
        let mut decoder = FrameDecoder::new();
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        assert!(matches!(
            decoder.push(&header),
            Err(LanError::MessageTooLarge(_))
        ));
    }
}
