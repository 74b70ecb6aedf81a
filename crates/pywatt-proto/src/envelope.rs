//! Envelope types for module messages.

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Payload size above which the binary form is preferred (4 KiB).
///
/// Only applies when both peers advertise binary support; JSON remains
/// decodable everywhere.
pub const BINARY_PREFERENCE_THRESHOLD: usize = 4 * 1024;

/// Encoding format for a message payload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EncodingFormat {
    /// Self-describing JSON. Mandatory for all peers.
    #[default]
    Json,
    /// Compact binary (CBOR). Optional, preferred for large payloads.
    Binary,
}

impl EncodingFormat {
    /// Returns the wire discriminant for this format.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Json => 1,
            Self::Binary => 2,
        }
    }

    /// Creates a format from its wire discriminant.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Json),
            2 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// Metadata carried alongside every message payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Unique id of this message, fresh per send.
    pub id: Uuid,

    /// Correlation id for request/response matching.
    ///
    /// Responses must echo the id of the request they answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// Creation instant, millisecond precision on the wire.
    pub created_at: DateTime<Utc>,

    /// Encoding of the payload bytes.
    pub content_type: EncodingFormat,
}

impl MessageMetadata {
    /// Creates metadata for a new message in the given format.
    #[must_use]
    pub fn new(content_type: EncodingFormat) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: None,
            created_at: Utc::now(),
            content_type,
        }
    }

    /// Creates response metadata echoing the request's id as correlation id.
    #[must_use]
    pub fn response_to(request: &Self, content_type: EncodingFormat) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id: Some(request.id),
            created_at: Utc::now(),
            content_type,
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Millisecond Unix timestamp of `created_at`, as written to the wire.
    #[must_use]
    pub fn created_at_millis(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    pub(crate) fn from_wire(
        id: Uuid,
        correlation_id: Option<Uuid>,
        created_at_ms: i64,
        content_type: EncodingFormat,
    ) -> Self {
        let created_at = Utc
            .timestamp_millis_opt(created_at_ms)
            .single()
            .unwrap_or_default();
        Self {
            id,
            correlation_id,
            created_at,
            content_type,
        }
    }
}

/// A typed message with metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    /// Envelope metadata.
    pub metadata: MessageMetadata,
    /// The message payload.
    pub payload: T,
}

impl<T> Message<T> {
    /// Creates a new JSON-format message with fresh metadata.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            metadata: MessageMetadata::new(EncodingFormat::Json),
            payload,
        }
    }

    /// Creates a message with explicit metadata.
    #[must_use]
    pub fn with_metadata(payload: T, metadata: MessageMetadata) -> Self {
        Self { metadata, payload }
    }

    /// Creates a message correlated to an earlier request id.
    #[must_use]
    pub fn correlated(payload: T, correlation_id: Uuid) -> Self {
        Self {
            metadata: MessageMetadata::new(EncodingFormat::Json).with_correlation(correlation_id),
            payload,
        }
    }
}

impl<T: Serialize> Message<T> {
    /// Serialises the payload into the requested format.
    ///
    /// The metadata's `content_type` is updated to record the format used.
    pub fn encode(&self, format: EncodingFormat) -> Result<EncodedMessage, ProtocolError> {
        let payload = serialise_payload(&self.payload, format)?;
        let mut metadata = self.metadata.clone();
        metadata.content_type = format;
        Ok(EncodedMessage {
            format,
            metadata,
            payload,
        })
    }

    /// Serialises the payload, choosing binary only when it pays off.
    ///
    /// Encodes JSON first; if the caller prefers binary and the JSON form
    /// exceeds [`BINARY_PREFERENCE_THRESHOLD`], re-encodes as CBOR.
    pub fn encode_preferred(
        &self,
        preferred: EncodingFormat,
    ) -> Result<EncodedMessage, ProtocolError> {
        let json = self.encode(EncodingFormat::Json)?;
        if preferred == EncodingFormat::Binary && json.payload.len() > BINARY_PREFERENCE_THRESHOLD {
            self.encode(EncodingFormat::Binary)
        } else {
            Ok(json)
        }
    }
}

/// An encoded message: payload bytes plus inline metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    format: EncodingFormat,
    metadata: MessageMetadata,
    payload: Vec<u8>,
}

impl EncodedMessage {
    /// Assembles an encoded message from its parts.
    ///
    /// The metadata's `content_type` must agree with `format`; decoding
    /// rejects a mismatch.
    #[must_use]
    pub fn from_parts(metadata: MessageMetadata, format: EncodingFormat, payload: Vec<u8>) -> Self {
        Self {
            format,
            metadata,
            payload,
        }
    }

    /// Returns the encoding format of the payload.
    #[must_use]
    pub const fn format(&self) -> EncodingFormat {
        self.format
    }

    /// Returns the envelope metadata.
    #[must_use]
    pub const fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    /// Returns the raw payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the message, returning the payload bytes.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Deserialises the payload into `T`.
    ///
    /// Fails with [`ProtocolError::Codec`] on malformed bytes or when the
    /// inline metadata disagrees with the declared format.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        if self.metadata.content_type != self.format {
            return Err(ProtocolError::Codec(format!(
                "metadata content type {:?} does not match frame format {:?}",
                self.metadata.content_type, self.format
            )));
        }
        match self.format {
            EncodingFormat::Json => serde_json::from_slice(&self.payload)
                .map_err(|e| ProtocolError::Codec(format!("JSON deserialisation failed: {e}"))),
            EncodingFormat::Binary => ciborium::from_reader(self.payload.as_slice())
                .map_err(|e| ProtocolError::Codec(format!("CBOR deserialisation failed: {e}"))),
        }
    }

    /// Re-encodes the payload into another format, keeping the metadata id.
    pub fn to_format(&self, format: EncodingFormat) -> Result<Self, ProtocolError> {
        if format == self.format {
            return Ok(self.clone());
        }
        let value: serde_json::Value = self.decode()?;
        let payload = serialise_payload(&value, format)?;
        let mut metadata = self.metadata.clone();
        metadata.content_type = format;
        Ok(Self {
            format,
            metadata,
            payload,
        })
    }
}

fn serialise_payload<T: Serialize>(
    payload: &T,
    format: EncodingFormat,
) -> Result<Vec<u8>, ProtocolError> {
    match format {
        EncodingFormat::Json => serde_json::to_vec(payload)
            .map_err(|e| ProtocolError::Codec(format!("JSON serialisation failed: {e}"))),
        EncodingFormat::Binary => {
            let mut buf = Vec::new();
            ciborium::into_writer(payload, &mut buf)
                .map_err(|e| ProtocolError::Codec(format!("CBOR serialisation failed: {e}")))?;
            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn sample() -> Sample {
        Sample {
            name: "greeter".to_owned(),
            count: 7,
        }
    }

    #[test]
    fn format_discriminant_roundtrip() {
        for format in [EncodingFormat::Json, EncodingFormat::Binary] {
            assert_eq!(EncodingFormat::from_u8(format.as_u8()), Some(format));
        }
        assert_eq!(EncodingFormat::from_u8(0), None);
        assert_eq!(EncodingFormat::from_u8(9), None);
    }

    #[test]
    fn json_roundtrip() {
        let message = Message::new(sample());
        let encoded = message.encode(EncodingFormat::Json).unwrap();
        assert_eq!(encoded.format(), EncodingFormat::Json);

        let decoded: Sample = encoded.decode().unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn binary_roundtrip() {
        let message = Message::new(sample());
        let encoded = message.encode(EncodingFormat::Binary).unwrap();
        assert_eq!(encoded.format(), EncodingFormat::Binary);
        assert_eq!(encoded.metadata().content_type, EncodingFormat::Binary);

        let decoded: Sample = encoded.decode().unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn decode_rejects_format_mismatch() {
        let message = Message::new(sample());
        let encoded = message.encode(EncodingFormat::Json).unwrap();
        let tampered = EncodedMessage::from_parts(
            encoded.metadata().clone(),
            EncodingFormat::Binary,
            encoded.payload().to_vec(),
        );

        let result: Result<Sample, _> = tampered.decode();
        assert!(matches!(result, Err(ProtocolError::Codec(_))));
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let metadata = MessageMetadata::new(EncodingFormat::Json);
        let encoded =
            EncodedMessage::from_parts(metadata, EncodingFormat::Json, b"not json".to_vec());

        let result: Result<Sample, _> = encoded.decode();
        assert!(matches!(result, Err(ProtocolError::Codec(_))));
    }

    #[test]
    fn response_metadata_echoes_request_id() {
        let request = MessageMetadata::new(EncodingFormat::Json);
        let response = MessageMetadata::response_to(&request, EncodingFormat::Json);

        assert_eq!(response.correlation_id, Some(request.id));
        assert_ne!(response.id, request.id);
    }

    #[test]
    fn preferred_encoding_keeps_small_payloads_json() {
        let message = Message::new(sample());
        let encoded = message.encode_preferred(EncodingFormat::Binary).unwrap();
        assert_eq!(encoded.format(), EncodingFormat::Json);
    }

    #[test]
    fn preferred_encoding_switches_large_payloads_to_binary() {
        let message = Message::new(Sample {
            name: "x".repeat(BINARY_PREFERENCE_THRESHOLD + 1),
            count: 0,
        });
        let encoded = message.encode_preferred(EncodingFormat::Binary).unwrap();
        assert_eq!(encoded.format(), EncodingFormat::Binary);
    }

    #[test]
    fn to_format_converts_between_encodings() {
        let message = Message::new(sample());
        let json = message.encode(EncodingFormat::Json).unwrap();
        let binary = json.to_format(EncodingFormat::Binary).unwrap();

        assert_eq!(binary.format(), EncodingFormat::Binary);
        assert_eq!(binary.metadata().id, json.metadata().id);

        let decoded: Sample = binary.decode().unwrap();
        assert_eq!(decoded, sample());
    }
}
