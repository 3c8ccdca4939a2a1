//! Wire mapping between transport records and bus messages.
//!
//! Identifiers travel as 16 raw bytes. Inbound identifiers are also accepted in
//! their canonical text form, and an all-zero identifier means "absent".

use common_kafka::{InboundRecord, OutboundRecord, RecordHeader};
use uuid::Uuid;

use crate::context::IdGenerator;
use crate::error::DecodeError;

pub const TYPE_HEADER: &str = "Type";
pub const MESSAGE_ID_HEADER: &str = "Message-ID";
pub const IN_REPLY_TO_HEADER: &str = "In-Reply-To";
pub const PROGRAM_HEADER: &str = "Some-about-program";
pub const TO_HEADER: &str = "To";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_type: String,
    pub message_id: Uuid,
    pub in_reply_to: Option<Uuid>,
    pub program_tag: Option<String>,
    pub to: Option<String>,
    pub payload: Vec<u8>,
    /// Tracks the message through the adapter, never written to the wire.
    pub correlation_id: String,
}

impl InboundMessage {
    pub fn decode(record: &InboundRecord, ids: &IdGenerator) -> Result<Self, DecodeError> {
        let message_type = match record.header(TYPE_HEADER) {
            Some(value) if !value.is_empty() => utf8(TYPE_HEADER, value)?,
            _ => return Err(DecodeError::MissingHeader(TYPE_HEADER)),
        };

        let message_id = match record.header(MESSAGE_ID_HEADER) {
            Some(value) => parse_id(MESSAGE_ID_HEADER, value)?,
            None => None,
        }
        .unwrap_or_else(|| ids.new_id());

        let in_reply_to = match record.header(IN_REPLY_TO_HEADER) {
            Some(value) => parse_id(IN_REPLY_TO_HEADER, value)?,
            None => None,
        };

        let program_tag = record
            .header(PROGRAM_HEADER)
            .map(|value| utf8(PROGRAM_HEADER, value))
            .transpose()?;
        let to = record
            .header(TO_HEADER)
            .map(|value| utf8(TO_HEADER, value))
            .transpose()?;

        Ok(Self {
            message_type,
            message_id,
            in_reply_to,
            program_tag,
            to,
            payload: record.payload.clone(),
            correlation_id: message_id.to_string(),
        })
    }
}

fn utf8(header: &'static str, value: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidUtf8(header))
}

fn parse_id(header: &'static str, value: &[u8]) -> Result<Option<Uuid>, DecodeError> {
    if value.is_empty() {
        return Ok(None);
    }

    let id = if value.len() == 16 {
        Uuid::from_slice(value)
    } else {
        let text = std::str::from_utf8(value).map_err(|_| DecodeError::InvalidUtf8(header))?;
        Uuid::parse_str(text.trim())
    }
    .map_err(|e| DecodeError::InvalidUuid {
        header,
        reason: e.to_string(),
    })?;

    Ok((!id.is_nil()).then_some(id))
}

/// A message the adapter publishes. The identifier and routing headers are
/// filled in at send time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message_type: String,
    pub in_reply_to: Option<Uuid>,
    pub payload: Vec<u8>,
    pub correlation_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            ..Default::default()
        }
    }

    pub fn in_reply_to(mut self, id: Uuid) -> Self {
        self.in_reply_to = Some(id);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn into_record(self, message_id: Uuid, topic: &str, program_tag: &str) -> OutboundRecord {
        let mut headers = Vec::with_capacity(5);
        headers.push(RecordHeader::new(MESSAGE_ID_HEADER, message_id.as_bytes().to_vec()));
        headers.push(RecordHeader::new(TO_HEADER, topic));
        if let Some(in_reply_to) = self.in_reply_to {
            headers.push(RecordHeader::new(
                IN_REPLY_TO_HEADER,
                in_reply_to.as_bytes().to_vec(),
            ));
        }
        headers.push(RecordHeader::new(TYPE_HEADER, self.message_type));
        headers.push(RecordHeader::new(PROGRAM_HEADER, program_tag));

        OutboundRecord {
            topic: topic.to_owned(),
            headers,
            payload: self.payload,
        }
    }
}
