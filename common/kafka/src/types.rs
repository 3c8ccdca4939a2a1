use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// Ownership change reported by the consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceNotification {
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
}

impl RebalanceNotification {
    /// Distinct topics with at least one partition in this notification.
    pub fn topics(&self) -> Vec<&str> {
        let partitions = match self {
            RebalanceNotification::Assigned(partitions) => partitions,
            RebalanceNotification::Revoked(partitions) => partitions,
        };
        let mut topics: Vec<&str> = partitions.iter().map(Partition::topic).collect();
        topics.sort_unstable();
        topics.dedup();
        topics
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Brokers unreachable, resolution failures and network timeouts.
    Connectivity,
    Other,
}

/// Asynchronous failure surfaced by a client outside of a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailure {
    pub kind: FailureKind,
    pub message: String,
}

const CONNECTIVITY_PHRASES: [&str; 6] = [
    "broker unreachable",
    "client has run out of available brokers",
    "is your cluster reachable",
    "i/o timeout",
    "no brokers available",
    "brokers are down",
];

impl TransportFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_kafka(error: &KafkaError, reason: &str) -> Self {
        let message = format!("{error}: {reason}");
        let by_code = matches!(
            error.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::AllBrokersDown
                    | RDKafkaErrorCode::BrokerTransportFailure
                    | RDKafkaErrorCode::Resolve
                    | RDKafkaErrorCode::OperationTimedOut
                    | RDKafkaErrorCode::NetworkException
            )
        );
        let kind = if by_code || Self::mentions_connectivity(&message) {
            FailureKind::Connectivity
        } else {
            FailureKind::Other
        };
        Self { kind, message }
    }

    /// Classifies free-form error text by its wording alone.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if Self::mentions_connectivity(&message) {
            FailureKind::Connectivity
        } else {
            FailureKind::Other
        };
        Self { kind, message }
    }

    /// Matches the wording brokers and clients use when the cluster cannot be reached.
    pub fn mentions_connectivity(message: &str) -> bool {
        let lowered = message.to_lowercase();
        CONNECTIVITY_PHRASES
            .iter()
            .any(|phrase| lowered.contains(phrase))
    }

    pub fn is_connectivity(&self) -> bool {
        self.kind == FailureKind::Connectivity
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Broker outcome of one produced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered { topic: String },
    Failed { topic: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl RecordHeader {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// A record read from a topic, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub headers: Vec<RecordHeader>,
    pub payload: Vec<u8>,
}

impl InboundRecord {
    pub fn from_message<M: Message>(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| RecordHeader {
                        key: header.key.to_owned(),
                        value: header.value.map(<[u8]>::to_vec),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            headers,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }

    /// First header with the given key, if it carries a value.
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|header| header.key == key)
            .and_then(|header| header.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub headers: Vec<RecordHeader>,
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|header| header.key == key)
            .and_then(|header| header.value.as_deref())
    }

    pub fn owned_headers(&self) -> OwnedHeaders {
        self.headers.iter().fold(
            OwnedHeaders::new_with_capacity(self.headers.len()),
            |headers, header| {
                headers.insert(Header {
                    key: header.key.as_str(),
                    value: header.value.as_deref(),
                })
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::OwnedMessage;
    use rdkafka::Timestamp;

    #[test]
    fn test_inbound_record_copies_headers_and_payload() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "Type",
                value: Some("ping".as_bytes()),
            })
            .insert(Header::<&[u8]> {
                key: "Empty",
                value: None,
            });
        let message = OwnedMessage::new(
            Some(b"body".to_vec()),
            None,
            "listen-topic".to_string(),
            Timestamp::NotAvailable,
            3,
            42,
            Some(headers),
        );

        let record = InboundRecord::from_message(&message);

        assert_eq!(record.topic, "listen-topic");
        assert_eq!(record.partition, 3);
        assert_eq!(record.offset, 42);
        assert_eq!(record.payload, b"body");
        assert_eq!(record.header("Type"), Some("ping".as_bytes()));
        assert_eq!(record.header("Empty"), None);
        assert_eq!(record.header("Missing"), None);
    }

    #[test]
    fn test_outbound_headers_keep_order() {
        let record = OutboundRecord {
            topic: "send-topic".to_string(),
            headers: vec![RecordHeader::new("A", "1"), RecordHeader::new("B", "2")],
            payload: vec![],
        };

        let headers = record.owned_headers();
        assert_eq!(headers.count(), 2);
        assert_eq!(headers.get(0).key, "A");
        assert_eq!(headers.get(1).value, Some("2".as_bytes()));
    }

    #[test]
    fn test_failure_classification() {
        let failure = TransportFailure::from_kafka(
            &KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
            "1/1 brokers are down",
        );
        assert!(failure.is_connectivity());

        let failure = TransportFailure::from_kafka(
            &KafkaError::Global(RDKafkaErrorCode::InvalidMessage),
            "corrupt batch",
        );
        assert_eq!(failure.kind, FailureKind::Other);

        assert!(TransportFailure::mentions_connectivity(
            "kafka: client has run out of available brokers to talk to"
        ));
        assert!(TransportFailure::mentions_connectivity(
            "dial tcp: i/o timeout"
        ));
        assert!(TransportFailure::from_message("kafka: broker unreachable").is_connectivity());
        assert!(TransportFailure::from_message("No Brokers Available").is_connectivity());
        assert!(!TransportFailure::mentions_connectivity("unknown topic"));
        assert!(TransportFailure::from_message("Is your cluster reachable?").is_connectivity());
    }

    #[test]
    fn test_notification_topics() {
        let notification = RebalanceNotification::Assigned(vec![
            Partition::new("b", 0),
            Partition::new("a", 1),
            Partition::new("b", 1),
        ]);
        assert_eq!(notification.topics(), vec!["a", "b"]);
    }
}
