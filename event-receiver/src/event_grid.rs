use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::EnvelopeError;

pub const BLOB_CREATED_EVENT_TYPE: &str = "Microsoft.Storage.BlobCreated";
pub const BLOB_DELETED_EVENT_TYPE: &str = "Microsoft.Storage.BlobDeleted";

/// A message body as published by Event Grid: usually a JSON array of events,
/// sometimes a single event object.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawEnvelope {
    Batch(Vec<Value>),
    Single(Map<String, Value>),
}

/// The records of one notification envelope. Records are kept undecoded so that
/// one malformed record doesn't prevent reading its siblings.
#[derive(Debug, Clone)]
pub struct Envelope {
    records: Vec<Value>,
}

impl Envelope {
    pub fn from_slice(body: &[u8]) -> Result<Self, EnvelopeError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(EnvelopeError::Empty);
        }

        let records = match serde_json::from_slice(body)? {
            RawEnvelope::Batch(records) => records,
            RawEnvelope::Single(record) => vec![Value::Object(record)],
        };

        Ok(Envelope { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Decode each record in order, yielding an error for records that don't match
    /// the event schema.
    pub fn events(&self) -> impl Iterator<Item = Result<EventGridEvent, serde_json::Error>> + '_ {
        self.records.iter().map(EventGridEvent::deserialize)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGridEvent {
    pub id: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub subject: String,
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub data_version: Option<String>,
    #[serde(default)]
    pub metadata_version: Option<String>,
}

impl EventGridEvent {
    /// Decode `data` according to `eventType`. System event types match regardless
    /// of case.
    pub fn payload(&self) -> Result<EventData, serde_json::Error> {
        let event_type = self.event_type.as_str();
        if event_type.eq_ignore_ascii_case(BLOB_CREATED_EVENT_TYPE) {
            Ok(EventData::BlobCreated(
                StorageBlobCreatedEventData::deserialize(&self.data)?,
            ))
        } else if event_type.eq_ignore_ascii_case(BLOB_DELETED_EVENT_TYPE) {
            Ok(EventData::BlobDeleted(
                StorageBlobDeletedEventData::deserialize(&self.data)?,
            ))
        } else {
            Ok(EventData::Other(event_type.to_owned()))
        }
    }

    /// Time elapsed between the declared event time and `now`. Negative when the
    /// publisher's clock is ahead of ours.
    pub fn latency(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.event_time)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    BlobCreated(StorageBlobCreatedEventData),
    BlobDeleted(StorageBlobDeletedEventData),
    /// Any event type we don't act upon.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBlobCreatedEventData {
    pub url: String,
    #[serde(default)]
    pub api: Option<String>,
    #[serde(default)]
    pub client_request_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default, rename = "eTag")]
    pub e_tag: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_length: Option<i64>,
    #[serde(default)]
    pub blob_type: Option<String>,
    #[serde(default)]
    pub sequencer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBlobDeletedEventData {
    pub url: String,
    #[serde(default)]
    pub api: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub blob_type: Option<String>,
    #[serde(default)]
    pub sequencer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn blob_created(id: &str) -> Value {
        json!({
            "topic": "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/acct",
            "subject": "/blobServices/default/containers/uploads/blobs/report.csv",
            "eventType": "Microsoft.Storage.BlobCreated",
            "eventTime": "2024-03-01T10:00:00.1234567Z",
            "id": id,
            "data": {
                "api": "PutBlob",
                "clientRequestId": "6d79dbfb-0e37-4fc4-981f-442c9ca65760",
                "requestId": "831e1650-001e-001b-66ab-eeb76e000000",
                "eTag": "0x8D4BCC2E4835CD0",
                "contentType": "text/csv",
                "contentLength": 524288,
                "blobType": "BlockBlob",
                "url": "https://acct.blob.core.windows.net/uploads/report.csv",
                "sequencer": "00000000000004420000000000028963",
                "storageDiagnostics": { "batchId": "b68529f3-68cd-4744-baa4-3c0498ec19f0" }
            },
            "dataVersion": "",
            "metadataVersion": "1"
        })
    }

    #[test]
    fn decodes_blob_created_batch() {
        let body = serde_json::to_vec(&json!([blob_created("one")])).unwrap();
        let envelope = Envelope::from_slice(&body).unwrap();
        assert_eq!(envelope.len(), 1);

        let event = envelope.events().next().unwrap().unwrap();
        assert_eq!(event.id, "one");
        assert_eq!(event.metadata_version.as_deref(), Some("1"));

        match event.payload().unwrap() {
            EventData::BlobCreated(data) => {
                assert_eq!(
                    data.url,
                    "https://acct.blob.core.windows.net/uploads/report.csv"
                );
                assert_eq!(data.e_tag.as_deref(), Some("0x8D4BCC2E4835CD0"));
                assert_eq!(data.content_length, Some(524288));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn accepts_single_event_object() {
        let body = serde_json::to_vec(&blob_created("solo")).unwrap();
        let envelope = Envelope::from_slice(&body).unwrap();

        assert_eq!(envelope.len(), 1);
        assert_eq!(envelope.events().next().unwrap().unwrap().id, "solo");
    }

    #[test]
    fn keeps_sibling_records_when_one_is_malformed() {
        let body = serde_json::to_vec(&json!([
            {"id": "broken"},
            blob_created("fine"),
            42
        ]))
        .unwrap();
        let envelope = Envelope::from_slice(&body).unwrap();

        let results: Vec<_> = envelope.events().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().id, "fine");
        assert!(results[2].is_err());
    }

    #[test]
    fn unknown_event_types_are_other() {
        let event: EventGridEvent = serde_json::from_value(json!({
            "id": "validation",
            "eventType": "Microsoft.EventGrid.SubscriptionValidationEvent",
            "eventTime": "2024-03-01T10:00:00Z",
            "data": { "validationCode": "512d38b6-c7b8-40c8-89fe-f46f9e9622b6" }
        }))
        .unwrap();

        assert_eq!(
            event.payload().unwrap(),
            EventData::Other("Microsoft.EventGrid.SubscriptionValidationEvent".to_owned())
        );
    }

    #[test]
    fn system_event_types_match_regardless_of_case() {
        let mut created = blob_created("lower");
        created["eventType"] = json!("microsoft.storage.blobcreated");
        let event = EventGridEvent::deserialize(&created).unwrap();
        assert!(matches!(event.payload().unwrap(), EventData::BlobCreated(_)));

        let mut deleted = blob_created("upper");
        deleted["eventType"] = json!("MICROSOFT.STORAGE.BLOBDELETED");
        let event = EventGridEvent::deserialize(&deleted).unwrap();
        assert!(matches!(event.payload().unwrap(), EventData::BlobDeleted(_)));
    }

    #[test]
    fn blob_created_without_url_is_an_error() {
        let mut record = blob_created("nourl");
        record["data"].as_object_mut().unwrap().remove("url");
        let event: EventGridEvent = serde_json::from_value(record).unwrap();

        assert!(event.payload().is_err());
    }

    #[test]
    fn latency_is_measured_from_event_time() {
        let event: EventGridEvent = serde_json::from_value(blob_created("late")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 2).unwrap();

        assert_eq!(event.latency(now).num_milliseconds(), 1876);
    }

    #[test]
    fn rejects_garbage_and_empty_bodies() {
        assert!(matches!(
            Envelope::from_slice(b"not json"),
            Err(EnvelopeError::Decode(_))
        ));
        assert!(matches!(
            Envelope::from_slice(b"\"just a string\""),
            Err(EnvelopeError::Decode(_))
        ));
        assert!(matches!(Envelope::from_slice(b"  \n"), Err(EnvelopeError::Empty)));
        assert!(matches!(Envelope::from_slice(b""), Err(EnvelopeError::Empty)));
    }
}
