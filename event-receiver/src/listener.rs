use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::event_grid::{Envelope, EventData};
use crate::metrics::{
    BLOB_CREATED_EVENTS, EVENT_LATENCY, MESSAGES_RECEIVED, PARTITION_ERRORS, RECORDS_SKIPPED,
};

/// A message delivered by the processing client from one partition.
#[derive(Debug, Clone, Copy)]
pub struct PartitionEvent<'a> {
    pub partition_id: i32,
    pub offset: i64,
    pub body: Option<&'a [u8]>,
}

/// Callbacks invoked by the processing client. A handler is shared by every
/// partition the client owns, so implementations hold no per-call state.
pub trait EventHandler: Send + Sync {
    fn process_event(&self, event: PartitionEvent<'_>);

    /// `partition_id` is `None` when the client can't attribute the error to a partition.
    fn process_error(&self, partition_id: Option<i32>, error: &dyn std::error::Error);
}

/// One blob-creation notification, as logged by the listener.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobCreatedNotification {
    pub event_id: String,
    pub latency: chrono::Duration,
    pub url: String,
}

/// Logs the blob-creation notifications found in each delivered message and
/// ignores everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotificationListener;

impl NotificationListener {
    pub fn new() -> Self {
        NotificationListener
    }

    /// Handle one message body, returning the notifications that were logged.
    /// Undecodable bodies and records are skipped, never propagated.
    pub fn on_message(&self, partition_id: i32, body: &[u8]) -> Vec<BlobCreatedNotification> {
        self.on_message_at(partition_id, body, Utc::now())
    }

    pub fn on_message_at(
        &self,
        partition_id: i32,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Vec<BlobCreatedNotification> {
        metrics::counter!(MESSAGES_RECEIVED).increment(1);
        debug!(
            partition_id,
            body = %String::from_utf8_lossy(body),
            "received event"
        );

        let envelope = match Envelope::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(partition_id, "skipping message: {}", e);
                skip_record("invalid_envelope");
                return Vec::new();
            }
        };

        let mut notifications = Vec::new();
        for (position, event) in envelope.events().enumerate() {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(partition_id, position, "skipping malformed event record: {}", e);
                    skip_record("invalid_record");
                    continue;
                }
            };

            let data = match event.payload() {
                Ok(EventData::BlobCreated(data)) => data,
                Ok(_) => {
                    debug!(
                        partition_id,
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "ignoring event"
                    );
                    skip_record("unhandled_event_type");
                    continue;
                }
                Err(e) => {
                    warn!(
                        partition_id,
                        event_id = %event.id,
                        "skipping event with malformed payload: {}",
                        e
                    );
                    skip_record("invalid_payload");
                    continue;
                }
            };

            let latency = event.latency(now);
            info!(
                partition_id,
                event_id = %event.id,
                latency_ms = latency.num_milliseconds(),
                url = %data.url,
                "received blob created event"
            );

            metrics::counter!(BLOB_CREATED_EVENTS).increment(1);
            if let Ok(latency) = latency.to_std() {
                metrics::histogram!(EVENT_LATENCY).record(latency.as_secs_f64());
            }

            notifications.push(BlobCreatedNotification {
                event_id: event.id,
                latency,
                url: data.url,
            });
        }

        notifications
    }

    /// Log a delivery error. Recovery belongs to the processing client.
    pub fn on_error<E>(&self, partition_id: Option<i32>, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        let partition = match partition_id {
            Some(partition_id) => partition_id.to_string(),
            None => "unknown".to_owned(),
        };

        metrics::counter!(PARTITION_ERRORS, "partition" => partition.clone()).increment(1);
        error!(
            partition = %partition,
            "partition '{}': an unhandled error was encountered: {}",
            partition,
            error
        );
    }
}

impl EventHandler for NotificationListener {
    fn process_event(&self, event: PartitionEvent<'_>) {
        match event.body {
            Some(body) => {
                self.on_message(event.partition_id, body);
            }
            None => {
                warn!(
                    partition_id = event.partition_id,
                    offset = event.offset,
                    "skipping message without body"
                );
                skip_record("empty_body");
            }
        }
    }

    fn process_error(&self, partition_id: Option<i32>, error: &dyn std::error::Error) {
        self.on_error(partition_id, error);
    }
}

fn skip_record(reason: &'static str) {
    metrics::counter!(RECORDS_SKIPPED, "reason" => reason).increment(1);
}
