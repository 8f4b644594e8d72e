use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors raised while resolving the processor configuration.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("required setting {0} is missing or empty")]
    MissingSetting(&'static str),
    #[error("invalid connection string in {setting}: {reason}")]
    InvalidConnectionString {
        setting: &'static str,
        reason: String,
    },
    #[error("event hub {configured} does not match EntityPath {entity_path} of the namespace connection string")]
    EventHubMismatch {
        configured: String,
        entity_path: String,
    },
    #[error("{0} is not a valid checkpoint container name")]
    InvalidContainerName(String),
    #[error("{0} is not a valid offset reset policy, must be earliest or latest")]
    InvalidOffsetReset(String),
}

/// Enumeration of errors related to starting and stopping a subscription.
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("failed to create event hub consumer: {0}")]
    Consumer(#[from] KafkaError),
    #[error("event processing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Enumeration of errors raised when decoding a message body.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("received empty message body")]
    Empty,
    #[error("failed to decode notification envelope: {0}")]
    Decode(#[from] serde_json::Error),
}
