use std::time::Duration;

use envconfig::Envconfig;

use crate::connection_string::{EventHubsConnectionString, StorageConnectionString};
use crate::error::ConfigurationError;

pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

#[derive(Envconfig, Clone)]
pub struct Config {
    /// Connection string of the event hub namespace.
    #[envconfig(from = "EHUB_NS_CONNSTR")]
    pub namespace_connection_string: Option<String>,

    /// Connection string of the storage account holding checkpoints.
    #[envconfig(from = "EHUB_BLOB_CONNSTR")]
    pub checkpoint_connection_string: Option<String>,

    #[envconfig(from = "EHUB")]
    pub event_hub_name: Option<String>,

    #[envconfig(from = "EHUB_CONTAINER")]
    pub checkpoint_container: Option<String>,

    #[envconfig(from = "EHUB_CONSUMER_GROUP", default = "$Default")]
    pub consumer_group: String,

    /// How long the receiver runs before closing its subscription.
    #[envconfig(default = "1000")]
    pub run_duration_secs: u64,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // interval (in milliseconds) between checkpoint commits
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    /// Overrides the bootstrap servers derived from the namespace endpoint.
    pub kafka_hosts: Option<String>,

    /// SASL over TLS, as required by event hubs. Disable for plaintext local brokers.
    #[envconfig(default = "true")]
    pub kafka_tls: bool,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,
}

impl Config {
    /// Build a configuration from constant locators, leaving every other setting to
    /// its default.
    pub fn new(
        namespace_connection_string: &str,
        checkpoint_connection_string: &str,
        event_hub_name: &str,
        checkpoint_container: &str,
    ) -> Self {
        Config {
            namespace_connection_string: Some(namespace_connection_string.to_owned()),
            checkpoint_connection_string: Some(checkpoint_connection_string.to_owned()),
            event_hub_name: Some(event_hub_name.to_owned()),
            checkpoint_container: Some(checkpoint_container.to_owned()),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_owned(),
            run_duration_secs: 1000,
            kafka_consumer_offset_reset: "earliest".to_owned(),
            kafka_consumer_auto_commit_interval_ms: 5000,
            kafka_hosts: None,
            kafka_tls: true,
            export_prometheus: false,
            host: "0.0.0.0".to_owned(),
            port: 3310,
        }
    }

    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_secs(self.run_duration_secs)
    }

    /// Resolve and validate every locator the processor needs.
    pub fn processor_settings(&self) -> Result<ProcessorSettings, ConfigurationError> {
        let namespace = EventHubsConnectionString::parse(
            required(&self.namespace_connection_string, "EHUB_NS_CONNSTR")?,
            "EHUB_NS_CONNSTR",
        )?;
        let storage = StorageConnectionString::parse(
            required(&self.checkpoint_connection_string, "EHUB_BLOB_CONNSTR")?,
            "EHUB_BLOB_CONNSTR",
        )?;
        let checkpoint_store = CheckpointStoreLocator::new(
            storage,
            required(&self.checkpoint_container, "EHUB_CONTAINER")?,
        )?;

        let event_hub_name = match (
            optional(&self.event_hub_name),
            namespace.entity_path(),
        ) {
            (Some(configured), Some(entity_path)) if configured != entity_path => {
                return Err(ConfigurationError::EventHubMismatch {
                    configured: configured.to_owned(),
                    entity_path: entity_path.to_owned(),
                })
            }
            (Some(name), _) | (None, Some(name)) => name.to_owned(),
            (None, None) => return Err(ConfigurationError::MissingSetting("EHUB")),
        };

        let consumer_group = match self.consumer_group.trim() {
            "" => DEFAULT_CONSUMER_GROUP,
            group => group,
        }
        .to_owned();

        let offset_reset = self.kafka_consumer_offset_reset.trim().to_ascii_lowercase();
        if offset_reset != "earliest" && offset_reset != "latest" {
            return Err(ConfigurationError::InvalidOffsetReset(
                self.kafka_consumer_offset_reset.clone(),
            ));
        }

        let bootstrap_servers = optional(&self.kafka_hosts)
            .map(str::to_owned)
            .unwrap_or_else(|| namespace.kafka_bootstrap_servers());

        Ok(ProcessorSettings {
            namespace,
            event_hub_name,
            consumer_group,
            checkpoint_store,
            bootstrap_servers,
            tls: self.kafka_tls,
            offset_reset,
            auto_commit_interval_ms: self.kafka_consumer_auto_commit_interval_ms,
        })
    }
}

fn optional(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn required<'a>(
    value: &'a Option<String>,
    setting: &'static str,
) -> Result<&'a str, ConfigurationError> {
    optional(value).ok_or(ConfigurationError::MissingSetting(setting))
}

/// Where checkpoints for this consumer group live.
#[derive(Clone, Debug)]
pub struct CheckpointStoreLocator {
    storage: StorageConnectionString,
    container: String,
}

impl CheckpointStoreLocator {
    pub fn new(storage: StorageConnectionString, container: &str) -> Result<Self, ConfigurationError> {
        if !is_valid_container_name(container) {
            return Err(ConfigurationError::InvalidContainerName(container.to_owned()));
        }

        Ok(CheckpointStoreLocator {
            storage,
            container: container.to_owned(),
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn account_name(&self) -> Option<&str> {
        self.storage.account_name()
    }

    pub fn container_url(&self) -> String {
        format!(
            "{}/{}",
            self.storage.blob_endpoint().as_str().trim_end_matches('/'),
            self.container
        )
    }
}

/// Blob container names are 3 to 63 lowercase letters, digits and single hyphens,
/// starting and ending with a letter or digit.
fn is_valid_container_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    (3..=63).contains(&bytes.len())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0] != b'-'
        && bytes[bytes.len() - 1] != b'-'
        && !name.contains("--")
}

/// Everything `EventProcessor::start` needs, validated.
#[derive(Clone, Debug)]
pub struct ProcessorSettings {
    pub namespace: EventHubsConnectionString,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub checkpoint_store: CheckpointStoreLocator,
    pub bootstrap_servers: String,
    pub tls: bool,
    pub offset_reset: String,
    pub auto_commit_interval_ms: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const NAMESPACE: &str = "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=listen;SharedAccessKey=a2V5";
    const STORAGE: &str =
        "DefaultEndpointsProtocol=https;AccountName=checkpoints01;AccountKey=a2V5;EndpointSuffix=core.windows.net";

    fn sample() -> Config {
        Config::new(NAMESPACE, STORAGE, "hub02", "checkpoints")
    }

    #[test]
    fn reads_locators_and_defaults_from_env() {
        let env: HashMap<String, String> = [
            ("EHUB_NS_CONNSTR", NAMESPACE),
            ("EHUB_BLOB_CONNSTR", STORAGE),
            ("EHUB", "hub02"),
            ("EHUB_CONTAINER", "checkpoints"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect();

        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.namespace_connection_string.as_deref(), Some(NAMESPACE));
        assert_eq!(config.checkpoint_connection_string.as_deref(), Some(STORAGE));
        assert_eq!(config.event_hub_name.as_deref(), Some("hub02"));
        assert_eq!(config.checkpoint_container.as_deref(), Some("checkpoints"));
        assert_eq!(config.consumer_group, "$Default");
        assert_eq!(config.run_duration(), Duration::from_secs(1000));
        assert_eq!(config.kafka_consumer_offset_reset, "earliest");
        assert_eq!(config.kafka_consumer_auto_commit_interval_ms, 5000);
        assert_eq!(config.kafka_hosts, None);
        assert!(config.kafka_tls);
        assert!(!config.export_prometheus);
        assert_eq!(config.bind(), "0.0.0.0:3310");

        let settings = config.processor_settings().unwrap();
        assert_eq!(settings.event_hub_name, "hub02");
        assert_eq!(settings.checkpoint_store.container(), "checkpoints");
    }

    #[test]
    fn reads_optional_settings_from_env() {
        let env: HashMap<String, String> = [
            ("EHUB_CONSUMER_GROUP", "audit"),
            ("RUN_DURATION_SECS", "60"),
            ("KAFKA_HOSTS", "localhost:9092"),
            ("KAFKA_TLS", "false"),
            ("BIND_PORT", "8080"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect();

        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.namespace_connection_string, None);
        assert_eq!(config.consumer_group, "audit");
        assert_eq!(config.run_duration(), Duration::from_secs(60));
        assert_eq!(config.kafka_hosts.as_deref(), Some("localhost:9092"));
        assert!(!config.kafka_tls);
        assert_eq!(config.bind(), "0.0.0.0:8080");
    }

    #[test]
    fn resolves_settings_from_constants() {
        let settings = sample().processor_settings().unwrap();

        assert_eq!(settings.event_hub_name, "hub02");
        assert_eq!(settings.consumer_group, "$Default");
        assert_eq!(
            settings.bootstrap_servers,
            "contoso.servicebus.windows.net:9093"
        );
        assert_eq!(settings.offset_reset, "earliest");
        assert!(settings.tls);
        assert_eq!(
            settings.checkpoint_store.container_url(),
            "https://checkpoints01.blob.core.windows.net/checkpoints"
        );
        assert_eq!(settings.checkpoint_store.account_name(), Some("checkpoints01"));
    }

    #[test]
    fn every_locator_is_required() {
        let cases: [(fn(&mut Config), &str); 4] = [
            (|c| c.namespace_connection_string = None, "EHUB_NS_CONNSTR"),
            (|c| c.checkpoint_connection_string = None, "EHUB_BLOB_CONNSTR"),
            (|c| c.event_hub_name = None, "EHUB"),
            (|c| c.checkpoint_container = None, "EHUB_CONTAINER"),
        ];

        for (clear, expected) in cases {
            let mut config = sample();
            clear(&mut config);
            match config.processor_settings() {
                Err(ConfigurationError::MissingSetting(setting)) => assert_eq!(setting, expected),
                other => panic!("expected {expected} to be required, got {other:?}"),
            }
        }
    }

    #[test]
    fn blank_locators_count_as_missing() {
        let mut config = sample();
        config.checkpoint_container = Some("   ".to_owned());

        assert!(matches!(
            config.processor_settings(),
            Err(ConfigurationError::MissingSetting("EHUB_CONTAINER"))
        ));
    }

    #[test]
    fn entity_path_supplies_missing_hub_name() {
        let mut config = sample();
        config.namespace_connection_string = Some(format!("{NAMESPACE};EntityPath=hub01"));
        config.event_hub_name = None;

        assert_eq!(config.processor_settings().unwrap().event_hub_name, "hub01");
    }

    #[test]
    fn conflicting_entity_path_is_rejected() {
        let mut config = sample();
        config.namespace_connection_string = Some(format!("{NAMESPACE};EntityPath=hub01"));

        assert!(matches!(
            config.processor_settings(),
            Err(ConfigurationError::EventHubMismatch { .. })
        ));
    }

    #[test]
    fn validates_container_names() {
        assert!(is_valid_container_name("checkpoints"));
        assert!(is_valid_container_name("hub-02-checkpoints"));
        assert!(!is_valid_container_name("ab"));
        assert!(!is_valid_container_name("Checkpoints"));
        assert!(!is_valid_container_name("-checkpoints"));
        assert!(!is_valid_container_name("check--points"));
        assert!(!is_valid_container_name(&"a".repeat(64)));

        let mut config = sample();
        config.checkpoint_container = Some("Check_Points".to_owned());
        assert!(matches!(
            config.processor_settings(),
            Err(ConfigurationError::InvalidContainerName(_))
        ));
    }

    #[test]
    fn kafka_hosts_override_the_namespace_endpoint() {
        let mut config = sample();
        config.kafka_hosts = Some("localhost:9092".to_owned());
        config.kafka_tls = false;

        let settings = config.processor_settings().unwrap();
        assert_eq!(settings.bootstrap_servers, "localhost:9092");
        assert!(!settings.tls);
    }

    #[test]
    fn rejects_unknown_offset_reset() {
        let mut config = sample();
        config.kafka_consumer_offset_reset = "middle".to_owned();

        assert!(matches!(
            config.processor_settings(),
            Err(ConfigurationError::InvalidOffsetReset(_))
        ));
    }
}
