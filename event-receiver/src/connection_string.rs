//! Parsing for the `Key=Value;Key=Value` connection strings handed out by the
//! event hub namespace and by the checkpoint storage account.
use std::collections::HashMap;
use std::fmt;

use url::Url;

use crate::error::ConfigurationError;

/// Event hubs expose their Kafka-compatible endpoint on this port of the namespace host.
pub const KAFKA_ENDPOINT_PORT: u16 = 9093;

const DEVELOPMENT_STORAGE_ACCOUNT: &str = "devstoreaccount1";
const DEVELOPMENT_STORAGE_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";
const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/// Split a connection string in its settings. Keys are matched case-insensitively,
/// values may contain `=` (base64 keys usually do).
fn parse_settings(
    raw: &str,
    setting: &'static str,
) -> Result<HashMap<String, String>, ConfigurationError> {
    let mut settings = HashMap::new();

    for (position, segment) in raw
        .split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .enumerate()
    {
        let Some((key, value)) = segment.split_once('=') else {
            // Never echo the segment back, it may be a secret.
            return Err(ConfigurationError::InvalidConnectionString {
                setting,
                reason: format!("segment {} is not a key=value pair", position + 1),
            });
        };

        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(ConfigurationError::InvalidConnectionString {
                setting,
                reason: format!("segment {} has an empty key", position + 1),
            });
        }
        settings.insert(key, value.trim().to_owned());
    }

    if settings.is_empty() {
        return Err(ConfigurationError::MissingSetting(setting));
    }

    Ok(settings)
}

fn non_empty<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

/// Connection string of an event hub namespace, as copied from its shared access policy:
/// `Endpoint=sb://<namespace>.servicebus.windows.net/;SharedAccessKeyName=..;SharedAccessKey=..[;EntityPath=<hub>]`
#[derive(Clone)]
pub struct EventHubsConnectionString {
    raw: String,
    namespace: String,
    shared_access_key_name: Option<String>,
    entity_path: Option<String>,
}

impl EventHubsConnectionString {
    pub fn parse(raw: &str, setting: &'static str) -> Result<Self, ConfigurationError> {
        let settings = parse_settings(raw, setting)?;
        let invalid = |reason: &str| ConfigurationError::InvalidConnectionString {
            setting,
            reason: reason.to_owned(),
        };

        let endpoint = non_empty(&settings, "endpoint").ok_or_else(|| invalid("missing Endpoint"))?;
        let endpoint = Url::parse(endpoint).map_err(|e| invalid(&format!("bad Endpoint: {e}")))?;
        let namespace = endpoint
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("Endpoint has no host"))?
            .to_owned();

        let shared_access_key_name = non_empty(&settings, "sharedaccesskeyname");
        let has_key = shared_access_key_name.is_some()
            && non_empty(&settings, "sharedaccesskey").is_some();
        let has_signature = non_empty(&settings, "sharedaccesssignature").is_some();
        if !has_key && !has_signature {
            return Err(invalid(
                "expected SharedAccessKeyName and SharedAccessKey, or SharedAccessSignature",
            ));
        }

        Ok(EventHubsConnectionString {
            raw: raw.trim().to_owned(),
            namespace,
            shared_access_key_name: shared_access_key_name.map(str::to_owned),
            entity_path: non_empty(&settings, "entitypath").map(str::to_owned),
        })
    }

    /// Host name of the namespace, e.g. `contoso.servicebus.windows.net`.
    pub fn fully_qualified_namespace(&self) -> &str {
        &self.namespace
    }

    pub fn shared_access_key_name(&self) -> Option<&str> {
        self.shared_access_key_name.as_deref()
    }

    /// Event hub named in the connection string, when it is scoped to a single hub.
    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }

    pub fn kafka_bootstrap_servers(&self) -> String {
        format!("{}:{}", self.namespace, KAFKA_ENDPOINT_PORT)
    }

    /// The full connection string, used verbatim as the SASL password.
    pub fn expose_secret(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for EventHubsConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHubsConnectionString")
            .field("namespace", &self.namespace)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field("entity_path", &self.entity_path)
            .finish_non_exhaustive()
    }
}

/// Connection string of the storage account holding checkpoints. Supports the account
/// form (`AccountName` + `AccountKey`), an explicit `BlobEndpoint`, and the local
/// development storage shortcut.
#[derive(Clone, Debug)]
pub struct StorageConnectionString {
    account_name: Option<String>,
    blob_endpoint: Url,
}

impl StorageConnectionString {
    pub fn parse(raw: &str, setting: &'static str) -> Result<Self, ConfigurationError> {
        let settings = parse_settings(raw, setting)?;
        let invalid = |reason: &str| ConfigurationError::InvalidConnectionString {
            setting,
            reason: reason.to_owned(),
        };

        if non_empty(&settings, "usedevelopmentstorage")
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
        {
            let blob_endpoint = Url::parse(DEVELOPMENT_STORAGE_BLOB_ENDPOINT)
                .map_err(|e| invalid(&format!("bad development endpoint: {e}")))?;
            return Ok(StorageConnectionString {
                account_name: Some(DEVELOPMENT_STORAGE_ACCOUNT.to_owned()),
                blob_endpoint,
            });
        }

        let has_credentials = non_empty(&settings, "accountkey").is_some()
            || non_empty(&settings, "sharedaccesssignature").is_some();
        if !has_credentials {
            return Err(invalid("expected AccountKey or SharedAccessSignature"));
        }

        let account_name = non_empty(&settings, "accountname").map(str::to_owned);
        let blob_endpoint = match (non_empty(&settings, "blobendpoint"), &account_name) {
            (Some(endpoint), _) => {
                Url::parse(endpoint).map_err(|e| invalid(&format!("bad BlobEndpoint: {e}")))?
            }
            (None, Some(account)) => {
                let protocol =
                    non_empty(&settings, "defaultendpointsprotocol").unwrap_or("https");
                let suffix =
                    non_empty(&settings, "endpointsuffix").unwrap_or(DEFAULT_ENDPOINT_SUFFIX);
                Url::parse(&format!("{protocol}://{account}.blob.{suffix}"))
                    .map_err(|e| invalid(&format!("bad account endpoint: {e}")))?
            }
            (None, None) => return Err(invalid("expected AccountName or BlobEndpoint")),
        };

        Ok(StorageConnectionString {
            account_name,
            blob_endpoint,
        })
    }

    pub fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }

    pub fn blob_endpoint(&self) -> &Url {
        &self.blob_endpoint
    }
}
