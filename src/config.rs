//! Bridge configuration
//!
//! Settings are read from a TOML document with one `[connection]` table, an
//! optional `[publish]` table and any number of `[[handlers]]` entries. Field
//! names match the host's settings keys (`cacert`, `certFile`, `allowinsecure`,
//! `subscriptiontype`, ...) so the same documents can be shared with the host.

use crate::transport::{InitialPosition, SubscriptionType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub connection: ConnectionSettings,
    /// Publish activity settings (optional, only needed for publishing)
    pub publish: Option<PublishSettings>,
    /// One entry per trigger handler; each becomes one live consumer
    #[serde(default)]
    pub handlers: Vec<HandlerSettings>,
}

/// Authentication mode for the broker connection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuthMode {
    #[default]
    #[serde(rename = "None", alias = "", alias = "NONE")]
    None,
    #[serde(rename = "TLS")]
    Tls,
    #[serde(rename = "JWT")]
    Jwt,
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::None => write!(f, "None"),
            AuthMode::Tls => write!(f, "TLS"),
            AuthMode::Jwt => write!(f, "JWT"),
        }
    }
}

/// Connection settings
///
/// `cacert`, `certFile` and `keyFile` hold JSON documents of the shape
/// `{"content": "...base64,<data>"}` rather than filesystem paths.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettings {
    pub name: String,
    pub url: String,
    #[serde(default, rename = "cacert")]
    pub ca_cert: Option<String>,
    #[serde(default, rename = "certFile")]
    pub cert_file: Option<String>,
    #[serde(default, rename = "keyFile")]
    pub key_file: Option<String>,
    #[serde(default)]
    pub jwt: Option<String>,
    #[serde(default)]
    pub auth: AuthMode,
    #[serde(default, rename = "allowinsecure")]
    pub allow_insecure: bool,
}

// Credential content and tokens stay out of logs.
impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("ca_cert", &self.ca_cert().map(|_| "<redacted>"))
            .field("cert_file", &self.cert_file().map(|_| "<redacted>"))
            .field("key_file", &self.key_file().map(|_| "<redacted>"))
            .field("jwt", &self.jwt().map(|_| "<redacted>"))
            .field("auth", &self.auth)
            .field("allow_insecure", &self.allow_insecure)
            .finish()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl ConnectionSettings {
    /// Plain connection without credentials
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ca_cert: None,
            cert_file: None,
            key_file: None,
            jwt: None,
            auth: AuthMode::None,
            allow_insecure: false,
        }
    }

    pub fn ca_cert(&self) -> Option<&str> {
        non_empty(&self.ca_cert)
    }

    pub fn cert_file(&self) -> Option<&str> {
        non_empty(&self.cert_file)
    }

    pub fn key_file(&self) -> Option<&str> {
        non_empty(&self.key_file)
    }

    pub fn jwt(&self) -> Option<&str> {
        non_empty(&self.jwt)
    }

    /// Copy with credential content replaced, for display
    pub fn redacted(&self) -> Self {
        let mask = |value: &Option<String>| non_empty(value).map(|_| "<redacted>".to_string());
        Self {
            ca_cert: mask(&self.ca_cert),
            cert_file: mask(&self.cert_file),
            key_file: mask(&self.key_file),
            jwt: mask(&self.jwt),
            ..self.clone()
        }
    }

    /// True when any certificate, key or CA content is configured
    pub fn has_key_material(&self) -> bool {
        self.ca_cert().is_some() || self.cert_file().is_some() || self.key_file().is_some()
    }

    /// Check required fields and the auth mode invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField("connection.name".to_string()));
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingField("connection.url".to_string()));
        }
        match self.auth {
            AuthMode::None => {}
            AuthMode::Tls => {
                if self.cert_file().is_none() {
                    return Err(ConfigError::InvalidConfig(
                        "auth = \"TLS\" requires certFile".to_string(),
                    ));
                }
                if self.key_file().is_none() {
                    return Err(ConfigError::InvalidConfig(
                        "auth = \"TLS\" requires keyFile".to_string(),
                    ));
                }
            }
            AuthMode::Jwt => {
                if self.jwt().is_none() {
                    return Err(ConfigError::InvalidConfig(
                        "auth = \"JWT\" requires a non-empty jwt".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Publish activity settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishSettings {
    pub topic: String,
    /// Raw compression setting; unrecognized values mean no compression
    #[serde(default, rename = "compressiontype")]
    pub compression_type: String,
    /// Upper bound for a single send in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

fn default_send_timeout() -> u64 {
    30
}

impl PublishSettings {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            compression_type: String::new(),
            send_timeout_secs: default_send_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::MissingField("publish.topic".to_string()));
        }
        if self.send_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "publish.send_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trigger handler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerSettings {
    pub topic: String,
    pub subscription: String,
    #[serde(default, rename = "subscriptiontype")]
    pub subscription_type: SubscriptionType,
    #[serde(default, rename = "initialposition")]
    pub initial_position: InitialPosition,
    #[serde(default, rename = "dlqmaxdeliveries")]
    pub dlq_max_deliveries: Option<u32>,
    #[serde(default, rename = "dlqtopic")]
    pub dlq_topic: Option<String>,
}

impl HandlerSettings {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            subscription_type: SubscriptionType::default(),
            initial_position: InitialPosition::default(),
            dlq_max_deliveries: None,
            dlq_topic: None,
        }
    }

    /// Dead-letter topic, if one is configured
    pub fn dlq_topic(&self) -> Option<&str> {
        non_empty(&self.dlq_topic)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::MissingField("handlers.topic".to_string()));
        }
        if self.subscription.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "handlers.subscription (topic '{}')",
                self.topic
            )));
        }
        if self.dlq_topic().is_some() && self.dlq_max_deliveries.unwrap_or(0) == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "handler for topic '{}' sets dlqtopic but dlqmaxdeliveries is not at least 1",
                self.topic
            )));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Missing required setting: {0}")]
    MissingField(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Copy safe to print: credential content is masked
    pub fn redacted(&self) -> Self {
        Self {
            connection: self.connection.redacted(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        if let Some(ref publish) = self.publish {
            publish.validate()?;
        }
        for handler in &self.handlers {
            handler.validate()?;
        }
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[connection]
name = "test-connection"
url = "pulsar://localhost:6650"

[publish]
topic = "wcntopic"

[[handlers]]
topic = "wcntopic"
subscription = "wcn-sub"
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[connection]
name = "secure"
url = "pulsar+ssl://broker.example.com:6651"
auth = "TLS"
cacert = '{"content":"base64,Y2E="}'
certFile = '{"content":"base64,Y2VydA=="}'
keyFile = '{"content":"base64,a2V5"}'
allowinsecure = true

[publish]
topic = "wcntopic"
compressiontype = "ZSTD"
send_timeout_secs = 5

[[handlers]]
topic = "wcntopic"
subscription = "wcn-sub"
subscriptiontype = "KeyShared"
initialposition = "Latest"
dlqtopic = "wcntopic-dlq"
dlqmaxdeliveries = 3

[[handlers]]
topic = "other"
subscription = "other-sub"
"#;

        let config = BridgeConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.connection.auth, AuthMode::Tls);
        assert!(config.connection.allow_insecure);
        assert!(config.connection.has_key_material());

        let publish = config.publish.unwrap();
        assert_eq!(publish.compression_type, "ZSTD");
        assert_eq!(publish.send_timeout_secs, 5);

        assert_eq!(config.handlers.len(), 2);
        let dlq_handler = &config.handlers[0];
        assert_eq!(dlq_handler.subscription_type, SubscriptionType::KeyShared);
        assert_eq!(dlq_handler.initial_position, InitialPosition::Latest);
        assert_eq!(dlq_handler.dlq_topic(), Some("wcntopic-dlq"));
        assert_eq!(dlq_handler.dlq_max_deliveries, Some(3));

        let plain_handler = &config.handlers[1];
        assert_eq!(plain_handler.subscription_type, SubscriptionType::Exclusive);
        assert_eq!(plain_handler.initial_position, InitialPosition::Earliest);
        assert_eq!(plain_handler.dlq_topic(), None);
    }

    #[test]
    fn test_minimal_config() {
        let config = BridgeConfig::test_config();
        assert_eq!(config.connection.auth, AuthMode::None);
        assert!(!config.connection.allow_insecure);
        assert!(!config.connection.has_key_material());
        assert_eq!(config.publish.unwrap().send_timeout_secs, 30);
    }

    #[test]
    fn test_empty_strings_mean_defaults() {
        let toml_content = r#"
[connection]
name = "c"
url = "pulsar://localhost:6650"
auth = ""
cacert = ""
jwt = ""

[[handlers]]
topic = "t"
subscription = "s"
subscriptiontype = ""
initialposition = ""
dlqtopic = ""
"#;
        let config = BridgeConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.connection.auth, AuthMode::None);
        assert_eq!(config.connection.ca_cert(), None);
        assert_eq!(config.connection.jwt(), None);
        assert_eq!(config.handlers[0].dlq_topic(), None);
    }

    #[test]
    fn test_unknown_compression_is_not_a_config_error() {
        let toml_content = r#"
[connection]
name = "c"
url = "pulsar://localhost:6650"

[publish]
topic = "t"
compressiontype = "brotli"
"#;
        let config = BridgeConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.publish.unwrap().compression_type, "brotli");
    }

    #[test]
    fn test_unknown_subscription_type_is_rejected() {
        let toml_content = r#"
[connection]
name = "c"
url = "pulsar://localhost:6650"

[[handlers]]
topic = "t"
subscription = "s"
subscriptiontype = "Broadcast"
"#;
        let result = BridgeConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let mut settings = ConnectionSettings::new("c", "pulsar+ssl://localhost:6651");
        settings.auth = AuthMode::Tls;
        settings.cert_file = Some(r#"{"content":"base64,Y2VydA=="}"#.to_string());

        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("keyFile"));

        settings.key_file = Some(r#"{"content":"base64,a2V5"}"#.to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_jwt_requires_token() {
        let mut settings = ConnectionSettings::new("c", "pulsar://localhost:6650");
        settings.auth = AuthMode::Jwt;
        settings.jwt = Some(String::new());
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        settings.jwt = Some("eyJhbGciOiJIUzI1NiJ9.e30.sig".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_missing_name_and_url() {
        let settings = ConnectionSettings::new("", "pulsar://localhost:6650");
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingField(field)) if field == "connection.name"
        ));

        let settings = ConnectionSettings::new("c", " ");
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::MissingField(field)) if field == "connection.url"
        ));
    }

    #[test]
    fn test_dlq_topic_requires_max_deliveries() {
        let mut handler = HandlerSettings::new("t", "s");
        handler.dlq_topic = Some("t-dlq".to_string());
        assert!(handler.validate().is_err());

        handler.dlq_max_deliveries = Some(0);
        assert!(handler.validate().is_err());

        handler.dlq_max_deliveries = Some(3);
        assert!(handler.validate().is_ok());
    }

    #[test]
    fn test_debug_output_redacts_credentials() {
        let mut settings = ConnectionSettings::new("c", "pulsar://localhost:6650");
        settings.auth = AuthMode::Jwt;
        settings.jwt = Some("super-secret-token".to_string());

        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_redacted_config_serializes_without_secrets() {
        let mut config = BridgeConfig::test_config();
        config.connection.jwt = Some("eyJhbGciOi.secret".to_string());
        config.connection.auth = AuthMode::Jwt;

        let shown = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!shown.contains("eyJhbGciOi"));
        assert!(shown.contains("<redacted>"));
        assert!(config.redacted().connection.ca_cert.is_none());
    }

    #[test]
    fn test_auth_mode_display() {
        assert_eq!(AuthMode::None.to_string(), "None");
        assert_eq!(AuthMode::Tls.to_string(), "TLS");
        assert_eq!(AuthMode::Jwt.to_string(), "JWT");
    }
}
