//! Connection management
//!
//! [`ConnectionFactory::new_connection`] turns [`ConnectionSettings`] into a
//! live [`PulsarConnection`]: it picks the authentication strategy, decodes
//! any embedded key material into a private directory, and builds the broker
//! client. The connection owns both the client and that directory and tears
//! them down exactly once on [`PulsarConnection::stop`]. A failed construction
//! removes the directory before returning.

use crate::config::{AuthMode, ConnectionSettings};
use crate::credentials::{materialize, MaterializedCredentials};
use crate::error::{sanitize_error_message, BridgeError, BridgeResult};
use crate::transport::pulsar::PulsarConnector;
use crate::transport::{AuthStrategy, BrokerClient, BrokerConnector, ClientOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, Instrument};
use url::Url;

/// Connection type name registered with the host
pub const CONNECTION_TYPE: &str = "pulsar";

/// URL scheme selecting an encrypted broker transport
pub const TLS_SCHEME: &str = "pulsar+ssl";

/// Creates connections through an injected broker connector
#[derive(Clone)]
pub struct ConnectionFactory {
    connector: Arc<dyn BrokerConnector>,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self { connector }
    }

    /// Factory backed by the Apache Pulsar client
    pub fn pulsar() -> Self {
        Self::new(Arc::new(PulsarConnector))
    }

    pub fn type_name(&self) -> &'static str {
        CONNECTION_TYPE
    }

    /// Build a connection from settings.
    ///
    /// Fails without leaving a partial connection or credential files behind.
    pub async fn new_connection(&self, settings: ConnectionSettings) -> BridgeResult<PulsarConnection> {
        let span = crate::connection_span!(connection = %settings.name, auth = %settings.auth);
        async move {
            settings.validate().map_err(|e| BridgeError::ConnectionInit {
                name: settings.name.clone(),
                message: "invalid connection settings".to_string(),
                source: Some(Box::new(e)),
            })?;

            let credentials = materialize(&settings)?;
            let options = build_client_options(&settings, credentials.as_ref())?;
            debug!(?options, "Resolved client options");

            let client = match self.connector.connect(options).await {
                Ok(client) => client,
                Err(e) => {
                    error!("Connection failed: {}", e.sanitized());
                    // credentials drop here, removing the directory
                    return Err(e);
                }
            };

            info!("Connection established");
            Ok(PulsarConnection {
                settings,
                client,
                credentials: Mutex::new(credentials),
                released: AtomicBool::new(false),
            })
        }
        .instrument(span)
        .await
    }
}

/// Pick the authentication strategy for the configured mode
pub fn resolve_auth(
    settings: &ConnectionSettings,
    credentials: Option<&MaterializedCredentials>,
) -> BridgeResult<AuthStrategy> {
    match settings.auth {
        AuthMode::None => Ok(AuthStrategy::None),
        AuthMode::Tls => {
            let files = credentials.and_then(|c| Some((c.cert_path()?, c.key_path()?)));
            let (cert_path, key_path) = files.ok_or_else(|| {
                BridgeError::connection_init(
                    &settings.name,
                    "auth = \"TLS\" requires both certFile and keyFile",
                )
            })?;
            Ok(AuthStrategy::Tls {
                cert_path,
                key_path,
            })
        }
        AuthMode::Jwt => settings
            .jwt()
            .map(|jwt| AuthStrategy::Token(jwt.to_string()))
            .ok_or_else(|| {
                BridgeError::connection_init(&settings.name, "auth = \"JWT\" requires a jwt")
            }),
    }
}

/// True when the broker URL selects an encrypted transport
pub fn is_tls_url(settings: &ConnectionSettings) -> BridgeResult<bool> {
    let url = Url::parse(&settings.url).map_err(|e| BridgeError::ConnectionInit {
        name: settings.name.clone(),
        message: format!("invalid broker url '{}'", settings.url),
        source: Some(Box::new(e)),
    })?;
    Ok(url.scheme() == TLS_SCHEME)
}

/// Resolve everything the broker client needs from settings and credentials
pub fn build_client_options(
    settings: &ConnectionSettings,
    credentials: Option<&MaterializedCredentials>,
) -> BridgeResult<ClientOptions> {
    let auth = resolve_auth(settings, credentials)?;

    let trust_certs_path = if is_tls_url(settings)? {
        credentials.and_then(MaterializedCredentials::ca_cert_path)
    } else {
        None
    };

    Ok(ClientOptions {
        name: settings.name.clone(),
        url: settings.url.clone(),
        auth,
        trust_certs_path,
        allow_insecure_tls: settings.allow_insecure,
        validate_hostname: false,
    })
}

/// A live broker connection and the credential files it depends on
pub struct PulsarConnection {
    settings: ConnectionSettings,
    client: Arc<dyn BrokerClient>,
    credentials: Mutex<Option<MaterializedCredentials>>,
    released: AtomicBool,
}

impl PulsarConnection {
    pub fn type_name(&self) -> &'static str {
        CONNECTION_TYPE
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Shared client handle for publishers and triggers
    pub fn get_connection(&self) -> Arc<dyn BrokerClient> {
        self.client.clone()
    }

    /// Directory holding materialized credentials, while the connection is live
    pub fn credentials_dir(&self) -> Option<PathBuf> {
        self.credentials
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|c| c.path().to_path_buf()))
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Lifecycle hook; the client is already usable after construction
    pub async fn start(&self) -> BridgeResult<()> {
        debug!(connection = %self.settings.name, "Connection start");
        Ok(())
    }

    /// Close the client and delete the credential directory.
    ///
    /// Only the first call does any work.
    pub async fn stop(&self) -> BridgeResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(connection = %self.settings.name, "Stopping connection");

        self.client.close().await;

        let credentials = match self.credentials.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(credentials) = credentials {
            let dir = credentials.path().display().to_string();
            credentials.close()?;
            debug!(dir = %dir, "Removed credential directory");
        }
        Ok(())
    }

    /// Host hook for returning the connection; same as [`Self::stop`] but never fails
    pub async fn release_connection(&self) {
        if let Err(e) = self.stop().await {
            error!(
                connection = %self.settings.name,
                "Connection release failed: {}",
                sanitize_error_message(&e.to_string())
            );
        }
    }
}
