//! Store connection settings.

use mongodb::options::{ClientOptions, Credential, Tls, TlsOptions};
use purchase_status_core::StoreError;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default database holding purchase records.
pub const DEFAULT_DATABASE: &str = "services-pos";
/// Default collection holding purchase records.
pub const DEFAULT_COLLECTION: &str = "Purchase";

/// Where and how to connect to the purchase store.
///
/// Built with [`MongoConfig::builder`]. Credentials are applied to the driver
/// options directly, never embedded in the connection string. TLS settings
/// left unset keep whatever a full connection string specifies.
pub struct MongoConfig {
    uri: Option<SecretString>,
    hosts: Vec<String>,
    replica_set: Option<String>,
    username: String,
    password: SecretString,
    auth_source: String,
    database: String,
    collection: String,
    tls: Option<bool>,
    tls_allow_invalid_certificates: Option<bool>,
    tls_ca_file: Option<PathBuf>,
    max_pool_size: u32,
    connect_timeout: Duration,
}

impl MongoConfig {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> MongoConfigBuilder {
        MongoConfigBuilder::default()
    }

    /// Database holding purchase records.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Collection holding purchase records.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Hosts the driver is pointed at (empty when a full URI is used).
    #[must_use]
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Connection string handed to the driver, without credentials.
    #[must_use]
    pub fn connection_string(&self) -> String {
        self.uri.as_ref().map_or_else(
            || format!("mongodb://{}/{}", self.hosts.join(","), self.database),
            |uri| uri.expose_secret().to_string(),
        )
    }

    /// Driver options: parsed connection string plus credentials, replica
    /// set, TLS, pool size and timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the connection string does not parse.
    pub async fn client_options(&self) -> Result<ClientOptions, StoreError> {
        let mut options = ClientOptions::parse(self.connection_string())
            .await
            .map_err(|e| StoreError::Configuration(format!("Invalid store connection string: {e}")))?;

        options.app_name = Some("purchase-status-worker".to_string());
        options.credential = Some(
            Credential::builder()
                .username(self.username.clone())
                .password(self.password.expose_secret().to_string())
                .source(self.auth_source.clone())
                .build(),
        );
        if let Some(replica_set) = &self.replica_set {
            options.repl_set_name = Some(replica_set.clone());
        }
        options.max_pool_size = Some(self.max_pool_size);
        options.connect_timeout = Some(self.connect_timeout);
        options.server_selection_timeout = Some(self.connect_timeout);

        options.tls = match (self.tls, options.tls.take()) {
            (Some(false), _) => Some(Tls::Disabled),
            (Some(true) | None, Some(Tls::Enabled(tls))) => Some(Tls::Enabled(self.tls_options(tls))),
            (Some(true), _) => Some(Tls::Enabled(self.tls_options(TlsOptions::default()))),
            (None, parsed) => parsed,
        };

        Ok(options)
    }

    fn tls_options(&self, mut tls: TlsOptions) -> TlsOptions {
        if let Some(allow) = self.tls_allow_invalid_certificates {
            tls.allow_invalid_certificates = Some(allow);
        }
        if let Some(ca_file) = &self.tls_ca_file {
            tls.ca_file_path = Some(ca_file.clone());
        }
        tls
    }
}

impl fmt::Debug for MongoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoConfig")
            .field("uri", &self.uri.as_ref().map(|_| "[REDACTED]"))
            .field("hosts", &self.hosts)
            .field("replica_set", &self.replica_set)
            .field("username", &self.username)
            .field("auth_source", &self.auth_source)
            .field("database", &self.database)
            .field("collection", &self.collection)
            .field("tls", &self.tls)
            .field(
                "tls_allow_invalid_certificates",
                &self.tls_allow_invalid_certificates,
            )
            .field("tls_ca_file", &self.tls_ca_file)
            .field("max_pool_size", &self.max_pool_size)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`MongoConfig`].
///
/// # Example
///
/// ```
/// use purchase_status_mongodb::MongoConfig;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = MongoConfig::builder()
///     .hosts(["db-0:27017", "db-1:27017", "db-2:27017"])
///     .replica_set("rs0")
///     .credentials("pos", "s3cret".to_string())
///     .build()?;
/// assert_eq!(
///     config.connection_string(),
///     "mongodb://db-0:27017,db-1:27017,db-2:27017/services-pos"
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MongoConfigBuilder {
    uri: Option<SecretString>,
    hosts: Option<Vec<String>>,
    replica_set: Option<String>,
    username: Option<String>,
    password: Option<SecretString>,
    auth_source: Option<String>,
    database: Option<String>,
    collection: Option<String>,
    tls: Option<bool>,
    tls_allow_invalid_certificates: Option<bool>,
    tls_ca_file: Option<PathBuf>,
    max_pool_size: Option<u32>,
    connect_timeout: Option<Duration>,
}

impl MongoConfigBuilder {
    /// Use a complete connection string; hosts and replica set are then read from it.
    #[must_use]
    pub fn uri(mut self, uri: impl Into<SecretString>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Replica set members as `host:port` (default `localhost:27017`).
    #[must_use]
    pub fn hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    /// Replica set name.
    #[must_use]
    pub fn replica_set(mut self, name: impl Into<String>) -> Self {
        self.replica_set = Some(name.into());
        self
    }

    /// Login credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<SecretString>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Database the credentials are defined in (default `admin`).
    #[must_use]
    pub fn auth_source(mut self, source: impl Into<String>) -> Self {
        self.auth_source = Some(source.into());
        self
    }

    /// Database holding purchase records (default `services-pos`).
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Collection holding purchase records (default `Purchase`).
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Enable TLS (default `true`, or the connection string's setting when
    /// [`uri`](Self::uri) is used).
    #[must_use]
    pub const fn tls(mut self, enabled: bool) -> Self {
        self.tls = Some(enabled);
        self
    }

    /// Accept certificates that fail validation (default `false`, or the
    /// connection string's setting when [`uri`](Self::uri) is used).
    ///
    /// Exposes the connection to interception; only for test environments.
    #[must_use]
    pub const fn tls_allow_invalid_certificates(mut self, allow: bool) -> Self {
        self.tls_allow_invalid_certificates = Some(allow);
        self
    }

    /// CA bundle used to validate the server certificate.
    #[must_use]
    pub fn tls_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_ca_file = Some(path.into());
        self
    }

    /// Maximum pooled connections (default 10).
    #[must_use]
    pub const fn max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    /// Connect and server selection timeout (default 10 seconds).
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if credentials are missing, no
    /// host is configured, or the pool size is zero.
    pub fn build(self) -> Result<MongoConfig, StoreError> {
        let username = self
            .username
            .filter(|u| !u.is_empty())
            .ok_or_else(|| StoreError::Configuration("Store user name not configured".to_string()))?;
        let password = self
            .password
            .ok_or_else(|| StoreError::Configuration("Store password not configured".to_string()))?;

        let hosts = if self.uri.is_some() {
            Vec::new()
        } else {
            let hosts: Vec<String> = self
                .hosts
                .unwrap_or_else(|| vec!["localhost:27017".to_string()])
                .into_iter()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
            if hosts.is_empty() {
                return Err(StoreError::Configuration(
                    "No store hosts configured".to_string(),
                ));
            }
            hosts
        };

        let max_pool_size = self.max_pool_size.unwrap_or(10);
        if max_pool_size == 0 {
            return Err(StoreError::Configuration(
                "Store pool size must be at least 1".to_string(),
            ));
        }

        let explicit_uri = self.uri.is_some();
        let tls = self.tls.or((!explicit_uri).then_some(true));
        let tls_allow_invalid_certificates = self
            .tls_allow_invalid_certificates
            .or((!explicit_uri).then_some(false));
        if tls_allow_invalid_certificates == Some(true) {
            tracing::warn!("Store TLS certificate validation is disabled");
        }

        Ok(MongoConfig {
            uri: self.uri,
            hosts,
            replica_set: self.replica_set,
            username,
            password,
            auth_source: self.auth_source.unwrap_or_else(|| "admin".to_string()),
            database: self.database.unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            collection: self.collection.unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            tls,
            tls_allow_invalid_certificates,
            tls_ca_file: self.tls_ca_file,
            max_pool_size,
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(10)),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn base() -> MongoConfigBuilder {
        MongoConfig::builder().credentials("pos", "pw".to_string())
    }

    #[test]
    fn defaults_match_the_purchase_store() {
        let config = base().build().unwrap();
        assert_eq!(config.database(), "services-pos");
        assert_eq!(config.collection(), "Purchase");
        assert_eq!(config.connection_string(), "mongodb://localhost:27017/services-pos");
    }

    #[test]
    fn uri_overrides_hosts() {
        let config = base()
            .uri("mongodb://a:1,b:2/?replicaSet=rs".to_string())
            .hosts(["ignored:27017"])
            .build()
            .unwrap();
        assert!(config.hosts().is_empty());
        assert_eq!(config.connection_string(), "mongodb://a:1,b:2/?replicaSet=rs");
    }

    #[test]
    fn missing_credentials_and_hosts_are_rejected() {
        assert!(matches!(
            MongoConfig::builder().build(),
            Err(StoreError::Configuration(_))
        ));
        assert!(matches!(
            base().hosts([" ", ""]).build(),
            Err(StoreError::Configuration(_))
        ));
        assert!(matches!(
            base().max_pool_size(0).build(),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn debug_output_hides_password() {
        let config = MongoConfig::builder()
            .credentials("pos", "hunter2".to_string())
            .build()
            .unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn client_options_carry_credentials_and_tls() {
        let config = base()
            .hosts(["db-0:27017", "db-1:27017"])
            .replica_set("rs0")
            .auth_source("admin")
            .max_pool_size(4)
            .build()
            .unwrap();

        let options = config.client_options().await.unwrap();

        assert_eq!(options.hosts.len(), 2);
        assert_eq!(options.repl_set_name.as_deref(), Some("rs0"));
        assert_eq!(options.max_pool_size, Some(4));
        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("pos"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
        match options.tls {
            Some(Tls::Enabled(tls)) => {
                assert_eq!(tls.allow_invalid_certificates, Some(false));
                assert!(tls.ca_file_path.is_none());
            }
            other => panic!("expected TLS enabled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tls_can_be_disabled() {
        let options = base().tls(false).build().unwrap().client_options().await.unwrap();
        assert!(matches!(options.tls, Some(Tls::Disabled)));
    }

    #[tokio::test]
    async fn uri_tls_settings_survive_unless_overridden() {
        let uri = "mongodb://db-0:27017/?tls=true&tlsAllowInvalidCertificates=true";

        let options = base()
            .uri(uri.to_string())
            .build()
            .unwrap()
            .client_options()
            .await
            .unwrap();
        match options.tls {
            Some(Tls::Enabled(tls)) => assert_eq!(tls.allow_invalid_certificates, Some(true)),
            other => panic!("expected TLS enabled, got {other:?}"),
        }

        let options = base()
            .uri(uri.to_string())
            .tls_allow_invalid_certificates(false)
            .build()
            .unwrap()
            .client_options()
            .await
            .unwrap();
        match options.tls {
            Some(Tls::Enabled(tls)) => assert_eq!(tls.allow_invalid_certificates, Some(false)),
            other => panic!("expected TLS enabled, got {other:?}"),
        }

        let options = base()
            .uri(uri.to_string())
            .tls(false)
            .build()
            .unwrap()
            .client_options()
            .await
            .unwrap();
        assert!(matches!(options.tls, Some(Tls::Disabled)));
    }
}
