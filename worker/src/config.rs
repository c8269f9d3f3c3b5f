//! Configuration management for the worker.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Only credentials are required; every missing credential is reported in a
//! single error.

use purchase_status_amqp::AmqpConfig;
use purchase_status_core::{AckMode, ConsumerSpec, PurchaseStatus, QueueSpec, Topology};
use purchase_status_mongodb::MongoConfig;
use purchase_status_runtime::{
    ConsumerLoopConfig, MalformedPolicy, MissingPurchasePolicy, ProcessorPolicy, RetryPolicy,
};
use secrecy::SecretString;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required variables are not set.
    #[error("Missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    /// A variable is set but cannot be used.
    #[error("Invalid value for {var}: {reason}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Everything the worker needs to run.
#[derive(Debug)]
pub struct WorkerConfig {
    /// Broker connection.
    pub amqp: AmqpConfig,
    /// Backoff between broker reconnect attempts.
    pub reconnect: RetryPolicy,
    /// Queue, exchange and binding to declare.
    pub topology: Topology,
    /// Consumer registration.
    pub consumer: ConsumerSpec,
    /// Store connection.
    pub mongo: MongoConfig,
    /// Concurrency and shutdown settings.
    pub consumer_loop: ConsumerLoopConfig,
    /// Outcome policies.
    pub processor: ProcessorPolicy,
    /// Prometheus listener address, if metrics are enabled.
    pub metrics_addr: Option<SocketAddr>,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// See [`WorkerConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    ///
    /// Empty values are treated as unset.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`] listing every required variable that is unset
    /// - [`ConfigError::Invalid`] for the first value that does not parse
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let amqp_url = vars.get("AMQP_URL");
        let broker_credentials: &[&'static str] = if amqp_url.is_some() {
            &[]
        } else {
            &["CLOUD_AMQP_USER", "CLOUD_AMQP_PASSWORD"]
        };
        let missing: Vec<&'static str> = broker_credentials
            .iter()
            .chain(&["MONGO_USR", "MONGO_PWD"])
            .copied()
            .filter(|var| vars.get(var).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let amqp_var = if amqp_url.is_some() { "AMQP_URL" } else { "AMQP_HOST" };
        let amqp = match amqp_url {
            Some(url) => AmqpConfig::from_url(&SecretString::from(url)),
            None => {
                let mut builder = AmqpConfig::builder().credentials(
                    vars.get("CLOUD_AMQP_USER").unwrap_or_default(),
                    vars.get("CLOUD_AMQP_PASSWORD").unwrap_or_default(),
                );
                if let Some(scheme) = vars.get("AMQP_SCHEME") {
                    builder = builder.scheme(scheme);
                }
                if let Some(host) = vars.get("AMQP_HOST") {
                    builder = builder.host(host);
                }
                if let Some(vhost) = vars.get("AMQP_VHOST") {
                    builder = builder.vhost(vhost);
                }
                builder.build()
            }
        }
        .map_err(|e| ConfigError::Invalid {
            var: amqp_var,
            reason: e.to_string(),
        })?;

        let reconnect = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(
                vars.parse("RECONNECT_INITIAL_DELAY_MS", 500)?,
            ))
            .max_delay(Duration::from_millis(vars.parse("RECONNECT_MAX_DELAY_MS", 30_000)?))
            .build();

        let queue = vars.get("AMQP_QUEUE").map_or_else(QueueSpec::server_named, |name| QueueSpec {
            name,
            auto_delete: false,
            durable: true,
            dead_letter_exchange: None,
        });
        let queue = QueueSpec {
            dead_letter_exchange: vars.get("AMQP_DEAD_LETTER_EXCHANGE"),
            ..queue
        };

        let mut topology = Topology::purchase_created();
        topology.queue = queue.clone();
        if let Some(exchange) = vars.get("AMQP_EXCHANGE") {
            topology.exchange.name = exchange;
        }
        topology.exchange.kind = vars.parse("AMQP_EXCHANGE_KIND", topology.exchange.kind)?;
        if let Some(routing_key) = vars.get("AMQP_ROUTING_KEY") {
            topology.binding.routing_key = routing_key;
        }

        let consumer = ConsumerSpec {
            tag: vars
                .get("AMQP_CONSUMER_TAG")
                .unwrap_or_else(|| "purchase-status-worker".to_string()),
            queue,
            ack_mode: vars.parse("ACK_MODE", AckMode::Manual)?,
            prefetch: vars.parse("AMQP_PREFETCH", 32)?,
        };

        let mongo = Self::mongo(&vars)?;

        let consumer_loop = ConsumerLoopConfig {
            max_in_flight: vars.parse("MAX_IN_FLIGHT", 16)?,
            shutdown_timeout: Duration::from_secs(vars.parse("SHUTDOWN_TIMEOUT_SECS", 30)?),
        };
        if consumer_loop.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_IN_FLIGHT",
                reason: "must be at least 1".to_string(),
            });
        }

        let processor = ProcessorPolicy {
            default_status: vars
                .get("DEFAULT_STATUS")
                .map_or_else(PurchaseStatus::finished, PurchaseStatus::new),
            malformed: vars.parse("MALFORMED_POLICY", MalformedPolicy::default())?,
            missing_purchase: vars.parse("MISSING_PURCHASE_POLICY", MissingPurchasePolicy::default())?,
        };
        if processor.malformed == MalformedPolicy::RequeueOnce
            && consumer.queue.dead_letter_exchange.is_none()
        {
            return Err(ConfigError::Invalid {
                var: "MALFORMED_POLICY",
                reason: "'requeue-once' drops redeliveries and needs AMQP_DEAD_LETTER_EXCHANGE"
                    .to_string(),
            });
        }

        let metrics_addr = vars
            .get("METRICS_ADDR")
            .map(|addr| parse_value("METRICS_ADDR", &addr))
            .transpose()?;

        Ok(Self {
            amqp,
            reconnect,
            topology,
            consumer,
            mongo,
            consumer_loop,
            processor,
            metrics_addr,
        })
    }

    fn mongo<F>(vars: &Vars<F>) -> Result<MongoConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = MongoConfig::builder()
            .credentials(
                vars.get("MONGO_USR").unwrap_or_default(),
                vars.get("MONGO_PWD").unwrap_or_default(),
            )
            .max_pool_size(vars.parse("MONGO_MAX_POOL_SIZE", 10)?)
            .connect_timeout(Duration::from_secs(vars.parse("MONGO_CONNECT_TIMEOUT_SECS", 10)?));

        // Set TLS only when asked so a MONGO_URI keeps its own tls options.
        if vars.get("MONGO_TLS").is_some() {
            builder = builder.tls(vars.flag("MONGO_TLS", true)?);
        }
        if vars.get("MONGO_TLS_ALLOW_INVALID_CERTIFICATES").is_some() {
            builder = builder.tls_allow_invalid_certificates(
                vars.flag("MONGO_TLS_ALLOW_INVALID_CERTIFICATES", false)?,
            );
        }
        if let Some(uri) = vars.get("MONGO_URI") {
            builder = builder.uri(uri);
        }
        if let Some(hosts) = vars.get("MONGO_HOSTS") {
            builder = builder.hosts(hosts.split(',').map(str::to_string));
        }
        if let Some(replica_set) = vars.get("MONGO_REPLICA_SET") {
            builder = builder.replica_set(replica_set);
        }
        if let Some(source) = vars.get("MONGO_AUTH_SOURCE") {
            builder = builder.auth_source(source);
        }
        if let Some(database) = vars.get("MONGO_DATABASE") {
            builder = builder.database(database);
        }
        if let Some(collection) = vars.get("MONGO_COLLECTION") {
            builder = builder.collection(collection);
        }
        if let Some(ca_file) = vars.get("MONGO_TLS_CA_FILE") {
            builder = builder.tls_ca_file(ca_file);
        }

        builder.build().map_err(|e| ConfigError::Invalid {
            var: "MONGO_HOSTS",
            reason: e.to_string(),
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(var)
            .map_or(Ok(default), |value| parse_value(var, &value))
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(var).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(default),
            Some("true" | "1" | "yes" | "on") => Ok(true),
            Some("false" | "0" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::Invalid {
                var,
                reason: format!("'{other}' is not a boolean"),
            }),
        }
    }
}

fn parse_value<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })
}
