/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! The agent document: broker servers, queues and processors, in JSON.
//!
//! ```json
//! {
//!   "mb_servers": { "mb1": { "host_port_list": ["broker.example.org:61613"] } },
//!   "queues": {
//!     "jobs": { "server": "mb1", "destination": "/queue/jobs" },
//!     "done": { "server": "mb1", "destination": "/queue/done" }
//!   },
//!   "processors": {
//!     "worker": { "module": "demo", "name": "Echo", "in_queue": "jobs", "out_queue": "done" }
//!   },
//!   "guard_period": 60
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use super::plugin::PluginRegistry;
use super::worker::WorkerStrategy;
use crate::common::{AckMode, ConnectionMode, Credentials, TlsOptions, SETTINGS};
use crate::message::RedeliveryPolicy;
use crate::proxy::{ListenerOptions, ProxyError, SenderOptions};

/// Parsed agent document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Broker servers by name.
    pub mb_servers: BTreeMap<String, ServerConfig>,
    /// Queues by name.
    #[serde(default)]
    pub queues: BTreeMap<String, QueueConfig>,
    /// Processors by name.
    #[serde(default)]
    pub processors: BTreeMap<String, ProcessorConfig>,
    /// Seconds between guard passes.
    #[serde(default)]
    pub guard_period: Option<u64>,
    /// Redelivery policy for every listener; falls back to the runtime settings.
    #[serde(default)]
    pub redelivery: Option<RedeliveryPolicy>,
}

/// One broker server.
#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    /// `host:port` entries; each host may resolve to several brokers.
    pub host_port_list: Vec<String>,
    /// Wrap connections in TLS. Accepts booleans or 0/1.
    #[serde(default, deserialize_with = "lenient_bool")]
    pub use_ssl: bool,
    /// Client certificate.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// Client key.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Broker login.
    #[serde(default)]
    pub username: Option<String>,
    /// Broker passcode.
    #[serde(default)]
    pub passcode: Option<String>,
    /// Virtual host.
    #[serde(default)]
    pub vhost: Option<String>,
    /// Per-message logging on proxies of this server.
    #[serde(default)]
    pub verbose: bool,
}

impl ServerConfig {
    /// TLS material.
    pub fn tls(&self) -> TlsOptions {
        TlsOptions {
            use_ssl: self.use_ssl,
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
        }
    }

    /// Login material.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            passcode: self.passcode.clone(),
            vhost: self.vhost.clone(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host_port_list", &self.host_port_list)
            .field("use_ssl", &self.use_ssl)
            .field("credentials", &self.credentials())
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrInt {
        Bool(bool),
        Int(i64),
    }
    Ok(match BoolOrInt::deserialize(deserializer)? {
        BoolOrInt::Bool(b) => b,
        BoolOrInt::Int(i) => i != 0,
    })
}

const fn enabled() -> bool {
    true
}

/// One queue on a server.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Key into `mb_servers`.
    pub server: String,
    /// Broker destination.
    pub destination: String,
    /// Disabled queues get no proxy.
    #[serde(default = "enabled")]
    pub enable: bool,
    /// Acknowledgement mode override.
    #[serde(default)]
    pub ack_mode: Option<AckMode>,
    /// Connection mode override.
    #[serde(default)]
    pub conn_mode: Option<ConnectionMode>,
    /// Prefetch limit override.
    #[serde(default)]
    pub prefetch_size: Option<u32>,
    /// Transaction override.
    #[serde(default)]
    pub use_transaction: Option<bool>,
}

/// One processor: a plugin bound to an input and an output queue.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Plugin module; with `name` forms the registry key.
    pub module: String,
    /// Plugin name within the module.
    pub name: String,
    /// Queue to consume.
    #[serde(default)]
    pub in_queue: Option<String>,
    /// Queue results are published to.
    #[serde(default)]
    pub out_queue: Option<String>,
    /// Disabled processors are skipped.
    #[serde(default = "enabled")]
    pub enable: bool,
    /// Per-message logging in the worker.
    #[serde(default)]
    pub verbose: bool,
    /// Worker strategy.
    #[serde(default)]
    pub strategy: WorkerStrategy,
    /// Remaining keys, handed to the plugin constructor.
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ProcessorConfig {
    /// Registry key, `module.name`.
    pub fn plugin_key(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

impl AgentConfig {
    /// Reads and parses a document from disk.
    ///
    /// # Errors
    ///
    /// I/O and JSON errors.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parses a document.
    ///
    /// # Errors
    ///
    /// JSON errors.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Guard period, falling back to the runtime settings.
    pub fn guard_period(&self) -> Duration {
        self.guard_period
            .map_or_else(|| SETTINGS.guard_period(), Duration::from_secs)
    }

    /// Redelivery policy, falling back to the runtime settings.
    pub fn redelivery(&self) -> RedeliveryPolicy {
        self.redelivery
            .clone()
            .unwrap_or_else(|| SETTINGS.redelivery.clone())
    }

    /// Enabled processors, in name order.
    pub fn enabled_processors(&self) -> impl Iterator<Item = (&String, &ProcessorConfig)> {
        self.processors.iter().filter(|(_, p)| p.enable)
    }

    /// Checks every reference an enabled queue or processor makes.
    ///
    /// # Errors
    ///
    /// The first broken reference, in processor name order.
    pub fn validate(&self, plugins: &PluginRegistry) -> Result<(), ConfigError> {
        for (name, queue) in self.queues.iter().filter(|(_, q)| q.enable) {
            let server = self
                .mb_servers
                .get(&queue.server)
                .ok_or_else(|| ConfigError::UnknownServer {
                    queue: name.clone(),
                    server: queue.server.clone(),
                })?;
            if server.host_port_list.is_empty() {
                return Err(ConfigError::EmptyServer(queue.server.clone()));
            }
        }
        for (name, processor) in self.enabled_processors() {
            for queue in [&processor.in_queue, &processor.out_queue].into_iter().flatten() {
                self.enabled_queue(name, queue)?;
            }
            if processor.strategy != WorkerStrategy::Simple {
                return Err(ConfigError::UnsupportedStrategy {
                    processor: name.clone(),
                    strategy: processor.strategy,
                });
            }
            if !plugins.contains(&processor.plugin_key()) {
                return Err(ConfigError::UnknownPlugin {
                    processor: name.clone(),
                    key: processor.plugin_key(),
                });
            }
        }
        Ok(())
    }

    fn enabled_queue(&self, processor: &str, queue: &str) -> Result<&QueueConfig, ConfigError> {
        let conf = self
            .queues
            .get(queue)
            .ok_or_else(|| ConfigError::UnknownQueue {
                processor: processor.to_string(),
                queue: queue.to_string(),
            })?;
        if !conf.enable {
            return Err(ConfigError::DisabledQueue {
                processor: processor.to_string(),
                queue: queue.to_string(),
            });
        }
        Ok(conf)
    }

    /// Server of a queue. Only valid after [`validate`](Self::validate).
    pub(crate) fn server_of(&self, queue: &QueueConfig) -> Result<&ServerConfig, ConfigError> {
        self.mb_servers
            .get(&queue.server)
            .ok_or_else(|| ConfigError::UnknownServer {
                queue: queue.destination.clone(),
                server: queue.server.clone(),
            })
    }

    /// Listener options for a queue: server material plus queue overrides.
    pub(crate) fn listener_options(
        &self,
        queue: &QueueConfig,
        prefetch_size: Option<u32>,
    ) -> Result<ListenerOptions, ConfigError> {
        let server = self.server_of(queue)?;
        let mut options = ListenerOptions::default()
            .with_tls(server.tls())
            .with_credentials(server.credentials())
            .with_verbose(server.verbose)
            .with_redelivery(self.redelivery())
            .with_prefetch(queue.prefetch_size.or(prefetch_size));
        if let Some(ack_mode) = queue.ack_mode {
            options = options.with_ack_mode(ack_mode);
        }
        if let Some(conn_mode) = queue.conn_mode {
            options = options.with_conn_mode(conn_mode);
        }
        if let Some(use_transaction) = queue.use_transaction {
            options = options.with_transaction(use_transaction);
        }
        Ok(options)
    }

    /// Sender options for a queue.
    pub(crate) fn sender_options(&self, queue: &QueueConfig) -> Result<SenderOptions, ConfigError> {
        let server = self.server_of(queue)?;
        Ok(SenderOptions::default()
            .with_tls(server.tls())
            .with_credentials(server.credentials())
            .with_verbose(server.verbose))
    }
}

/// Errors found while loading or setting up an agent.
#[derive(Debug)]
pub enum ConfigError {
    /// The document could not be read.
    Io {
        /// Document path.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },
    /// The document is not valid JSON or does not match the schema.
    Parse(serde_json::Error),
    /// A processor names a queue missing from `queues`.
    UnknownQueue {
        /// Processor name.
        processor: String,
        /// Queue name.
        queue: String,
    },
    /// A queue selected by name, outside any processor, is missing from `queues`.
    QueueNotFound(String),
    /// A processor names a disabled queue.
    DisabledQueue {
        /// Processor name.
        processor: String,
        /// Queue name.
        queue: String,
    },
    /// A queue names a server missing from `mb_servers`.
    UnknownServer {
        /// Queue name.
        queue: String,
        /// Server name.
        server: String,
    },
    /// A server has no `host_port_list` entries.
    EmptyServer(String),
    /// No plugin is registered under the processor's key.
    UnknownPlugin {
        /// Processor name.
        processor: String,
        /// `module.name`.
        key: String,
    },
    /// The plugin constructor failed.
    PluginConstruction {
        /// Processor name.
        processor: String,
        /// Constructor error.
        source: anyhow::Error,
    },
    /// The processor asks for a worker strategy that is not available.
    UnsupportedStrategy {
        /// Processor name.
        processor: String,
        /// Requested strategy.
        strategy: WorkerStrategy,
    },
    /// A proxy could not be built.
    Proxy {
        /// Queue name.
        queue: String,
        /// Underlying failure.
        source: ProxyError,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read {}: {source}", path.display()),
            Self::Parse(e) => write!(f, "invalid agent document: {e}"),
            Self::UnknownQueue { processor, queue } => {
                write!(f, "processor {processor} refers to unknown queue {queue}")
            }
            Self::QueueNotFound(queue) => write!(f, "unknown queue {queue}"),
            Self::DisabledQueue { processor, queue } => {
                write!(f, "processor {processor} refers to disabled queue {queue}")
            }
            Self::UnknownServer { queue, server } => {
                write!(f, "queue {queue} refers to unknown server {server}")
            }
            Self::EmptyServer(server) => write!(f, "server {server} has no host_port_list"),
            Self::UnknownPlugin { processor, key } => {
                write!(f, "no plugin registered as {key} (processor {processor})")
            }
            Self::PluginConstruction { processor, source } => {
                write!(f, "plugin for processor {processor} failed to build: {source:#}")
            }
            Self::UnsupportedStrategy {
                processor,
                strategy,
            } => write!(f, "processor {processor}: worker strategy {strategy} is not supported"),
            Self::Proxy { queue, source } => write!(f, "proxy for queue {queue}: {source}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(e) => Some(e),
            Self::PluginConstruction { source, .. } => Some(source.as_ref()),
            Self::Proxy { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "mb_servers": {
            "mb1": {
                "host_port_list": ["broker.example.org:61613"],
                "use_ssl": 0,
                "username": "admin",
                "passcode": "secret"
            }
        },
        "queues": {
            "jobs": { "server": "mb1", "destination": "/queue/jobs", "prefetch_size": 5 },
            "done": { "server": "mb1", "destination": "/queue/done", "ack_mode": "auto" },
            "off": { "server": "mb1", "destination": "/queue/off", "enable": false }
        },
        "processors": {
            "echo": {
                "module": "demo", "name": "Echo",
                "in_queue": "jobs", "out_queue": "done",
                "threshold": 3
            }
        }
    }"#;

    #[test]
    fn parses_document_with_defaults() {
        let config = AgentConfig::from_json(DOC).unwrap();
        assert_eq!(config.guard_period(), Duration::from_secs(300));
        let server = &config.mb_servers["mb1"];
        assert!(!server.use_ssl);
        assert!(!format!("{server:?}").contains("secret"));

        let processor = &config.processors["echo"];
        assert!(processor.enable);
        assert_eq!(processor.strategy, WorkerStrategy::Simple);
        assert_eq!(processor.plugin_key(), "demo.Echo");
        assert_eq!(processor.params["threshold"], 3);
        assert!(!config.queues["off"].enable);
    }

    #[test]
    fn queue_overrides_reach_listener_options() {
        let config = AgentConfig::from_json(DOC).unwrap();
        let jobs = config
            .listener_options(&config.queues["jobs"], Some(100))
            .unwrap();
        assert_eq!(jobs.prefetch_size, Some(5));
        assert_eq!(jobs.ack_mode, AckMode::ClientIndividual);
        assert_eq!(jobs.credentials.username.as_deref(), Some("admin"));

        let done = config.listener_options(&config.queues["done"], None).unwrap();
        assert_eq!(done.ack_mode, AckMode::Auto);
        assert_eq!(done.prefetch_size, None);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = AgentConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
