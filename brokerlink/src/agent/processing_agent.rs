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

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::config::{AgentConfig, ConfigError, QueueConfig};
use super::plugin::PluginRegistry;
use super::worker::{ProcessorStats, ProcessorWorker, WorkerHandle};
use crate::common::{host_pid_token, SETTINGS};
use crate::proxy::{ListenerProxy, ProxyContext, SenderProxy};
use crate::traits::{ManagedProxy, ProcessorPlugin};

/// Hook run after setup and before any proxy connects.
pub type InitializeHook =
    Box<dyn FnOnce(ProxySet) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Listener and sender proxies keyed by queue name.
#[derive(Debug, Clone, Default)]
pub struct ProxySet {
    /// Listener proxies.
    pub listeners: BTreeMap<String, Arc<ListenerProxy>>,
    /// Sender proxies.
    pub senders: BTreeMap<String, Arc<SenderProxy>>,
}

impl ProxySet {
    fn managed(&self) -> Vec<Arc<dyn ManagedProxy>> {
        let listeners = self
            .listeners
            .values()
            .map(|l| Arc::clone(l) as Arc<dyn ManagedProxy>);
        let senders = self
            .senders
            .values()
            .map(|s| Arc::clone(s) as Arc<dyn ManagedProxy>);
        listeners.chain(senders).collect()
    }

    /// Connects every proxy. Failures are logged and left to the guard.
    pub async fn go(&self) {
        for proxy in self.managed() {
            match proxy.go().await {
                Ok(()) => debug!("spawned proxy for {}", proxy.name()),
                Err(e) => warn!("proxy for {} did not start ; {}", proxy.name(), e),
            }
        }
    }

    /// One guard pass: restarts every proxy with an unexpected disconnect.
    ///
    /// Returns how many restarts were attempted.
    pub async fn guard(&self) -> usize {
        let threshold = SETTINGS.agent.restart_warn_threshold;
        let mut restarted = 0;
        for proxy in self.managed() {
            if !proxy.needs_restart() {
                continue;
            }
            info!("found {} disconnected unexpectedly; restarting", proxy.name());
            restarted += 1;
            if let Err(e) = proxy.restart().await {
                error!("restart of {} failed ; {}", proxy.name(), e);
            }
            let restarts = proxy.restart_count();
            if restarts > threshold {
                warn!(
                    "{} has been restarted {} times; check the broker",
                    proxy.name(),
                    restarts
                );
            }
        }
        restarted
    }

    /// Stops senders, then listeners.
    pub async fn stop(&self) {
        for sender in self.senders.values() {
            sender.stop().await;
        }
        for listener in self.listeners.values() {
            listener.stop().await;
        }
    }
}

/// A processor after setup: its plugin and proxy references.
struct ProcessorBinding {
    name: String,
    plugin: Box<dyn ProcessorPlugin>,
    in_queue: Option<String>,
    listener: Option<Arc<ListenerProxy>>,
    sender: Option<Arc<SenderProxy>>,
    verbose: bool,
}

struct AgentSetup {
    proxies: ProxySet,
    processors: Vec<ProcessorBinding>,
}

/// Builds proxies and processor workers from an agent document and keeps
/// them running.
///
/// Life cycle: [`new`](Self::new) stores the inputs, [`setup`](Self::setup)
/// validates the document and builds one listener per distinct input queue
/// and one sender per distinct output queue, [`start`](Self::start) connects
/// everything and spawns the workers and the guard loop. Processors sharing an
/// output queue share one sender.
///
/// # Example
///
/// ```rust,ignore
/// let agent = ProcessingAgent::from_path("agent.json", plugins, context)?;
/// let handle = agent.start().await?;
/// // ...
/// handle.shutdown().await?;
/// ```
pub struct ProcessingAgent {
    config: AgentConfig,
    plugins: PluginRegistry,
    context: ProxyContext,
    token: String,
    setup: Option<AgentSetup>,
    initialize_hook: Option<InitializeHook>,
}

impl std::fmt::Debug for ProcessingAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingAgent")
            .field("token", &self.token)
            .field("processors", &self.config.processors.keys())
            .field("set_up", &self.setup.is_some())
            .finish_non_exhaustive()
    }
}

impl ProcessingAgent {
    /// Creates an agent. Nothing is validated or connected yet.
    pub fn new(config: AgentConfig, plugins: PluginRegistry, context: ProxyContext) -> Self {
        Self {
            config,
            plugins,
            context,
            token: host_pid_token(),
            setup: None,
            initialize_hook: None,
        }
    }

    /// Creates an agent from a document on disk.
    ///
    /// # Errors
    ///
    /// I/O and parse errors.
    pub fn from_path(
        path: impl AsRef<Path>,
        plugins: PluginRegistry,
        context: ProxyContext,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(AgentConfig::from_path(path)?, plugins, context))
    }

    /// Registers a hook run by [`start`](Self::start) after setup and before
    /// any proxy connects.
    #[must_use]
    pub fn with_initialize_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(ProxySet) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.initialize_hook = Some(Box::new(
            move |proxies| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(hook(proxies)) },
        ));
        self
    }

    /// The agent document.
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// `{hostname}_{pid}`, used as the agent's log field.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Validates the document and builds plugins and proxies.
    ///
    /// Calling it again is a no-op. On error nothing is kept.
    ///
    /// # Errors
    ///
    /// Broken references, unknown or failing plugins, unsupported worker
    /// strategies and proxies that cannot be built.
    #[instrument(skip(self), fields(agent = %self.token))]
    pub async fn setup(&mut self) -> Result<(), ConfigError> {
        if self.setup.is_some() {
            return Ok(());
        }
        debug!("start");
        self.config.validate(&self.plugins)?;

        let mut in_queues = BTreeSet::new();
        let mut out_queues = BTreeSet::new();
        let mut plugins = Vec::new();
        for (name, processor) in self.config.enabled_processors() {
            in_queues.extend(processor.in_queue.clone());
            out_queues.extend(processor.out_queue.clone());
            plugins.push((name.clone(), self.plugins.create(name, processor)?));
        }

        let mut proxies = ProxySet::default();
        for queue in in_queues {
            let listener = self.build_listener(&queue, None).await?;
            proxies.listeners.insert(queue, Arc::new(listener));
        }
        for queue in out_queues {
            let sender = self.build_sender(&queue).await?;
            proxies.senders.insert(queue, Arc::new(sender));
        }

        let processors = plugins
            .into_iter()
            .filter_map(|(name, plugin)| {
                let conf = self.config.processors.get(&name)?;
                Some(ProcessorBinding {
                    plugin,
                    in_queue: conf.in_queue.clone(),
                    listener: conf
                        .in_queue
                        .as_ref()
                        .and_then(|q| proxies.listeners.get(q).cloned()),
                    sender: conf
                        .out_queue
                        .as_ref()
                        .and_then(|q| proxies.senders.get(q).cloned()),
                    verbose: conf.verbose,
                    name,
                })
            })
            .collect::<Vec<_>>();

        info!(
            processors = processors.len(),
            listeners = proxies.listeners.len(),
            senders = proxies.senders.len(),
            "set up"
        );
        self.setup = Some(AgentSetup {
            proxies,
            processors,
        });
        Ok(())
    }

    async fn build_listener(
        &self,
        queue: &str,
        prefetch_size: Option<u32>,
    ) -> Result<ListenerProxy, ConfigError> {
        let conf = self.queue(queue)?;
        let server = self.config.server_of(conf)?;
        let options = self.config.listener_options(conf, prefetch_size)?;
        ListenerProxy::new(
            queue,
            &conf.destination,
            &server.host_port_list,
            options,
            &self.context,
        )
        .await
        .map_err(|source| ConfigError::Proxy {
            queue: queue.to_string(),
            source,
        })
    }

    async fn build_sender(&self, queue: &str) -> Result<SenderProxy, ConfigError> {
        let conf = self.queue(queue)?;
        let server = self.config.server_of(conf)?;
        let options = self.config.sender_options(conf)?;
        SenderProxy::new(
            queue,
            &conf.destination,
            &server.host_port_list,
            options,
            &self.context,
        )
        .await
        .map_err(|source| ConfigError::Proxy {
            queue: queue.to_string(),
            source,
        })
    }

    fn queue(&self, queue: &str) -> Result<&QueueConfig, ConfigError> {
        self.config
            .queues
            .get(queue)
            .ok_or_else(|| ConfigError::QueueNotFound(queue.to_string()))
    }

    /// Proxies built by [`setup`](Self::setup).
    pub fn proxies(&self) -> Option<&ProxySet> {
        self.setup.as_ref().map(|s| &s.proxies)
    }

    /// Listener proxy of an input queue.
    pub fn listener(&self, queue: &str) -> Option<Arc<ListenerProxy>> {
        self.proxies()?.listeners.get(queue).cloned()
    }

    /// Sender proxy of an output queue.
    pub fn sender(&self, queue: &str) -> Option<Arc<SenderProxy>> {
        self.proxies()?.senders.get(queue).cloned()
    }

    /// Sender a processor publishes its results through.
    pub fn processor_sender(&self, processor: &str) -> Option<Arc<SenderProxy>> {
        self.binding(processor)?.sender.clone()
    }

    /// Listener feeding a processor.
    pub fn processor_listener(&self, processor: &str) -> Option<Arc<ListenerProxy>> {
        self.binding(processor)?.listener.clone()
    }

    fn binding(&self, processor: &str) -> Option<&ProcessorBinding> {
        self.setup
            .as_ref()?
            .processors
            .iter()
            .find(|b| b.name == processor)
    }

    /// Sets up (if needed), runs the initialize hook, connects every proxy and
    /// spawns the workers and the guard loop.
    ///
    /// # Errors
    ///
    /// Setup errors and initialize hook errors. Connection failures are not
    /// errors here; the guard repairs them.
    #[instrument(skip(self), fields(agent = %self.token))]
    pub async fn start(mut self) -> anyhow::Result<AgentHandle> {
        self.setup().await?;
        let Some(setup) = self.setup.take() else {
            anyhow::bail!("agent {} has no setup", self.token);
        };
        if let Some(hook) = self.initialize_hook.take() {
            hook(setup.proxies.clone()).await?;
            debug!("initialize hook done");
        }

        setup.proxies.go().await;

        let sleep = SETTINGS.process_sleep();
        let workers: Vec<WorkerHandle> = setup
            .processors
            .into_iter()
            .map(|binding| {
                let buffer = binding
                    .in_queue
                    .as_deref()
                    .map(|q| self.context.buffers.get_or_create(q));
                debug!("spawned processor {}", binding.name);
                ProcessorWorker {
                    name: binding.name,
                    plugin: binding.plugin,
                    buffer,
                    sender: binding.sender,
                    verbose: binding.verbose,
                    sleep,
                }
                .spawn()
            })
            .collect();

        let main_token = CancellationToken::new();
        let main_loop = tokio::spawn(main_loop(
            setup.proxies.clone(),
            self.config.guard_period(),
            main_token.clone(),
        ));
        info!(workers = workers.len(), "started");
        Ok(AgentHandle {
            token: self.token,
            main_token,
            main_loop,
            workers,
            proxies: setup.proxies,
        })
    }

    /// Builds and connects proxies for the selected queues, without workers
    /// or guard.
    ///
    /// `None` selects every queue. Disabled queues are skipped. Listeners get
    /// `prefetch_size` (default from the runtime settings) unless the queue
    /// sets its own.
    ///
    /// # Errors
    ///
    /// Unknown queue names and proxies that cannot be built.
    #[instrument(skip(self), fields(agent = %self.token))]
    pub async fn start_passive_mode(
        &self,
        in_queues: Option<Vec<String>>,
        out_queues: Option<Vec<String>>,
        prefetch_size: Option<u32>,
    ) -> Result<ProxySet, ConfigError> {
        let all_queues = || self.config.queues.keys().cloned().collect::<Vec<_>>();
        let prefetch_size = prefetch_size.unwrap_or(SETTINGS.proxy.default_prefetch);

        let mut proxies = ProxySet::default();
        for queue in in_queues.unwrap_or_else(all_queues) {
            if !self.queue(&queue)?.enable {
                continue;
            }
            let listener = self.build_listener(&queue, Some(prefetch_size)).await?;
            proxies.listeners.insert(queue, Arc::new(listener));
        }
        for queue in out_queues.unwrap_or_else(all_queues) {
            if !self.queue(&queue)?.enable {
                continue;
            }
            let sender = self.build_sender(&queue).await?;
            proxies.senders.insert(queue, Arc::new(sender));
        }
        proxies.go().await;
        debug!("done");
        Ok(proxies)
    }
}

async fn main_loop(proxies: ProxySet, guard_period: Duration, token: CancellationToken) {
    let mut tick = tokio::time::interval(SETTINGS.main_loop_tick());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_guard: Option<Instant> = None;
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = tick.tick() => {
                if last_guard.map_or(true, |t| t.elapsed() >= guard_period) {
                    trace!("guard pass");
                    proxies.guard().await;
                    last_guard = Some(Instant::now());
                }
            }
        }
    }
    debug!("main loop halted");
}

/// A started agent.
pub struct AgentHandle {
    token: String,
    main_token: CancellationToken,
    main_loop: JoinHandle<()>,
    workers: Vec<WorkerHandle>,
    proxies: ProxySet,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("token", &self.token)
            .field("processors", &self.processor_names())
            .field("proxies", &self.proxies)
            .finish_non_exhaustive()
    }
}

impl AgentHandle {
    /// Running proxies.
    pub const fn proxies(&self) -> &ProxySet {
        &self.proxies
    }

    /// Names of the running processors.
    pub fn processor_names(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.name.clone()).collect()
    }

    /// Counters of one processor.
    pub fn processor_stats(&self, processor: &str) -> Option<Arc<ProcessorStats>> {
        self.workers
            .iter()
            .find(|w| w.name == processor)
            .map(|w| Arc::clone(&w.stats))
    }

    /// Runs a guard pass now, outside the periodic schedule.
    pub async fn guard_now(&self) -> usize {
        self.proxies.guard().await
    }

    /// Halts the main loop, stops every worker, then senders, then listeners.
    ///
    /// Each worker finishes its current iteration; shutdown waits for it
    /// however long the plugin takes and warns periodically while it does.
    ///
    /// # Errors
    ///
    /// Returned after the full sequence when a worker task ended abnormally.
    #[instrument(skip(self), fields(agent = %self.token))]
    pub async fn shutdown(self) -> anyhow::Result<()> {
        debug!("tearing down");
        self.main_token.cancel();
        if let Err(e) = self.main_loop.await {
            error!("main loop ended abnormally: {}", e);
        }

        let warn_every = SETTINGS.processor_stop_warning();
        let mut failed = Vec::new();
        for mut worker in self.workers {
            worker.token.cancel();
            let joined = loop {
                match timeout(warn_every, &mut worker.handle).await {
                    Ok(joined) => break joined,
                    Err(_) => warn!(
                        "processor {} still finishing its iteration after {:?}",
                        worker.name, warn_every
                    ),
                }
            };
            match joined {
                Ok(()) => trace!("processor {} stopped", worker.name),
                Err(e) => {
                    error!("processor {} ended abnormally: {}", worker.name, e);
                    failed.push(worker.name);
                }
            }
        }

        self.proxies.stop().await;
        info!("shut down");
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "processors did not stop cleanly: {}",
                failed.join(", ")
            ))
        }
    }
}
