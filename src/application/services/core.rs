//! Core - owns loaded plugins and moves messages between them and the transport

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::application::errors::BotError;
use crate::application::messaging::Reply;
use crate::domain::entities::{Incoming, Outgoing};
use crate::domain::traits::Transport;
use crate::infrastructure::config::{Config, CoreConfig};
use crate::infrastructure::plugins::{LoadReport, PluginLoader};
use crate::plugins::trait_def::Plugin;
use super::scheduler::PollScheduler;

/// The plugin host.
///
/// Incoming messages are routed to every plugin subscribed to one of the
/// message's channels, in load order. Outgoing messages are queued on an
/// unbounded outbox drained by [`Core::run`].
pub struct Core {
    name: String,
    tick: Duration,
    loader: PluginLoader,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    scheduler: Arc<PollScheduler>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    shutdown: watch::Sender<bool>,
}

impl Core {
    /// Create an empty core. The receiver yields everything plugins send.
    pub fn new(settings: &CoreConfig, loader: PluginLoader) -> (Arc<Self>, mpsc::UnboundedReceiver<Outgoing>) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let core = Arc::new(Self {
            name: settings.name.clone(),
            tick: Duration::from_millis(settings.poll_tick_ms.max(1)),
            loader,
            plugins: RwLock::new(Vec::new()),
            scheduler: Arc::new(PollScheduler::new()),
            outbox,
            shutdown,
        });
        (core, outbox_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn scheduler(&self) -> &Arc<PollScheduler> {
        &self.scheduler
    }

    /// Snapshot of loaded plugins, in load order
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Load every plugin described by `config`
    pub fn load(self: &Arc<Self>, config: &Config) -> LoadReport {
        let report = self.loader.load_all(Arc::downgrade(self), config);
        for plugin in &report.loaded {
            self.add_plugin(Arc::clone(plugin));
        }
        tracing::info!(
            "{} plugins loaded, {} failed",
            report.loaded.len(),
            report.failed.len()
        );
        report
    }

    /// Take ownership of an already-built plugin
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        let slot_name = format!("{}#{}", plugin.name(), plugins.len());
        if let Some(poller) = Arc::clone(&plugin).poller() {
            self.scheduler.register(slot_name, poller, Instant::now());
        }
        plugins.push(plugin);
    }

    /// Route a single-channel message from the transport
    pub fn route_incoming(&self, channel: &str, text: &str, author: &str, directed: bool) -> usize {
        self.route(&Incoming::new(channel, text, author, directed))
    }

    /// Hand a message to every subscribed plugin. Returns how many received it.
    ///
    /// Each plugin's errors and panics are contained; later plugins still see
    /// the message.
    pub fn route(&self, incoming: &Incoming) -> usize {
        if self.is_stopped() {
            tracing::debug!("[{}] Core stopped, dropping message", incoming.origin());
            return 0;
        }

        let reply = Reply::new(incoming.origin(), self.outbox.clone());
        let mut delivered = 0;

        for plugin in self.plugins() {
            if !incoming.channels.iter().any(|c| plugin.agent().is_subscribed(c)) {
                continue;
            }
            delivered += 1;

            let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.handle_incoming(incoming, &reply)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("[{}] Plugin {} failed: {}", incoming.origin(), plugin.name(), e);
                }
                Err(_) => {
                    tracing::error!("[{}] Plugin {} panicked", incoming.origin(), plugin.name());
                }
            }
        }

        delivered
    }

    /// Queue text for the transport. Fire-and-forget.
    pub fn send_outgoing(&self, channel: &str, text: &str) {
        if self.outbox.send(Outgoing::new(channel, text)).is_err() {
            tracing::warn!("[{}] Outbox closed, message dropped", channel);
        }
    }

    /// Save every persistent plugin. Returns the number of failures.
    pub fn flush(&self) -> usize {
        let mut failures = 0;
        for plugin in self.plugins() {
            if let Some(store) = plugin.persistence() {
                if let Err(e) = store.save_data() {
                    tracing::error!("Failed to save state for {}: {}", plugin.name(), e);
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Flush, unsubscribe and drop every plugin along with its poll task
    pub fn unload_all(&self) {
        self.flush();
        self.scheduler.clear();
        let plugins = std::mem::take(&mut *self.plugins.write().unwrap_or_else(PoisonError::into_inner));
        for plugin in &plugins {
            plugin.agent().unsubscribe_all();
        }
        tracing::info!("Unloaded {} plugins", plugins.len());
    }

    /// Replace all plugins with those described by `config`
    pub fn reload(self: &Arc<Self>, config: &Config) -> LoadReport {
        self.unload_all();
        self.load(config)
    }

    /// Stop scheduling and routing. In-flight calls complete normally.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drive the transport, router and scheduler until [`stop`](Self::stop).
    ///
    /// On the way out every persistent plugin is flushed, queued outgoing
    /// messages are delivered and the transport is disconnected.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    ) -> Result<(), BotError> {
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<Incoming>();
        transport.start(inbound_tx).await?;
        tracing::info!(
            "{} running on {} with {} plugins",
            self.name,
            transport.name(),
            self.plugins().len()
        );

        let scheduler = tokio::spawn(Arc::clone(&self.scheduler).run(self.tick, self.shutdown.subscribe()));

        let forwarder = {
            let transport = Arc::clone(&transport);
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        out = outbox.recv() => match out {
                            Some(out) => deliver(transport.as_ref(), out).await,
                            None => break,
                        },
                        _ = stopped(&mut shutdown) => {
                            while let Ok(out) = outbox.try_recv() {
                                deliver(transport.as_ref(), out).await;
                            }
                            break;
                        }
                    }
                }
            })
        };

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(incoming) => {
                        let core = Arc::clone(&self);
                        if let Err(e) = tokio::task::spawn_blocking(move || core.route(&incoming)).await {
                            tracing::error!("Routing task failed: {}", e);
                        }
                    }
                    None => {
                        tracing::info!("Transport {} closed its inbound stream", transport.name());
                        break;
                    }
                },
                _ = stopped(&mut shutdown) => break,
            }
        }

        tracing::info!("Shutting down {}", self.name);
        self.stop();
        if let Err(e) = scheduler.await {
            tracing::error!("Scheduler task failed: {}", e);
        }
        let failures = self.flush();
        if failures > 0 {
            tracing::warn!("{} plugins failed to save state", failures);
        }
        if let Err(e) = forwarder.await {
            tracing::error!("Outgoing forwarder failed: {}", e);
        }
        transport.disconnect().await
    }
}

/// Resolves once the shutdown flag is set
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

async fn deliver(transport: &dyn Transport, out: Outgoing) {
    if let Err(e) = transport.send_message(&out.channel, &out.text).await {
        tracing::warn!("[{}] Failed to send: {}", out.channel, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::errors::{ConfigError, PluginError, StorageError};
    use crate::infrastructure::plugins::{Keywords, PluginRegistry, PluginSpec};
    use crate::plugins::trait_def::{Agent, Persistent, PluginContext};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recorder {
        agent: Agent,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Plugin for Recorder {
        fn agent(&self) -> &Agent {
            &self.agent
        }

        fn handle_incoming(&self, incoming: &Incoming, reply: &Reply) -> Result<(), PluginError> {
            self.seen.lock().unwrap().push(incoming.text.clone());
            if self.fail {
                return Err(PluginError::Failed("recorder failure".into()));
            }
            reply.send(format!("{} saw {}", self.name(), incoming.text));
            Ok(())
        }
    }

    fn recorder(type_name: &'static str, channels: &[&str], fail: bool) -> Arc<Recorder> {
        let plugin = Arc::new(Recorder {
            agent: Agent::new(&PluginContext::detached(type_name)),
            seen: Mutex::new(Vec::new()),
            fail,
        });
        for c in channels {
            plugin.agent().subscribe(c);
        }
        plugin
    }

    fn core() -> (Arc<Core>, mpsc::UnboundedReceiver<Outgoing>) {
        Core::new(&CoreConfig::default(), PluginLoader::new(PluginRegistry::new()))
    }

    #[test]
    fn routes_only_to_subscribers_in_load_order() {
        let (core, mut rx) = core();
        let first = recorder("t.First", &["ops"], false);
        let other = recorder("t.Other", &["random"], false);
        let second = recorder("t.Second", &["ops", "random"], false);
        core.add_plugin(first.clone());
        core.add_plugin(other.clone());
        core.add_plugin(second.clone());

        assert_eq!(core.route_incoming("ops", "hello", "alice", false), 2);
        assert_eq!(*first.seen.lock().unwrap(), vec!["hello"]);
        assert!(other.seen.lock().unwrap().is_empty());

        assert_eq!(rx.try_recv().unwrap(), Outgoing::new("ops", "t.First saw hello"));
        assert_eq!(rx.try_recv().unwrap(), Outgoing::new("ops", "t.Second saw hello"));
    }

    #[test]
    fn failing_plugin_does_not_block_others() {
        let (core, mut rx) = core();
        let broken = recorder("t.Broken", &["ops"], true);
        let healthy = recorder("t.Healthy", &["ops"], false);
        core.add_plugin(broken.clone());
        core.add_plugin(healthy.clone());

        assert_eq!(core.route_incoming("ops", "ping", "bob", true), 2);
        assert_eq!(*healthy.seen.lock().unwrap(), vec!["ping"]);
        // no automatic apology from the core
        assert_eq!(rx.try_recv().unwrap().text, "t.Healthy saw ping");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn multi_channel_message_is_delivered_once() {
        let (core, _rx) = core();
        let both = recorder("t.Both", &["ops", "admin"], false);
        core.add_plugin(both.clone());

        let msg = Incoming::new("ops", "status", "carol", true).with_channel("admin");
        assert_eq!(core.route(&msg), 1);
        assert_eq!(both.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn stopped_core_drops_messages() {
        let (core, _rx) = core();
        core.add_plugin(recorder("t.Any", &["ops"], false));
        core.stop();
        assert_eq!(core.route_incoming("ops", "late", "dave", false), 0);
    }

    #[test]
    fn plugin_sends_through_core() {
        let (core, mut rx) = core();
        let agent = Agent::new(&PluginContext::new("t.Sender", Arc::downgrade(&core)));
        agent.send_outgoing("alerts", "disk full");
        assert_eq!(rx.try_recv().unwrap(), Outgoing::new("alerts", "disk full"));
    }

    /// Plugin whose saves either succeed or hit a disk error
    struct Stash {
        agent: Agent,
        broken: bool,
        saves: AtomicUsize,
    }

    impl Plugin for Stash {
        fn agent(&self) -> &Agent {
            &self.agent
        }

        fn persistence(&self) -> Option<&dyn Persistent> {
            Some(self)
        }
    }

    impl Persistent for Stash {
        fn load_data(&self) {}

        fn save_data(&self) -> Result<(), StorageError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            Ok(())
        }
    }

    fn stash(type_name: &'static str, broken: bool) -> Arc<Stash> {
        Arc::new(Stash {
            agent: Agent::new(&PluginContext::detached(type_name)),
            broken,
            saves: AtomicUsize::new(0),
        })
    }

    #[test]
    fn flush_counts_failed_saves_and_keeps_going() {
        let (core, _rx) = core();
        let broken = stash("t.Broken", true);
        let healthy = stash("t.Healthy", false);
        core.add_plugin(broken.clone());
        core.add_plugin(recorder("t.Stateless", &["ops"], false));
        core.add_plugin(healthy.clone());

        assert_eq!(core.flush(), 1);
        assert_eq!(broken.saves.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.saves.load(Ordering::SeqCst), 1);

        core.add_plugin(stash("t.AlsoBroken", true));
        assert_eq!(core.flush(), 2);
        assert_eq!(healthy.saves.load(Ordering::SeqCst), 2);
    }

    fn build_recorder(ctx: PluginContext, _kw: &Keywords) -> Result<Arc<dyn Plugin>, ConfigError> {
        Ok(Arc::new(Recorder {
            agent: Agent::new(&ctx),
            seen: Mutex::new(Vec::new()),
            fail: false,
        }))
    }

    #[test]
    fn reload_replaces_plugins() {
        let mut registry = PluginRegistry::new();
        registry
            .register(PluginSpec {
                type_name: "t.Recorder",
                summary: "",
                keywords: &[],
                factory: build_recorder,
            })
            .unwrap();
        let (core, _rx) = Core::new(&CoreConfig::default(), PluginLoader::new(registry));

        let config = Config::from_yaml("plugins:\n  - type: t.Recorder\n    channels: a\n").unwrap();
        core.load(&config);
        let old = core.plugins();
        assert_eq!(old.len(), 1);

        let next = Config::from_yaml("plugins:\n  - type: Recorder\n    channels: b\n  - type: t.Recorder\n    channels: c\n").unwrap();
        let report = core.reload(&next);
        assert_eq!(report.loaded.len(), 2);
        assert!(old[0].agent().channels().is_empty());
        assert_eq!(core.route_incoming("a", "x", "eve", false), 0);
        assert_eq!(core.route_incoming("b", "x", "eve", false), 1);
    }
}
