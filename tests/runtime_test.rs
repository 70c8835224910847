//! Runtime Integration Tests
//! Run with: cargo test --test runtime_test

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Captures;
use tokio::sync::mpsc;

use hesperus::application::errors::{BotError, ConfigError, PluginError, StorageError};
use hesperus::application::messaging::{CommandContext, CommandTable, Reply};
use hesperus::application::services::Core;
use hesperus::domain::entities::{Incoming, Outgoing};
use hesperus::domain::traits::Transport;
use hesperus::infrastructure::config::{Config, CoreConfig};
use hesperus::infrastructure::plugins::{
    KeywordKind, KeywordSpec, Keywords, PluginLoader, PluginRegistry, PluginSpec,
};
use hesperus::plugins::{Agent, Persistent, Plugin, PluginContext, PollTask, Poller};

static INIT: Once = Once::new();

fn ensure_init() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Transport fed and observed by the test
#[derive(Default)]
struct ChannelTransport {
    inbound: Mutex<Option<mpsc::UnboundedSender<Incoming>>>,
    sent: Mutex<Vec<Outgoing>>,
    disconnected: AtomicBool,
}

impl ChannelTransport {
    fn push(&self, channel: &str, text: &str, author: &str) -> bool {
        match self.inbound.lock().unwrap().as_ref() {
            Some(tx) => tx.send(Incoming::new(channel, text, author, true)).is_ok(),
            None => false,
        }
    }

    fn sent(&self) -> Vec<Outgoing> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn start(&self, inbound: mpsc::UnboundedSender<Incoming>) -> Result<(), BotError> {
        *self.inbound.lock().unwrap() = Some(inbound);
        Ok(())
    }

    async fn send_message(&self, channel: &str, text: &str) -> Result<(), BotError> {
        self.sent.lock().unwrap().push(Outgoing::new(channel, text));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BotError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}

static POLLS: AtomicUsize = AtomicUsize::new(0);
static SAVES: AtomicUsize = AtomicUsize::new(0);

/// Echo plugin with a poll task and a save hook
struct Echo {
    agent: Agent,
    prefix: String,
}

static ECHO_COMMANDS: Lazy<CommandTable<Echo>> =
    Lazy::new(|| CommandTable::new().command(r"echo\s+(.+)", Echo::echo_command));

impl Echo {
    fn echo_command(&self, ctx: &CommandContext<'_>, caps: &Captures<'_>) -> Result<(), PluginError> {
        ctx.reply.send(format!("{}{}", self.prefix, &caps[1]));
        Ok(())
    }
}

impl Plugin for Echo {
    fn agent(&self) -> &Agent {
        &self.agent
    }

    fn handle_incoming(&self, incoming: &Incoming, reply: &Reply) -> Result<(), PluginError> {
        ECHO_COMMANDS.dispatch(self, incoming, reply).map(|_| ())
    }

    fn poller(self: Arc<Self>) -> Option<Arc<dyn Poller>> {
        Some(self)
    }

    fn persistence(&self) -> Option<&dyn Persistent> {
        Some(self)
    }
}

impl Poller for Echo {
    fn poll(self: Arc<Self>) -> PollTask {
        Box::new(std::iter::once_with(|| {
            POLLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn poll_interval(&self) -> Duration {
        Duration::ZERO
    }
}

impl Persistent for Echo {
    fn load_data(&self) {}

    fn save_data(&self) -> Result<(), StorageError> {
        SAVES.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const ECHO_KEYWORDS: &[KeywordSpec] = &[KeywordSpec::optional("prefix", KeywordKind::Str)];

fn build_echo(ctx: PluginContext, keywords: &Keywords) -> Result<Arc<dyn Plugin>, ConfigError> {
    ECHO_COMMANDS.validate()?;
    Ok(Arc::new(Echo {
        agent: Agent::new(&ctx),
        prefix: keywords.str("prefix").unwrap_or_default().to_string(),
    }))
}

fn loader() -> PluginLoader {
    let mut registry = PluginRegistry::builtin();
    registry
        .register(PluginSpec {
            type_name: "test.Echo",
            summary: "echoes text back",
            keywords: ECHO_KEYWORDS,
            factory: build_echo,
        })
        .unwrap();
    PluginLoader::new(registry)
}

async fn wait_for(what: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if what() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_core_runs_routes_polls_and_shuts_down() {
    ensure_init();

    let config = Config::from_yaml(
        r#"
core:
  name: itest
  poll-tick-ms: 10
plugins:
  - type: test.Echo
    channels: ops
    prefix: "> "
  - type: plugin.Plugin
    channels: ops, random
"#,
    )
    .unwrap();

    let (core, outbox) = Core::new(&config.core, loader());
    let report = core.load(&config);
    assert_eq!(report.loaded.len(), 2);
    assert!(report.failed.is_empty());

    let transport = Arc::new(ChannelTransport::default());
    let running = tokio::spawn(Arc::clone(&core).run(transport.clone(), outbox));

    assert!(wait_for(|| transport.inbound.lock().unwrap().is_some()).await);
    assert!(transport.push("ops", "echo hello there", "alice"));
    assert!(transport.push("random", "echo nobody listens here", "bob"));
    assert!(transport.push("ops", "echo second", "alice"));

    assert!(wait_for(|| transport.sent().len() >= 2).await);
    assert!(wait_for(|| POLLS.load(Ordering::SeqCst) >= 2).await);

    core.stop();
    running.await.unwrap().unwrap();

    assert_eq!(
        transport.sent(),
        vec![Outgoing::new("ops", "> hello there"), Outgoing::new("ops", "> second")]
    );
    assert!(transport.disconnected.load(Ordering::SeqCst));
    assert!(SAVES.load(Ordering::SeqCst) >= 1);
    assert_eq!(core.route_incoming("ops", "echo late", "alice", true), 0);
}

#[test]
fn test_failed_plugins_are_never_subscribed() {
    ensure_init();

    let config = Config::from_yaml(
        r#"
plugins:
  - type: test.Echo
    channels: good
  - type: test.Echo
    channels: bad-keyword
    password: hunter2
  - type: plugins.nowhere.Missing
    channels: bad-type
  - type: Echo
    channels: short-name
"#,
    )
    .unwrap();

    let (core, mut outbox) = Core::new(&CoreConfig::default(), loader());
    let report = core.load(&config);

    assert_eq!(report.loaded.len(), 2);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(report.failed[0].1, ConfigError::UnexpectedKeyword("password".into()));
    assert_eq!(report.failed[1].1, ConfigError::UnknownType("plugins.nowhere.Missing".into()));

    assert_eq!(core.route_incoming("bad-keyword", "echo hi", "alice", true), 0);
    assert_eq!(core.route_incoming("bad-type", "echo hi", "alice", true), 0);
    assert_eq!(core.route_incoming("short-name", "echo hi", "alice", true), 1);
    assert_eq!(outbox.try_recv().unwrap(), Outgoing::new("short-name", "hi"));
}

#[test]
fn test_bundled_plugins_load_from_yaml() {
    ensure_init();
    let dir = tempfile::tempdir().unwrap();
    let persist = dir.path().join("tracker.json");

    let yaml = format!(
        r#"
plugins:
  - type: plugins.coinbase.CoinPrice
    channels: default
    api_base: http://prices.invalid/v2
  - type: plugins.tracker.Tracker
    channels: default, shipping
    status_url: "http://status.invalid/items/{{id}}"
    persist_file: "{}"
    retry_period: 48
    headers:
      Accept: application/json
  - type: plugins.coinbase.CoinPrice
    channels: default
    currency: EUR
"#,
        persist.display()
    );
    let config = Config::from_yaml(&yaml).unwrap();

    let (core, _outbox) = Core::new(&CoreConfig::default(), PluginLoader::default());
    let report = core.load(&config);

    assert_eq!(report.loaded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].1, ConfigError::UnexpectedKeyword("currency".into()));
    assert_eq!(core.scheduler().len(), 1);
    assert_eq!(report.loaded[1].agent().channels(), vec!["default", "shipping"]);

    // nothing tracked yet, so flushing writes an empty state file
    assert_eq!(core.flush(), 0);
    assert!(persist.exists());
}
