//! Tracker plugin - Watches item status on a remote service
//!
//! `track <id> [tag]` starts watching an item (or stops, when it is already
//! watched), `track` alone lists your items and `tstatus <id>` asks once.
//! Ids the service does not know yet are retried for a while before they are
//! dropped. Every change is announced on the plugin's channels.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::{Lazy, OnceCell};
use regex_lite::Captures;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::application::errors::{ConfigError, PluginError, StorageError};
use crate::application::messaging::{CommandContext, CommandTable, Reply};
use crate::domain::entities::Incoming;
use crate::infrastructure::plugins::{KeywordKind, KeywordSpec, Keywords, PluginSpec};
use crate::infrastructure::storage::PersistedState;
use super::trait_def::{Agent, Persistent, Plugin, PluginContext, PollStep, PollTask, Poller};

const DEFAULT_PERSIST_FILE: &str = "tracker.json";
const DEFAULT_RETRY_HOURS: i64 = 24;
const DEFAULT_BASE_INTERVAL: i64 = 300;
/// Messages from this channel may stop anyone's items
const ADMIN_CHANNEL: &str = "admin";

const KEYWORDS: &[KeywordSpec] = &[
    KeywordSpec::required("status_url", KeywordKind::Str),
    KeywordSpec::optional("persist_file", KeywordKind::Str),
    KeywordSpec::optional("retry_period", KeywordKind::Int),
    KeywordSpec::optional("base_interval", KeywordKind::Int),
    KeywordSpec::optional("headers", KeywordKind::Node),
];

pub const SPEC: PluginSpec = PluginSpec {
    type_name: "plugins.tracker.Tracker",
    summary: "Watches items on a status service and announces every change",
    keywords: KEYWORDS,
    factory: build,
};

static COMMANDS: Lazy<CommandTable<Tracker>> = Lazy::new(|| {
    CommandTable::new()
        .command(r"track(?:\s+([\w:-]+))?(?:\s+(.+))?", Tracker::track_command)
        .command(r"tstatus(?:\s+([\w:-]+))?", Tracker::status_command)
});

/// Current status of an item, as reported by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub status: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub delivered: bool,
    /// Unix time of the latest event
    pub last_update: i64,
    /// Description of the event before the latest one
    #[serde(default)]
    pub previous: Option<String>,
    /// Expected delivery, unix time
    #[serde(default)]
    pub delivery_date: Option<i64>,
}

/// Where item status comes from
pub trait StatusSource: Send + Sync {
    /// `Ok(None)` when the service has no record of `id` yet
    fn lookup(&self, id: &str) -> Result<Option<Status>, PluginError>;
}

/// JSON status endpoint. `{id}` in the URL is replaced by the item id and a
/// 404 means the id is not known yet.
pub struct HttpStatusSource {
    url_template: String,
    headers: Vec<(String, String)>,
    client: OnceCell<reqwest::blocking::Client>,
}

impl HttpStatusSource {
    pub fn new(url_template: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            url_template: url_template.into(),
            headers,
            client: OnceCell::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, PluginError> {
        self.client.get_or_try_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .map_err(external)
        })
    }
}

fn external(e: reqwest::Error) -> PluginError {
    PluginError::External(e.to_string())
}

impl StatusSource for HttpStatusSource {
    fn lookup(&self, id: &str) -> Result<Option<Status>, PluginError> {
        let url = self.url_template.replace("{id}", id);
        let mut request = self.client()?.get(&url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().map_err(external)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response
            .error_for_status()
            .and_then(|r| r.json::<Status>())
            .map_err(external)?;
        Ok(Some(status))
    }
}

/// A watched item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracked {
    pub tag: String,
    pub owner: String,
    pub channels: Vec<String>,
    pub directed: bool,
    pub last_update: i64,
}

/// Persisted tracker state, keyed by item id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerState {
    #[serde(default)]
    pub watched: BTreeMap<String, Tracked>,
    /// Ids the service did not know about yet
    #[serde(default)]
    pub unready: BTreeMap<String, Tracked>,
}

pub struct Tracker {
    agent: Agent,
    source: Box<dyn StatusSource>,
    state: PersistedState<TrackerState>,
    /// Hours an unready id is retried before it is dropped
    retry_period: i64,
    base_interval: Duration,
}

impl Tracker {
    pub fn new(
        ctx: &PluginContext,
        source: Box<dyn StatusSource>,
        persist_file: impl Into<PathBuf>,
        retry_period: i64,
        base_interval: Duration,
    ) -> Self {
        Self {
            agent: Agent::new(ctx),
            source,
            state: PersistedState::open(persist_file),
            retry_period,
            base_interval,
        }
    }

    pub fn state(&self) -> TrackerState {
        self.state.snapshot()
    }

    fn track_command(&self, ctx: &CommandContext<'_>, caps: &Captures<'_>) -> Result<(), PluginError> {
        let Some(id) = caps.get(1).map(|m| m.as_str()) else {
            self.list_items(ctx);
            return Ok(());
        };

        let owner = self.state.read(|s| {
            s.watched
                .get(id)
                .or_else(|| s.unready.get(id))
                .map(|item| item.owner.clone())
        });
        if let Some(owner) = owner {
            if owner == ctx.author || ctx.is_on(ADMIN_CHANNEL) {
                self.state.update_and_save(|s| {
                    s.watched.remove(id);
                    s.unready.remove(id);
                })?;
                ctx.reply.send("WELL FINE THEN, I won't tell you about that one anymore");
            } else {
                ctx.reply.send("You can't tell me what to do, you're not even my real dad!");
            }
            return Ok(());
        }

        let tag = caps
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| id.to_string());

        match self.source.lookup(id) {
            Err(e) => {
                self.agent.warn(format_args!("lookup for {} failed: {}", id, e));
                ctx.reply.send("The status service is being slow, try again later");
            }
            Ok(None) => {
                let item = new_item(ctx, &tag, now());
                self.state.update_and_save(|s| {
                    s.unready.insert(id.to_string(), item);
                })?;
                ctx.reply.send(format!(
                    "Nobody knows about \"{}\" yet but I'll keep an eye on it for {} hours and let you know if they find it",
                    tag, self.retry_period
                ));
            }
            Ok(Some(status)) if status.delivered => {
                ctx.reply.send(format!("Go check outside, \"{}\" has already been delivered", tag));
            }
            Ok(Some(status)) => {
                let item = new_item(ctx, &tag, status.last_update);
                self.state.update_and_save(|s| {
                    s.watched.insert(id.to_string(), item);
                })?;
                ctx.reply.send(format!(
                    "\"{}\" is at \"{}\" now, I'll let you know when it changes",
                    tag, status.status
                ));
            }
        }
        Ok(())
    }

    fn list_items(&self, ctx: &CommandContext<'_>) {
        let mine: Vec<String> = self.state.read(|s| {
            s.watched
                .iter()
                .filter(|(_, item)| item.owner == ctx.author)
                .map(|(id, item)| format!("\"{}\" ({})", item.tag, id))
                .collect()
        });

        if mine.is_empty() {
            ctx.reply.send("I'm not watching anything for you right now");
        } else {
            ctx.reply.send(format!("Watching for you: {}", mine.join(", ")));
        }
    }

    fn status_command(&self, ctx: &CommandContext<'_>, caps: &Captures<'_>) -> Result<(), PluginError> {
        let Some(id) = caps.get(1).map(|m| m.as_str()) else {
            ctx.reply.send("What exactly do you want the status of?");
            return Ok(());
        };

        let msg = match self.source.lookup(id) {
            Ok(Some(s)) if s.delivered => {
                format!("{} has been delivered as of {}", id, format_time(s.last_update))
            }
            Ok(Some(s)) => format!(
                "{} is at {}@{} as of {}, and it should be delivered {}",
                id,
                s.status,
                s.location,
                format_time(s.last_update),
                format_eta(s.delivery_date)
            ),
            Ok(None) => format!("Nobody knows anything about {}", id),
            Err(e) => {
                self.agent.warn(format_args!("lookup for {} failed: {}", id, e));
                format!("Sorry, the status service said \"{}\"", e)
            }
        };
        ctx.reply.send(msg);
        Ok(())
    }

    fn check_unready(&self, id: &str, now: i64) -> PollStep {
        let Some(item) = self.state.read(|s| s.unready.get(id).cloned()) else {
            return Ok(());
        };

        match self.source.lookup(id) {
            Ok(Some(status)) => {
                self.state.update_and_save(|s| {
                    s.unready.remove(id);
                    s.watched.insert(
                        id.to_string(),
                        Tracked {
                            last_update: status.last_update,
                            ..item.clone()
                        },
                    );
                })?;
                self.announce(format!(
                    "{}: somebody found your \"{}\", I'll watch it for updates now",
                    item.owner, item.tag
                ));
            }
            Ok(None) if now - item.last_update > self.retry_period * 3600 => {
                self.state.update_and_save(|s| {
                    s.unready.remove(id);
                })?;
                self.announce(format!(
                    "{}: nobody has found your \"{}\" yet so I'm dropping it",
                    item.owner, item.tag
                ));
            }
            Ok(None) => {}
            Err(e) => self.agent.debug(format_args!("lookup for {} failed: {}", id, e)),
        }
        Ok(())
    }

    fn check_watched(&self, id: &str, now: i64) -> PollStep {
        let Some(item) = self.state.read(|s| s.watched.get(id).cloned()) else {
            return Ok(());
        };

        let status = match self.source.lookup(id) {
            Ok(Some(status)) => status,
            Ok(None) => {
                self.agent.warn(format_args!("service lost track of {}", id));
                return Ok(());
            }
            Err(e) => {
                self.agent.warn(format_args!("lookup for {} failed: {}", id, e));
                return Ok(());
            }
        };

        if status.delivered {
            self.state.update_and_save(|s| {
                s.watched.remove(id);
            })?;
            self.announce(describe(&item, &status, now));
        } else if status.last_update > item.last_update {
            self.state.update_and_save(|s| {
                if let Some(watched) = s.watched.get_mut(id) {
                    watched.last_update = status.last_update;
                }
            })?;
            self.announce(describe(&item, &status, now));
        }
        Ok(())
    }

    fn announce(&self, text: String) {
        self.agent.broadcast(&text);
    }
}

fn new_item(ctx: &CommandContext<'_>, tag: &str, last_update: i64) -> Tracked {
    Tracked {
        tag: tag.to_string(),
        owner: ctx.author.to_string(),
        channels: ctx.channels.to_vec(),
        directed: ctx.directed,
        last_update,
    }
}

fn describe(item: &Tracked, status: &Status, now: i64) -> String {
    let mut msg = if status.delivered {
        format!("\"{}\" has been delivered", item.tag)
    } else {
        match &status.previous {
            Some(prev) => format!(
                "moved \"{}\" from {} to {}@{}",
                item.tag, prev, status.status, status.location
            ),
            None => format!("moved \"{}\" to {}@{}", item.tag, status.status, status.location),
        }
    };
    if let (false, Some(eta)) = (status.delivered, status.delivery_date) {
        msg.push_str(&format!(", delivery is T minus {} hours", (eta - now) / 3600));
    }
    format!("{}: {}", item.owner, msg)
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn format_time(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| t.format("%m/%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn format_eta(eta: Option<i64>) -> String {
    let Some(date) = eta.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)) else {
        return "... eventually".to_string();
    };
    if date.date_naive() == Utc::now().date_naive() {
        "today".to_string()
    } else {
        date.format("%m/%d").to_string()
    }
}

/// One tick: a step per unready id, then a step per watched id
struct PollRun {
    tracker: Arc<Tracker>,
    now: i64,
    unready: VecDeque<String>,
    watched: Option<VecDeque<String>>,
}

impl Iterator for PollRun {
    type Item = PollStep;

    fn next(&mut self) -> Option<PollStep> {
        if let Some(id) = self.unready.pop_front() {
            return Some(self.tracker.check_unready(&id, self.now));
        }

        // watched ids are read after the unready pass so found items are included
        let tracker = &self.tracker;
        let watched = self
            .watched
            .get_or_insert_with(|| tracker.state.read(|s| s.watched.keys().cloned().collect()));
        let id = watched.pop_front()?;
        Some(self.tracker.check_watched(&id, self.now))
    }
}

impl Plugin for Tracker {
    fn agent(&self) -> &Agent {
        &self.agent
    }

    fn handle_incoming(&self, incoming: &Incoming, reply: &Reply) -> Result<(), PluginError> {
        COMMANDS.dispatch(self, incoming, reply).map(|_| ())
    }

    fn poller(self: Arc<Self>) -> Option<Arc<dyn Poller>> {
        Some(self)
    }

    fn persistence(&self) -> Option<&dyn Persistent> {
        Some(self)
    }
}

impl Poller for Tracker {
    fn poll(self: Arc<Self>) -> PollTask {
        let unready = self.state.read(|s| s.unready.keys().cloned().collect());
        self.agent.debug("starting poll");
        Box::new(PollRun {
            tracker: self,
            now: now(),
            unready,
            watched: None,
        })
    }

    fn poll_interval(&self) -> Duration {
        let count = self.state.read(|s| s.watched.len());
        if count < 2 {
            self.base_interval
        } else {
            self.base_interval / u32::try_from(count).unwrap_or(u32::MAX)
        }
    }
}

impl Persistent for Tracker {
    fn load_data(&self) {
        self.agent.debug("loading state");
        self.state.load();
    }

    fn save_data(&self) -> Result<(), StorageError> {
        self.agent.debug("saving state");
        self.state.save()
    }
}

fn header_pairs(node: &Value) -> Result<Vec<(String, String)>, ConfigError> {
    let Value::Mapping(map) = node else {
        return Err(ConfigError::invalid("headers", "expected a mapping of header names to values"));
    };
    map.iter()
        .map(|(name, value)| match (name.as_str(), value.as_str()) {
            (Some(name), Some(value)) => Ok((name.to_string(), value.to_string())),
            _ => Err(ConfigError::invalid("headers", "header names and values must be strings")),
        })
        .collect()
}

fn build(ctx: PluginContext, keywords: &Keywords) -> Result<Arc<dyn Plugin>, ConfigError> {
    COMMANDS.validate()?;

    let status_url = keywords.require_str("status_url")?;
    if !status_url.contains("{id}") {
        return Err(ConfigError::invalid("status_url", "must contain an {id} placeholder"));
    }
    let headers = match keywords.node("headers") {
        Some(node) => header_pairs(node)?,
        None => Vec::new(),
    };

    let retry_period = keywords.int("retry_period").unwrap_or(DEFAULT_RETRY_HOURS);
    if retry_period < 0 {
        return Err(ConfigError::invalid("retry_period", "must not be negative"));
    }
    let base_interval = u64::try_from(keywords.int("base_interval").unwrap_or(DEFAULT_BASE_INTERVAL))
        .ok()
        .filter(|secs| *secs > 0)
        .ok_or_else(|| ConfigError::invalid("base_interval", "must be a positive number of seconds"))?;
    let persist_file = keywords.str("persist_file").unwrap_or(DEFAULT_PERSIST_FILE);

    Ok(Arc::new(Tracker::new(
        &ctx,
        Box::new(HttpStatusSource::new(status_url, headers)),
        persist_file,
        retry_period,
        Duration::from_secs(base_interval),
    )))
}
