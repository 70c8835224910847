//! Configuration management
//!
//! The configuration file is YAML. Each entry under `plugins` describes one
//! plugin instance: `type` and `channels` are attributes, every other key is
//! a constructor keyword. Scalar keywords arrive as strings; mappings and
//! sequences are passed through as structured nodes.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;
use crate::application::errors::ConfigError;

/// Plugin type used when an entry has no `type` attribute
pub const DEFAULT_PLUGIN_TYPE: &str = "plugin.Plugin";

/// Bot configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub plugins: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CoreConfig {
    pub name: String,
    /// Scheduler tick period in milliseconds
    pub poll_tick_ms: u64,
    /// Channel console input is routed into
    pub console_channel: String,
    /// Console lines starting with this prefix are directed at the bot
    pub directed_prefix: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: "hesperus".to_string(),
            poll_tick_ms: 250,
            console_channel: "default".to_string(),
            directed_prefix: Some("hesperus:".to_string()),
        }
    }
}

/// Raw keyword value as found in the configuration tree
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// Leaf node, in string form
    Text(String),
    /// Non-leaf node, left for the plugin to interpret
    Node(Value),
}

/// One plugin entry, consumed by the loader
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub type_name: String,
    pub channels: Vec<String>,
    pub keywords: Vec<(String, ConfigValue)>,
}

impl PluginDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            channels: Vec::new(),
            keywords: Vec::new(),
        }
    }

    /// Set channels from a comma-separated list
    pub fn with_channels(mut self, channels: &str) -> Self {
        self.channels = split_channels(channels);
        self
    }

    pub fn with_keyword(mut self, name: impl Into<String>, value: ConfigValue) -> Self {
        self.keywords.push((name.into().to_lowercase(), value));
        self
    }

    pub fn with_text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_keyword(name, ConfigValue::Text(value.into()))
    }

    /// Parse a single `plugins` entry
    pub fn from_value(entry: &Value) -> Result<Self, ConfigError> {
        let Value::Mapping(map) = entry else {
            return Err(ConfigError::Parse("plugin entry is not a mapping".to_string()));
        };

        let mut descriptor = PluginDescriptor::new(DEFAULT_PLUGIN_TYPE);
        for (key, value) in map {
            let key = scalar_text(key)
                .ok_or_else(|| ConfigError::Parse(format!("non-scalar key in plugin entry: {:?}", key)))?
                .to_lowercase();

            match key.as_str() {
                "type" => {
                    descriptor.type_name = scalar_text(value)
                        .ok_or_else(|| ConfigError::invalid("type", "must be a string"))?;
                }
                "channels" => {
                    let channels = scalar_text(value)
                        .ok_or_else(|| ConfigError::invalid("channels", "must be a comma-separated string"))?;
                    descriptor.channels = split_channels(&channels);
                }
                _ => match value {
                    Value::Null => {}
                    Value::Mapping(_) | Value::Sequence(_) | Value::Tagged(_) => {
                        descriptor.keywords.push((key, ConfigValue::Node(value.clone())));
                    }
                    scalar => {
                        let text = scalar_text(scalar).unwrap_or_default();
                        descriptor.keywords.push((key, ConfigValue::Text(text)));
                    }
                },
            }
        }
        Ok(descriptor)
    }
}

/// Split a comma-separated channel list, trimming and dropping empty names
pub fn split_channels(raw: &str) -> Vec<String> {
    let mut channels: Vec<String> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !channels.iter().any(|c| c == name) {
            channels.push(name.to_string());
        }
    }
    channels
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn plugin_entry(type_name: &str, channels: &str) -> Value {
    let mut map = Mapping::new();
    map.insert(Value::from("type"), Value::from(type_name));
    map.insert(Value::from("channels"), Value::from(channels));
    Value::Mapping(map)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            plugins: vec![
                plugin_entry(DEFAULT_PLUGIN_TYPE, "default"),
                plugin_entry("plugins.coinbase.CoinPrice", "default"),
            ],
        }
    }
}

impl Config {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Parse(format!("Failed to read config {}: {}", path.display(), e)))?;

        Self::from_yaml(&content)
    }

    /// Load `path`, or defaults if the file does not exist.
    ///
    /// Only absence falls back; a file that exists but cannot be read or
    /// parsed is still an error.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.exists() {
            tracing::warn!("Config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse config: {}", e)))
    }

    /// One descriptor per plugin entry. A malformed entry only fails itself.
    pub fn descriptors(&self) -> Vec<Result<PluginDescriptor, ConfigError>> {
        self.plugins.iter().map(PluginDescriptor::from_value).collect()
    }
}
