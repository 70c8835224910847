//! Application layer errors

use thiserror::Error;

/// General bot errors
#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration errors.
///
/// Raised while parsing the configuration file or while loading a single
/// plugin. A plugin whose load fails with one of these is never subscribed
/// to any channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("invalid plugin type \"{0}\"")]
    UnknownType(String),

    #[error("plugin type \"{0}\" already registered")]
    DuplicateType(String),

    #[error("tag \"{keyword}\" is invalid: {reason}")]
    InvalidKeyword { keyword: String, reason: String },

    #[error("missing required tag \"{0}\"")]
    MissingKeyword(String),

    #[error("unexpected tag \"{0}\"")]
    UnexpectedKeyword(String),

    #[error("invalid command pattern \"{pattern}\": {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("plugin construction failed: {0}")]
    Construction(String),
}

impl ConfigError {
    pub fn invalid(keyword: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidKeyword {
            keyword: keyword.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by command handlers and poll steps
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),

    #[error("External service error: {0}")]
    External(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_names_the_type() {
        let e = ConfigError::UnknownType("x.Missing".into());
        assert_eq!(e.to_string(), "invalid plugin type \"x.Missing\"");
    }

    #[test]
    fn invalid_keyword_names_the_keyword() {
        let e = ConfigError::invalid("threshold", "expected an integer");
        assert!(e.to_string().contains("\"threshold\""));
    }

    #[test]
    fn storage_error_converts_into_plugin_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let e: PluginError = StorageError::from(io).into();
        assert!(e.to_string().contains("read-only"));
    }
}
