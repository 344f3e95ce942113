//! JSON file-backed bot state, adjacent to the storage core.
//!
//! Holds the user/group enablement flags and topic bindings the interactive
//! layer maintains. The storage core never reads or writes this file; its
//! only contract with it is accepting a topic id and display name per call.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// errors from loading or saving the bot state file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// per-group archiving configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// whether archiving is enabled for this group
    pub enabled: bool,
    /// topic id the group's messages are bound to, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    /// display name used when the topic is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,
}

/// Persistent bot state, loaded at process start and written on mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    /// user id -> free-form session data
    #[serde(default)]
    pub user_sessions: BTreeMap<String, Value>,
    /// group id -> archiving configuration
    #[serde(default)]
    pub group_configs: BTreeMap<String, GroupConfig>,
}

/// Simple JSON-based config storage.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// create a store backed by the given file, creating parents as needed
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// load state from disk; a missing file reads as the default state
    pub fn load(&self) -> Result<BotState, ConfigError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BotState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// write state to disk
    pub fn save(&self, state: &BotState) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, text)?;
        Ok(())
    }
}
