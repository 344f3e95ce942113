//! On-disk shape of a user's journal repository.
//!
//! ```text
//! <base>/<user_id>_journal/
//!   .git/
//!   metadata.yaml
//!   topics/<topic_id>/
//!     messages.log
//!     attachments/<content_hash>.<ext>
//! ```
//!
//! Everything here is pure path arithmetic plus the metadata file codec; the
//! coordinator decides when directories come into existence and what gets
//! committed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::error::StorageResult;
use crate::storage::types::{AttachmentInfo, TopicId, UserId};

pub const METADATA_FILE: &str = "metadata.yaml";
pub const TOPICS_DIR: &str = "topics";
pub const MESSAGES_FILE: &str = "messages.log";
pub const ATTACHMENTS_DIR: &str = "attachments";

/// Path arithmetic for one journal repository.
#[derive(Debug, Clone)]
pub struct JournalLayout {
    root: PathBuf,
}

impl JournalLayout {
    /// layout for a user's journal under the storage base directory
    pub fn for_user(base: &Path, user_id: &UserId) -> Self {
        Self {
            root: base.join(format!("{}_journal", user_id)),
        }
    }

    /// repository root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn topics_dir(&self) -> PathBuf {
        self.root.join(TOPICS_DIR)
    }

    pub fn topic_dir(&self, topic: &TopicId) -> PathBuf {
        self.topics_dir().join(topic.as_str())
    }

    pub fn messages_path(&self, topic: &TopicId) -> PathBuf {
        self.topic_dir(topic).join(MESSAGES_FILE)
    }

    pub fn attachments_dir(&self, topic: &TopicId) -> PathBuf {
        self.topic_dir(topic).join(ATTACHMENTS_DIR)
    }

    /// check whether the topic directory exists on disk
    pub fn topic_exists(&self, topic: &TopicId) -> bool {
        self.topic_dir(topic).is_dir()
    }

    // Relative paths are what the index wants for staging. Keeping them next
    // to their absolute twins avoids reconstructing them at every call site.

    pub fn rel_metadata() -> PathBuf {
        PathBuf::from(METADATA_FILE)
    }

    pub fn rel_messages(topic: &TopicId) -> PathBuf {
        PathBuf::from(TOPICS_DIR)
            .join(topic.as_str())
            .join(MESSAGES_FILE)
    }

    pub fn rel_attachment(topic: &TopicId, filename: &str) -> PathBuf {
        PathBuf::from(TOPICS_DIR)
            .join(topic.as_str())
            .join(ATTACHMENTS_DIR)
            .join(filename)
    }
}

/// Content-derived filename for an attachment.
///
/// Identical bytes always map to the same name, which is what makes the
/// write-once dedup inside a topic collision-free by construction.
pub fn content_address(bytes: &[u8], info: &AttachmentInfo) -> (String, String) {
    let digest = Sha256::digest(bytes);
    let content_id = format!("{:x}", digest);
    let ext = info.normalized_extension();
    let filename = if ext.is_empty() {
        content_id.clone()
    } else {
        format!("{}.{}", content_id, ext)
    };
    (content_id, filename)
}

/// one topic's entry in the repository metadata file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEntry {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Repository-level metadata, stored as `metadata.yaml` at the journal root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalMetadata {
    pub user_id: String,
    #[serde(default)]
    pub topics: BTreeMap<String, TopicEntry>,
}

impl JournalMetadata {
    /// fresh metadata for a newly initialized journal
    pub fn new(user_id: &UserId) -> Self {
        Self {
            user_id: user_id.as_str().to_string(),
            topics: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> StorageResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> StorageResult<()> {
        let text = serde_yaml::to_string(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// record a topic; overwriting an existing entry keeps its creation time
    pub fn insert_topic(&mut self, topic: &TopicId, name: &str) {
        self.topics
            .entry(topic.as_str().to_string())
            .or_insert_with(|| TopicEntry {
                name: name.to_string(),
                created_at: Utc::now(),
            });
    }

    /// display name for a topic, falling back to the id for topics that were
    /// auto-created before an explicit name was known
    pub fn topic_name<'a>(&'a self, topic: &'a TopicId) -> &'a str {
        self.topics
            .get(topic.as_str())
            .map(|entry| entry.name.as_str())
            .unwrap_or(topic.as_str())
    }
}
