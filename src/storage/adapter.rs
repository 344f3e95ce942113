//! The public storage contract.
//!
//! [`JournalStore`] is the capability interface the rest of the system
//! programs against: any backend (git-backed, in-memory mock, a future
//! non-git store) implements the same six operations, which is what makes
//! substitution in tests possible. [`GitJournalStore`] is the production
//! implementation, composing the coordinator and the sync service over one
//! base directory.

use std::path::PathBuf;

use crate::storage::coordinator::StorageCoordinator;
use crate::storage::error::StorageResult;
use crate::storage::serializer::MessageRecord;
use crate::storage::sync::{AccessToken, SyncError, SyncService};
use crate::storage::types::{
    AttachmentInfo, AttachmentRef, CommitId, GitSignature, TopicId, User,
};

/// The five storage operations plus remote configuration.
///
/// All mutating calls are all-or-nothing with respect to commit history;
/// every failure mode surfaces as a typed error, never silently swallowed.
pub trait JournalStore: Send + Sync {
    /// ensure the user's repository exists with the base layout; idempotent
    fn init_storage(&self, user: &User) -> StorageResult<()>;

    /// ensure the topic exists; a no-op if already present
    fn create_topic(&self, user: &User, topic: &TopicId, name: &str) -> StorageResult<()>;

    /// append the record to the topic's log, auto-creating an unseen topic
    fn save_message(
        &self,
        user: &User,
        topic: &TopicId,
        record: &MessageRecord,
    ) -> StorageResult<CommitId>;

    /// store attachment bytes under their content address
    fn save_attachment(
        &self,
        user: &User,
        topic: &TopicId,
        info: &AttachmentInfo,
        bytes: &[u8],
    ) -> StorageResult<AttachmentRef>;

    /// install the remote and the process-scoped credential source
    fn configure_remote(
        &self,
        user: &User,
        repo_spec: &str,
        token: AccessToken,
    ) -> Result<(), SyncError>;

    /// exchange history with the configured remote
    fn sync(&self, user: &User) -> Result<(), SyncError>;
}

/// Git-backed journal store over one base directory.
pub struct GitJournalStore {
    coordinator: StorageCoordinator,
    sync: SyncService,
}

impl GitJournalStore {
    /// create a store keeping all journals under `base`
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            coordinator: StorageCoordinator::new(base),
            sync: SyncService::new(),
        }
    }

    /// set the signature for all commits this store creates
    pub fn with_signature(mut self, signature: GitSignature) -> Self {
        self.coordinator = self.coordinator.with_signature(signature.clone());
        self.sync = self.sync.with_signature(signature);
        self
    }

    /// direct access to the coordinator (read paths, topic checks)
    pub fn coordinator(&self) -> &StorageCoordinator {
        &self.coordinator
    }

    /// read every committed record from a topic's log
    pub fn read_messages(&self, user: &User, topic: &TopicId) -> StorageResult<Vec<MessageRecord>> {
        self.coordinator.read_messages(&user.id, topic)
    }
}

impl JournalStore for GitJournalStore {
    fn init_storage(&self, user: &User) -> StorageResult<()> {
        self.coordinator.init_storage(user)
    }

    fn create_topic(&self, user: &User, topic: &TopicId, name: &str) -> StorageResult<()> {
        self.coordinator.create_topic(&user.id, topic, name)?;
        Ok(())
    }

    fn save_message(
        &self,
        user: &User,
        topic: &TopicId,
        record: &MessageRecord,
    ) -> StorageResult<CommitId> {
        self.coordinator.save_message(&user.id, topic, record)
    }

    fn save_attachment(
        &self,
        user: &User,
        topic: &TopicId,
        info: &AttachmentInfo,
        bytes: &[u8],
    ) -> StorageResult<AttachmentRef> {
        self.coordinator.save_attachment(&user.id, topic, info, bytes)
    }

    fn configure_remote(
        &self,
        user: &User,
        repo_spec: &str,
        token: AccessToken,
    ) -> Result<(), SyncError> {
        // same lock the coordinator takes for mutations
        let lock = self.coordinator.repo_lock(&user.id);
        let _guard = lock.lock();
        let layout = self.coordinator.layout_for(&user.id);
        self.sync.configure_remote(layout.root(), repo_spec, token)
    }

    fn sync(&self, user: &User) -> Result<(), SyncError> {
        // held across the network round trip so local mutations and the
        // remote exchange cannot interleave
        let lock = self.coordinator.repo_lock(&user.id);
        let _guard = lock.lock();
        let layout = self.coordinator.layout_for(&user.id);
        self.sync.sync(layout.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::serializer;
    use crate::storage::types::UserId;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store() -> (TempDir, GitJournalStore, User) {
        let dir = TempDir::new().unwrap();
        let store = GitJournalStore::new(dir.path());
        let user = User::new(UserId::new("u1").unwrap(), "User One");
        store.init_storage(&user).unwrap();
        (dir, store, user)
    }

    #[test]
    fn test_end_to_end_archive_flow() {
        let (dir, store, user) = store();
        let topic = TopicId::new("42").unwrap();

        // message on a never-seen topic, built from a transport metadata map
        let mut metadata = BTreeMap::new();
        metadata.insert("sender_id".to_string(), Value::String("alice".to_string()));
        metadata.insert(
            "timestamp".to_string(),
            Value::String("2024-01-01T00:00:00Z".to_string()),
        );
        metadata.insert("chat_id".to_string(), Value::String("-100123".to_string()));
        metadata.insert("thread_id".to_string(), Value::String("42".to_string()));
        let record = MessageRecord::from_parts("hi", metadata).unwrap();

        store.save_message(&user, &topic, &record).unwrap();

        // attachment joins the topic, referenced from a second record
        let info = AttachmentInfo::new("file-1", "jpg");
        let stored = store
            .save_attachment(&user, &topic, &info, b"image bytes")
            .unwrap();
        let with_attachment = record.clone().with_attachment(stored.content_id.clone());
        store.save_message(&user, &topic, &with_attachment).unwrap();

        let records = store.read_messages(&user, &topic).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].attachment.as_deref(), Some(stored.content_id.as_str()));
        assert!(dir
            .path()
            .join("u1_journal")
            .join(&stored.path)
            .exists());

        let history = store.coordinator().history(&user.id).unwrap();
        assert_eq!(
            history,
            vec![
                "Added message to topic: 42".to_string(),
                "Added attachment to topic: 42".to_string(),
                "Added message to topic: 42".to_string(),
                "Created topic: 42".to_string(),
                "Initial repository structure".to_string(),
            ]
        );
    }

    #[test]
    fn test_create_topic_races_with_auto_creation() {
        let (_dir, store, user) = store();
        let topic = TopicId::new("42").unwrap();

        let record = MessageRecord {
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            sender_id: "alice".to_string(),
            sender_name: None,
            text: "early".to_string(),
            attachment: None,
            metadata: BTreeMap::new(),
        };

        // message first, explicit creation second: still exactly one topic
        store.save_message(&user, &topic, &record).unwrap();
        store.create_topic(&user, &topic, "Topic Forty-Two").unwrap();

        let history = store.coordinator().history(&user.id).unwrap();
        assert_eq!(
            history
                .iter()
                .filter(|m| m.starts_with("Created topic"))
                .count(),
            1
        );
    }

    #[test]
    fn test_trait_object_substitution() {
        let (_dir, store, user) = store();
        let boxed: Box<dyn JournalStore> = Box::new(store);
        // the contract stays usable behind the interface
        boxed.init_storage(&user).unwrap();
        let topic = TopicId::new("t1").unwrap();
        boxed.create_topic(&user, &topic, "Topic One").unwrap();
    }

    #[test]
    fn test_log_lines_decode_standalone() {
        let (dir, store, user) = store();
        let topic = TopicId::new("t1").unwrap();

        let record = MessageRecord {
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            sender_id: "alice".to_string(),
            sender_name: Some("Alice".to_string()),
            text: "hello".to_string(),
            attachment: None,
            metadata: BTreeMap::new(),
        };
        store.save_message(&user, &topic, &record).unwrap();

        let raw = std::fs::read_to_string(
            dir.path().join("u1_journal/topics/t1/messages.log"),
        )
        .unwrap();
        let line = raw.lines().next().unwrap();
        assert_eq!(serializer::decode(line).unwrap(), record);
    }
}
