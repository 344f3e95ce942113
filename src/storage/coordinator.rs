//! The atomic mutation protocol.
//!
//! This is the central component of the storage layer. Every mutating
//! operation runs the same sequence under a per-user lock:
//!
//! 1. acquire the exclusive lock for the user's repository
//! 2. if the working tree is dirty (a prior crash mid-operation), discard the
//!    uncommitted changes by resetting to the last commit
//! 3. apply the filesystem mutation for this operation
//! 4. stage exactly the changed paths, never a blanket "stage everything"
//! 5. commit with the deterministic message for this operation kind
//!
//! A failure at step 3 or 5 rolls the working tree back to the pre-operation
//! commit before the error propagates, so no operation is ever observable as
//! partially applied. Distinct users proceed fully in parallel; same-user
//! calls are totally ordered by the lock.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::build::CheckoutBuilder;
use git2::{Repository, RepositoryInitOptions, ResetType, Sort, StatusOptions};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::layout::{self, JournalLayout, JournalMetadata};
use crate::storage::serializer::{self, MessageRecord};
use crate::storage::types::{
    AttachmentInfo, AttachmentRef, CommitId, GitSignature, TopicId, User, UserId,
};

/// Sequences filesystem mutations and their commits as indivisible steps.
///
/// The lock registry is lazily populated per process and never persisted;
/// after a restart the on-disk repositories are the only durable state and
/// the recovery step in [`Self::with_journal`] covers whatever a crashed
/// process left behind.
pub struct StorageCoordinator {
    base: PathBuf,
    signature: GitSignature,
    locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl StorageCoordinator {
    /// create a coordinator rooted at the storage base directory
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            signature: GitSignature::chronicler(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// set the signature used for journal commits
    pub fn with_signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    /// layout of a user's journal under this coordinator's base
    pub fn layout_for(&self, user_id: &UserId) -> JournalLayout {
        JournalLayout::for_user(&self.base, user_id)
    }

    /// The exclusive lock guarding a user's repository.
    ///
    /// Shared with the sync service so that a remote exchange cannot
    /// interleave with local mutations.
    pub(crate) fn repo_lock(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ==================== Adapter Operations ====================

    /// Ensure the user's repository exists with the base layout.
    ///
    /// Idempotent. Fails with [`StorageError::NotAJournal`] if the path
    /// exists but is not a journal repository.
    pub fn init_storage(&self, user: &User) -> StorageResult<()> {
        let lock = self.repo_lock(&user.id);
        let _guard = lock.lock();

        let layout = self.layout_for(&user.id);
        let root = layout.root();

        if root.exists() {
            if !root.join(".git").exists() {
                return Err(StorageError::NotAJournal(root.to_path_buf()));
            }
            let repo = self.open(&layout)?;
            self.recover_if_dirty(&repo)?;
            self.ensure_base_layout(&repo, &layout, &user.id)?;
            debug!("journal for user {} already initialized", user.id);
            return Ok(());
        }

        match self.create_journal(&layout, &user.id) {
            Ok(commit) => {
                info!(
                    "initialized journal for user {} at {} ({})",
                    user.id,
                    root.display(),
                    commit.short()
                );
                Ok(())
            }
            Err(e) => {
                // leave nothing half-created behind
                let _ = fs::remove_dir_all(root);
                Err(e)
            }
        }
    }

    /// Ensure a topic exists. A no-op when it is already present, otherwise
    /// creates the topic layout and commits it.
    pub fn create_topic(
        &self,
        user_id: &UserId,
        topic: &TopicId,
        name: &str,
    ) -> StorageResult<Option<CommitId>> {
        self.with_journal(user_id, |repo, layout| {
            if layout.topic_exists(topic) {
                debug!("topic {} already exists, nothing to do", topic);
                return Ok(None);
            }
            Ok(Some(self.create_topic_in(repo, layout, topic, name)?))
        })
    }

    /// Append one encoded record to the topic's log and commit it.
    ///
    /// An unseen topic id is created on the fly, named after its id; late or
    /// out-of-order topic creation is tolerated by policy rather than failed.
    pub fn save_message(
        &self,
        user_id: &UserId,
        topic: &TopicId,
        record: &MessageRecord,
    ) -> StorageResult<CommitId> {
        self.with_journal(user_id, |repo, layout| {
            if !layout.topic_exists(topic) {
                self.create_topic_in(repo, layout, topic, topic.as_str())?;
            }

            let line = serializer::encode(record)?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(layout.messages_path(topic))?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;

            let metadata = JournalMetadata::load(&layout.metadata_path())?;
            let message = format!("Added message to topic: {}", metadata.topic_name(topic));
            let commit =
                self.commit_paths(repo, &[JournalLayout::rel_messages(topic)], &message)?;

            debug!("saved message to topic {} ({})", topic, commit.short());
            Ok(commit)
        })
    }

    /// Store attachment bytes under their content address and commit.
    ///
    /// Identical content within the same topic is written once; a repeat call
    /// returns the same reference without touching the repository.
    pub fn save_attachment(
        &self,
        user_id: &UserId,
        topic: &TopicId,
        info: &AttachmentInfo,
        bytes: &[u8],
    ) -> StorageResult<AttachmentRef> {
        self.with_journal(user_id, |repo, layout| {
            if !layout.topic_exists(topic) {
                return Err(StorageError::TopicNotFound(topic.clone()));
            }

            let (content_id, filename) = layout::content_address(bytes, info);
            let rel = JournalLayout::rel_attachment(topic, &filename);
            let target = layout.attachments_dir(topic).join(&filename);
            let reference = AttachmentRef {
                content_id,
                path: rel.to_string_lossy().into_owned(),
            };

            if target.exists() {
                debug!(
                    "attachment {} already stored in topic {}, reusing",
                    filename, topic
                );
                return Ok(reference);
            }

            fs::create_dir_all(layout.attachments_dir(topic))?;
            fs::write(&target, bytes)?;

            let metadata = JournalMetadata::load(&layout.metadata_path())?;
            let message = format!("Added attachment to topic: {}", metadata.topic_name(topic));
            let commit = self.commit_paths(repo, &[rel], &message)?;

            debug!(
                "saved attachment {} (source file {}) to topic {} ({})",
                filename,
                info.file_id,
                topic,
                commit.short()
            );
            Ok(reference)
        })
    }

    // ==================== Read Operations ====================

    /// Read every committed record from a topic's log.
    ///
    /// Takes the repository lock so a concurrent append cannot be observed
    /// half-written; a truncated tail from a crashed process reads as absent.
    pub fn read_messages(
        &self,
        user_id: &UserId,
        topic: &TopicId,
    ) -> StorageResult<Vec<MessageRecord>> {
        let lock = self.repo_lock(user_id);
        let _guard = lock.lock();

        let layout = self.layout_for(user_id);
        Ok(serializer::read_log(&layout.messages_path(topic))?)
    }

    /// check if a topic exists in the user's journal
    pub fn topic_exists(&self, user_id: &UserId, topic: &TopicId) -> bool {
        self.layout_for(user_id).topic_exists(topic)
    }

    /// commit messages of the user's journal, newest first
    pub fn history(&self, user_id: &UserId) -> StorageResult<Vec<String>> {
        let lock = self.repo_lock(user_id);
        let _guard = lock.lock();

        let layout = self.layout_for(user_id);
        let repo = self.open(&layout)?;

        let mut revwalk = repo.revwalk()?;
        revwalk.push_head()?;
        revwalk.set_sorting(Sort::TIME | Sort::TOPOLOGICAL)?;

        let mut messages = Vec::new();
        for oid in revwalk {
            let commit = repo.find_commit(oid?)?;
            messages.push(commit.message().unwrap_or("").trim_end().to_string());
        }
        Ok(messages)
    }

    // ==================== Protocol Internals ====================

    /// Run one mutating operation under the user's repository lock.
    ///
    /// Recovers from a dirty working tree before `f` runs and rolls back to
    /// the pre-operation commit if `f` fails. The lock is released on every
    /// exit path by the guard going out of scope.
    fn with_journal<T>(
        &self,
        user_id: &UserId,
        f: impl FnOnce(&Repository, &JournalLayout) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let lock = self.repo_lock(user_id);
        let _guard = lock.lock();

        let layout = self.layout_for(user_id);
        let repo = self.open(&layout)?;
        self.recover_if_dirty(&repo)?;

        let pre_op = repo.head()?.peel_to_commit()?.id();
        match f(&repo, &layout) {
            Ok(value) => Ok(value),
            Err(e) => {
                if let Err(rollback) = self.rollback_to(&repo, pre_op) {
                    warn!(
                        "rollback to {} failed after {}: {}",
                        pre_op, e, rollback
                    );
                }
                Err(e)
            }
        }
    }

    fn open(&self, layout: &JournalLayout) -> StorageResult<Repository> {
        Repository::open(layout.root())
            .map_err(|_| StorageError::NotAJournal(layout.root().to_path_buf()))
    }

    /// Discard uncommitted changes left behind by an interrupted operation.
    ///
    /// Safe because every operation is re-derivable from caller-supplied
    /// input and will simply be redone on retry.
    fn recover_if_dirty(&self, repo: &Repository) -> StorageResult<()> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        if statuses.is_empty() {
            return Ok(());
        }

        warn!(
            "discarding {} uncommitted paths left by an interrupted operation",
            statuses.len()
        );
        let head = repo.head()?.peel_to_commit()?.id();
        self.rollback_to(repo, head)
    }

    fn rollback_to(&self, repo: &Repository, commit: git2::Oid) -> StorageResult<()> {
        let target = repo.find_commit(commit)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        repo.reset(target.as_object(), ResetType::Hard, Some(&mut checkout))?;
        Ok(())
    }

    /// stage exactly the given paths and commit on top of HEAD
    fn commit_paths(
        &self,
        repo: &Repository,
        rel_paths: &[PathBuf],
        message: &str,
    ) -> StorageResult<CommitId> {
        let mut index = repo.index()?;
        for path in rel_paths {
            index.add_path(path)?;
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = self.signature.to_git2_signature()?;
        let parent = repo.head()?.peel_to_commit()?;

        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        Ok(CommitId::new(oid))
    }

    /// topic directory, empty log, metadata entry, one commit
    fn create_topic_in(
        &self,
        repo: &Repository,
        layout: &JournalLayout,
        topic: &TopicId,
        name: &str,
    ) -> StorageResult<CommitId> {
        fs::create_dir_all(layout.attachments_dir(topic))?;
        fs::write(layout.messages_path(topic), "")?;

        let mut metadata = JournalMetadata::load(&layout.metadata_path())?;
        metadata.insert_topic(topic, name);
        metadata.save(&layout.metadata_path())?;

        let paths = [
            JournalLayout::rel_messages(topic),
            JournalLayout::rel_metadata(),
        ];
        let commit =
            self.commit_paths(repo, &paths, &format!("Created topic: {}", name))?;

        info!("created topic {} ({})", topic, commit.short());
        Ok(commit)
    }

    /// create directory skeleton, metadata file, git repo and initial commit
    fn create_journal(&self, layout: &JournalLayout, user_id: &UserId) -> StorageResult<CommitId> {
        fs::create_dir_all(layout.topics_dir())?;
        JournalMetadata::new(user_id).save(&layout.metadata_path())?;

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(layout.root(), &opts)?;

        let mut index = repo.index()?;
        index.add_path(Path::new(layout::METADATA_FILE))?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = self.signature.to_git2_signature()?;

        let oid = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            "Initial repository structure",
            &tree,
            &[],
        )?;
        Ok(CommitId::new(oid))
    }

    /// Re-establish the base layout of an already initialized journal.
    ///
    /// The topics directory is untracked while empty, so it can vanish with a
    /// fresh clone; the metadata file going missing would have been an outside
    /// intervention, which we repair the same way.
    fn ensure_base_layout(
        &self,
        repo: &Repository,
        layout: &JournalLayout,
        user_id: &UserId,
    ) -> StorageResult<()> {
        if !layout.topics_dir().exists() {
            fs::create_dir_all(layout.topics_dir())?;
        }
        if !layout.metadata_path().exists() {
            warn!("metadata file missing from journal of user {}, recreating", user_id);
            JournalMetadata::new(user_id).save(&layout.metadata_path())?;
            self.commit_paths(
                repo,
                &[JournalLayout::rel_metadata()],
                "Initial repository structure",
            )?;
        }
        Ok(())
    }

    /// check that the working tree matches HEAD (used by tests)
    #[cfg(test)]
    fn is_clean(&self, user_id: &UserId) -> bool {
        let layout = self.layout_for(user_id);
        let repo = match Repository::open(layout.root()) {
            Ok(repo) => repo,
            Err(_) => return false,
        };
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        repo.statuses(Some(&mut opts))
            .map(|s| s.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn setup() -> (TempDir, StorageCoordinator, User) {
        let dir = TempDir::new().unwrap();
        let coordinator = StorageCoordinator::new(dir.path());
        let user = User::new(UserId::new("u1").unwrap(), "User One");
        coordinator.init_storage(&user).unwrap();
        (dir, coordinator, user)
    }

    fn record(text: &str) -> MessageRecord {
        MessageRecord {
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            sender_id: "alice".to_string(),
            sender_name: None,
            text: text.to_string(),
            attachment: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_init_creates_layout_and_initial_commit() {
        let (dir, coordinator, user) = setup();

        let root = dir.path().join("u1_journal");
        assert!(root.join(".git").exists());
        assert!(root.join("metadata.yaml").exists());
        assert!(root.join("topics").is_dir());

        let history = coordinator.history(&user.id).unwrap();
        assert_eq!(history, vec!["Initial repository structure".to_string()]);
        assert!(coordinator.is_clean(&user.id));
    }

    #[test]
    fn test_init_is_idempotent() {
        let (_dir, coordinator, user) = setup();
        coordinator.init_storage(&user).unwrap();
        coordinator.init_storage(&user).unwrap();

        assert_eq!(coordinator.history(&user.id).unwrap().len(), 1);
    }

    #[test]
    fn test_init_rejects_foreign_directory() {
        let dir = TempDir::new().unwrap();
        let coordinator = StorageCoordinator::new(dir.path());
        let user = User::new(UserId::new("u2").unwrap(), "User Two");

        // path exists but is not a journal repository
        fs::create_dir_all(dir.path().join("u2_journal")).unwrap();
        let result = coordinator.init_storage(&user);
        assert!(matches!(result, Err(StorageError::NotAJournal(_))));
    }

    #[test]
    fn test_create_topic_commits_once() {
        let (_dir, coordinator, user) = setup();
        let topic = TopicId::new("t1").unwrap();

        let first = coordinator
            .create_topic(&user.id, &topic, "Topic One")
            .unwrap();
        assert!(first.is_some());

        let second = coordinator
            .create_topic(&user.id, &topic, "Topic One")
            .unwrap();
        assert!(second.is_none());

        let history = coordinator.history(&user.id).unwrap();
        assert_eq!(history[0], "Created topic: Topic One");
        assert_eq!(history.len(), 2); // initial + created
        assert!(coordinator.is_clean(&user.id));
    }

    #[test]
    fn test_save_message_auto_creates_topic() {
        let (_dir, coordinator, user) = setup();
        let topic = TopicId::new("42").unwrap();

        coordinator
            .save_message(&user.id, &topic, &record("hi"))
            .unwrap();

        let history = coordinator.history(&user.id).unwrap();
        assert_eq!(
            history,
            vec![
                "Added message to topic: 42".to_string(),
                "Created topic: 42".to_string(),
                "Initial repository structure".to_string(),
            ]
        );

        let records = coordinator.read_messages(&user.id, &topic).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0], record("hi"));
        assert!(coordinator.is_clean(&user.id));
    }

    #[test]
    fn test_save_message_uses_display_name() {
        let (_dir, coordinator, user) = setup();
        let topic = TopicId::new("t1").unwrap();

        coordinator
            .create_topic(&user.id, &topic, "Daily Standup")
            .unwrap();
        coordinator
            .save_message(&user.id, &topic, &record("morning"))
            .unwrap();

        let history = coordinator.history(&user.id).unwrap();
        assert_eq!(history[0], "Added message to topic: Daily Standup");
    }

    #[test]
    fn test_save_message_appends() {
        let (_dir, coordinator, user) = setup();
        let topic = TopicId::new("t1").unwrap();

        for i in 0..3 {
            coordinator
                .save_message(&user.id, &topic, &record(&format!("msg {}", i)))
                .unwrap();
        }

        let records = coordinator.read_messages(&user.id, &topic).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].text, "msg 2");
    }

    #[test]
    fn test_save_attachment_dedup() {
        let (dir, coordinator, user) = setup();
        let topic = TopicId::new("t1").unwrap();
        coordinator
            .create_topic(&user.id, &topic, "Topic One")
            .unwrap();

        let info = AttachmentInfo::new("file-1", "jpg");
        let first = coordinator
            .save_attachment(&user.id, &topic, &info, b"same bytes")
            .unwrap();
        let second = coordinator
            .save_attachment(&user.id, &topic, &info, b"same bytes")
            .unwrap();

        assert_eq!(first, second);

        let attachments_dir = dir.path().join("u1_journal/topics/t1/attachments");
        let stored: Vec<_> = fs::read_dir(attachments_dir).unwrap().collect();
        assert_eq!(stored.len(), 1);

        // only one attachment commit despite two calls
        let history = coordinator.history(&user.id).unwrap();
        assert_eq!(
            history
                .iter()
                .filter(|m| m.starts_with("Added attachment"))
                .count(),
            1
        );
        assert!(coordinator.is_clean(&user.id));
    }

    #[test]
    fn test_save_attachment_unknown_topic_fails() {
        let (_dir, coordinator, user) = setup();
        let topic = TopicId::new("missing").unwrap();
        let info = AttachmentInfo::new("file-1", "jpg");

        let result = coordinator.save_attachment(&user.id, &topic, &info, b"data");
        assert!(matches!(result, Err(StorageError::TopicNotFound(_))));
        assert!(coordinator.is_clean(&user.id));
    }

    #[test]
    fn test_recovery_discards_interrupted_operation() {
        let (dir, coordinator, user) = setup();
        let topic = TopicId::new("t1").unwrap();
        coordinator
            .save_message(&user.id, &topic, &record("committed"))
            .unwrap();

        // simulate a crash between a partial append and its commit
        let log = dir.path().join("u1_journal/topics/t1/messages.log");
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        write!(file, "{{\"timestamp\":\"2024-").unwrap();
        drop(file);
        fs::write(dir.path().join("u1_journal/stray.tmp"), b"junk").unwrap();

        coordinator
            .save_message(&user.id, &topic, &record("after crash"))
            .unwrap();

        let records = coordinator.read_messages(&user.id, &topic).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].text, "after crash");
        assert!(!dir.path().join("u1_journal/stray.tmp").exists());
        assert!(coordinator.is_clean(&user.id));
    }

    #[test]
    fn test_concurrent_saves_across_topics() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(StorageCoordinator::new(dir.path()));
        let user = User::new(UserId::new("u1").unwrap(), "User One");
        coordinator.init_storage(&user).unwrap();

        let n = 4;
        let mut handles = Vec::new();
        for i in 0..n {
            let coordinator = Arc::clone(&coordinator);
            let user_id = user.id.clone();
            handles.push(std::thread::spawn(move || {
                let topic = TopicId::new(format!("topic{}", i)).unwrap();
                coordinator
                    .save_message(&user_id, &topic, &record(&format!("from {}", i)))
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // initial + (create + message) per topic, no lost or merged writes
        let history = coordinator.history(&user.id).unwrap();
        assert_eq!(history.len(), 1 + 2 * n);

        for i in 0..n {
            let topic = TopicId::new(format!("topic{}", i)).unwrap();
            let records = coordinator.read_messages(&user.id, &topic).unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].text, format!("from {}", i));
        }
        assert!(coordinator.is_clean(&user.id));
    }

    #[test]
    fn test_distinct_users_are_independent() {
        let dir = TempDir::new().unwrap();
        let coordinator = StorageCoordinator::new(dir.path());
        let alice = User::new(UserId::new("alice").unwrap(), "Alice");
        let bob = User::new(UserId::new("bob").unwrap(), "Bob");
        coordinator.init_storage(&alice).unwrap();
        coordinator.init_storage(&bob).unwrap();

        let topic = TopicId::new("shared-id").unwrap();
        coordinator
            .save_message(&alice.id, &topic, &record("from alice"))
            .unwrap();

        assert!(coordinator.topic_exists(&alice.id, &topic));
        assert!(!coordinator.topic_exists(&bob.id, &topic));
    }
}
