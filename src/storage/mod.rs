//! storage layer for Chronicler
//!
//! this module turns normalized message and attachment events into an
//! atomic, append-only, commit-tracked filesystem history, one git
//! repository per user. The upper layers (transports, command handling,
//! the pipeline) use the [`JournalStore`] contract and never touch git2
//! directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      JournalStore                           │
//! │        (public contract: init, topics, messages,            │
//! │              attachments, remote, sync)                     │
//! └─────────────────────────────────────────────────────────────┘
//!               │                               │
//!               ▼                               ▼
//!  ┌─────────────────────────┐       ┌─────────────────────────┐
//!  │   StorageCoordinator    │       │       SyncService       │
//!  │ (per-user lock, atomic  │       │ (remote config, fetch/  │
//!  │   mutate-and-commit)    │       │      rebase/push)       │
//!  └─────────────────────────┘       └─────────────────────────┘
//!         │             │
//!         ▼             ▼
//!  ┌─────────────┐ ┌─────────────┐
//!  │ serializer  │ │   layout    │
//!  │ (log lines) │ │ (paths,     │
//!  │             │ │  metadata)  │
//!  └─────────────┘ └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use chronicler::storage::{GitJournalStore, JournalStore, MessageRecord, TopicId, User, UserId};
//!
//! let store = GitJournalStore::new("./journals");
//! let user = User::new(UserId::new("12345")?, "Alice");
//!
//! store.init_storage(&user)?;
//!
//! let topic = TopicId::new("42")?;
//! let record = MessageRecord::from_parts("hi", metadata)?;
//! store.save_message(&user, &topic, &record)?;
//! ```

mod adapter;
mod coordinator;
mod error;
mod layout;
mod serializer;
mod sync;
mod types;

// Re-export public API
pub use adapter::{GitJournalStore, JournalStore};
pub use coordinator::StorageCoordinator;
pub use error::{StorageError, StorageResult};
pub use layout::{JournalLayout, JournalMetadata, TopicEntry};
pub use serializer::{decode, encode, read_log, MessageRecord, SerializationError};
pub use sync::{AccessToken, SyncError, SyncService, TokenStore};
pub use types::{
    AttachmentInfo, AttachmentRef, CommitId, GitSignature, TopicId, User, UserId,
    ValidationError,
};
