//! Chronicler - a Git-backed archive for conversation-platform messages
//!
//! This crate turns normalized message and attachment events into durable,
//! version-controlled per-user journals. Every mutation is a commit, every
//! topic is a directory with an append-only log, and the full archive
//! history is preserved in `.git/` and kept in sync with a remote.
//!
//! # Example
//!
//! ```no_run
//! use chronicler::storage::{GitJournalStore, JournalStore, TopicId, User, UserId};
//!
//! let store = GitJournalStore::new("./journals");
//! let user = User::new(UserId::new("12345").unwrap(), "Alice");
//! store.init_storage(&user).unwrap();
//! store
//!     .create_topic(&user, &TopicId::new("42").unwrap(), "General")
//!     .unwrap();
//! ```

pub mod config;
pub mod storage;
