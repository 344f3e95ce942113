//! core type-safe wrappers for the journal storage layer.

use std::fmt;
use std::fmt::Formatter;

use git2::Oid;
use serde::{Deserialize, Serialize};

/// This makes sure we don't accidentally pass some other git object id where
/// a commit id is expected. The inner Oid stays private to the storage module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    /// parse CommitId from a hex string
    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(CommitId)
    }

    /// short form of the commit ID
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated user identifier.
///
/// The id becomes part of the journal directory name (`<id>_journal`), so it
/// is restricted to characters that are safe on every filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// create a new UserId, validating the input
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        validate_identifier(&id, 64)?;
        Ok(Self(id))
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The owner of a journal. Each user owns exactly one repository under the
/// storage base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A validated topic identifier.
///
/// Topic ids are derived from the source thread id and become directory names
/// under `topics/`, so the same filesystem restrictions apply as for user ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicId(String);

impl TopicId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        validate_identifier(&id, 128)?;
        Ok(Self(id))
    }

    /// get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TopicId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_identifier(value: &str, max_len: usize) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty);
    }

    if value.len() > max_len {
        return Err(ValidationError::TooLong(value.len()));
    }

    for (i, c) in value.chars().enumerate() {
        // alphanumeric, underscore, hyphen allowed
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
            return Err(ValidationError::InvalidCharacter { char: c, position: i });
        }
    }

    Ok(())
}

/// Caller-supplied description of an attachment about to be stored.
///
/// The source file id is kept for reference in logs, the extension decides
/// the suffix of the content-addressed filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub file_id: String,
    pub extension: String,
}

impl AttachmentInfo {
    pub fn new(file_id: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            extension: extension.into(),
        }
    }

    /// normalized extension used for the stored filename
    ///
    /// strips a leading dot and the `x-` MIME subtype prefix, maps `jpeg`
    /// to `jpg`, and lowercases the rest
    pub fn normalized_extension(&self) -> String {
        let ext = self.extension.trim_start_matches('.').to_lowercase();
        let ext = ext.strip_prefix("x-").unwrap_or(&ext);
        match ext {
            "jpeg" => "jpg".to_string(),
            other => other.to_string(),
        }
    }
}

/// Reference to a stored attachment, returned by `save_attachment` and meant
/// to be embedded in a message record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// content id (hex digest of the attachment bytes)
    pub content_id: String,
    /// path relative to the journal root, e.g. `topics/42/attachments/ab12..cd.jpg`
    pub path: String,
}

/// git signature (author/committer info)
#[derive(Debug, Clone)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    /// create a new signature
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// default signature for journal commits
    pub fn chronicler() -> Self {
        Self::new("Chronicler", "chronicler@localhost")
    }

    /// convert to git2::Signature
    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::chronicler()
    }
}

/// error type for malformed ids and names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty,
    TooLong(usize),
    InvalidCharacter { char: char, position: usize },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "identifier cannot be empty"),
            Self::TooLong(len) => write!(f, "identifier too long: {} characters", len),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
        }
    }
}

impl std::error::Error for ValidationError {}
