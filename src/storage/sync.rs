//! Remote synchronization for journal repositories.
//!
//! Two responsibilities: installing the `origin` remote for a journal, and
//! the fetch/rebase/push exchange that keeps local and remote main in a
//! single linear history.
//!
//! Credentials are never embedded in the remote URL or written to git config.
//! The token lives in a process-scoped [`TokenStore`] and is handed to libgit2
//! through a credential callback at invocation time, so it cannot leak into
//! on-disk state or logs.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use git2::{Cred, FetchOptions, PushOptions, RemoteCallbacks, Repository};
use log::{debug, info};
use parking_lot::RwLock;
use thiserror::Error;

use crate::storage::types::GitSignature;

/// errors from remote configuration or the sync exchange
#[derive(Debug, Error)]
pub enum SyncError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// sync was called before configure_remote
    #[error("no remote named 'origin' is configured")]
    RemoteNotConfigured,

    /// the repository spec could not be reduced to an owner/name pair
    #[error("invalid repository spec: {0:?}")]
    InvalidRepoSpec(String),

    /// local and remote history diverge on the same paths
    #[error("rebase conflict: manual resolution required")]
    RebaseConflict,
}

/// An access token for the remote host.
///
/// Deliberately opaque: no `Display`, and `Debug` prints a redaction marker
/// so the secret cannot end up in logs by accident.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([redacted])")
    }
}

impl From<&str> for AccessToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for AccessToken {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

/// Process-scoped secret source read by the credential callback.
///
/// Rebuilt fresh each process start, never persisted.
#[derive(Clone, Default)]
pub struct TokenStore(Arc<RwLock<Option<AccessToken>>>);

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: AccessToken) {
        *self.0.write() = Some(token);
    }

    fn get(&self) -> Option<AccessToken> {
        self.0.read().clone()
    }
}

/// Configures remotes and performs the fetch/rebase/push exchange.
///
/// Callers are expected to hold the repository's coordinator lock across
/// every call here, so the remote exchange cannot interleave with local
/// mutations.
pub struct SyncService {
    token: TokenStore,
    signature: GitSignature,
}

impl Default for SyncService {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncService {
    pub fn new() -> Self {
        Self {
            token: TokenStore::new(),
            signature: GitSignature::chronicler(),
        }
    }

    /// set the signature used for commits created during rebase
    pub fn with_signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    /// Point the journal's `origin` at a hosted repository.
    ///
    /// `repo_spec` is normalized to an owner/name pair (URL prefixes and a
    /// trailing `.git` are stripped); any existing `origin` is replaced. The
    /// remote URL carries no credentials, the token goes into the process
    /// token store instead.
    pub fn configure_remote(
        &self,
        repo_path: &Path,
        repo_spec: &str,
        token: AccessToken,
    ) -> Result<(), SyncError> {
        let normalized = normalize_repo_spec(repo_spec)?;
        let repo = Repository::open(repo_path)?;

        if repo.find_remote("origin").is_ok() {
            repo.remote_delete("origin")?;
        }

        let url = format!("https://github.com/{}.git", normalized);
        repo.remote("origin", &url)?;
        self.token.set(token);

        info!(
            "configured remote origin -> {} for {}",
            url,
            repo_path.display()
        );
        Ok(())
    }

    /// Exchange history with the configured remote.
    ///
    /// Fetches, rebases local main onto the remote's main (pulls are
    /// rebase-only, so history stays linear) and pushes with upstream
    /// tracking. A rebase conflict is aborted, never left mid-rebase, and
    /// surfaced as [`SyncError::RebaseConflict`] for manual resolution.
    /// Transient failures propagate; retry policy belongs to the caller.
    pub fn sync(&self, repo_path: &Path) -> Result<(), SyncError> {
        let repo = Repository::open(repo_path)?;
        if repo.find_remote("origin").is_err() {
            return Err(SyncError::RemoteNotConfigured);
        }

        repo.config()?.set_str("pull.rebase", "true")?;

        {
            let mut remote = repo.find_remote("origin")?;
            let mut options = FetchOptions::new();
            options.remote_callbacks(self.remote_callbacks());
            remote.fetch(
                &["+refs/heads/main:refs/remotes/origin/main"],
                Some(&mut options),
                None,
            )?;
        }

        // a missing remote branch means this is the first push, nothing to replay
        if let Ok(upstream) = repo.refname_to_id("refs/remotes/origin/main") {
            let local = repo.refname_to_id("refs/heads/main")?;
            if local != upstream && repo.merge_base(local, upstream)? != upstream {
                debug!("local main diverged from origin/main, rebasing");
                self.rebase_onto_remote(&repo)?;
            }
        }

        {
            let mut remote = repo.find_remote("origin")?;
            let mut options = PushOptions::new();
            options.remote_callbacks(self.remote_callbacks());
            remote.push(&["refs/heads/main:refs/heads/main"], Some(&mut options))?;
        }

        // upstream tracking for main
        let mut config = repo.config()?;
        config.set_str("branch.main.remote", "origin")?;
        config.set_str("branch.main.merge", "refs/heads/main")?;

        info!("synced {}", repo_path.display());
        Ok(())
    }

    /// replay local main on top of origin/main
    fn rebase_onto_remote(&self, repo: &Repository) -> Result<(), SyncError> {
        let local = repo.reference_to_annotated_commit(&repo.find_reference("refs/heads/main")?)?;
        let upstream =
            repo.reference_to_annotated_commit(&repo.find_reference("refs/remotes/origin/main")?)?;
        let sig = self.signature.to_git2_signature()?;

        let mut rebase = repo.rebase(Some(&local), Some(&upstream), None, None)?;
        while let Some(operation) = rebase.next() {
            if let Err(e) = operation {
                let _ = rebase.abort();
                return Err(SyncError::Git(e));
            }
            if repo.index()?.has_conflicts() {
                // abort so the repository is never left mid-rebase
                rebase.abort()?;
                return Err(SyncError::RebaseConflict);
            }
            match rebase.commit(None, &sig, None) {
                Ok(_) => {}
                // the patch is already present upstream, skip it
                Err(e) if e.code() == git2::ErrorCode::Applied => {}
                Err(e) => {
                    let _ = rebase.abort();
                    return Err(SyncError::Git(e));
                }
            }
        }
        rebase.finish(Some(&sig))?;
        Ok(())
    }

    /// credential callback reading the token store at git-invocation time
    fn remote_callbacks(&self) -> RemoteCallbacks<'static> {
        let token = self.token.clone();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, _allowed| match token.get() {
            Some(secret) => Cred::userpass_plaintext(
                username_from_url.unwrap_or("oauth2"),
                secret.expose(),
            ),
            None => Cred::default(),
        });
        callbacks
    }
}

/// reduce a repository spec to its owner/name pair
pub(crate) fn normalize_repo_spec(spec: &str) -> Result<String, SyncError> {
    let mut s = spec.trim();
    if let Some((_, rest)) = s.split_once("://") {
        // strip scheme and host
        s = rest.split_once('/').map(|(_, path)| path).unwrap_or(rest);
    } else if let Some(rest) = s.strip_prefix("git@") {
        s = rest.split_once(':').map(|(_, path)| path).unwrap_or(rest);
    }
    let s = s.strip_suffix(".git").unwrap_or(s);

    let mut parts = s.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
            Ok(format!("{}/{}", owner, name))
        }
        _ => Err(SyncError::InvalidRepoSpec(spec.to_string())),
    }
}
