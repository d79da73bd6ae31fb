//! Git Hosting Providers Module
//!
//! This module provides the abstraction the core drives to read and mutate a
//! remote repository. Providers implement the `GitProvider` trait, which
//! exposes directory listing plus the object-level write primitives
//! (blob → tree → commit → ref) used by the append engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              GitProvider Trait              │
//! │  identity, list, read, blob/tree/commit/ref │
//! └─────────────────────────────────────────────┘
//!                      │
//!            ┌─────────┴─────────┐
//!            ▼                   ▼
//!       ┌────────┐        ┌────────────┐
//!       │ GitHub │        │ In-memory  │
//!       └────────┘        │  (tests)   │
//!                         └────────────┘
//! ```

pub mod types;
pub mod http_retry;
pub mod github;
#[cfg(test)]
pub mod memory;

pub use types::*;
pub use http_retry::{send_with_retry, RetryPolicy};
pub use github::{GitHubConfig, GitHubProvider};

use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;

/// Unified git hosting provider trait
///
/// `reference` arguments accept a branch name or a commit sha.
#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Display name for logs
    fn display_name(&self) -> String;

    /// Resolve the login of the account the credential belongs to
    async fn resolve_identity(&self) -> Result<String, ProviderError>;

    /// Names of repositories owned by the acting account
    async fn list_repositories(&self) -> Result<Vec<String>, ProviderError>;

    /// Branch names of a repository
    async fn list_branches(&self, repo: &RepoRef) -> Result<Vec<String>, ProviderError>;

    /// List a directory, or describe a single file when `path` is a file
    async fn list_directory(
        &self,
        repo: &RepoRef,
        reference: &str,
        path: &str,
    ) -> Result<Listing, ProviderError>;

    /// Raw file content, `None` when the file does not exist
    async fn read_file(
        &self,
        repo: &RepoRef,
        reference: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError>;

    /// Current tip commit of a branch and its tree
    async fn branch_tip(&self, repo: &RepoRef, branch: &str) -> Result<BranchTip, ProviderError>;

    /// Store raw content, returning the blob sha
    async fn create_blob(&self, repo: &RepoRef, content: &[u8]) -> Result<String, ProviderError>;

    /// Create a tree replacing only the given paths on top of `base_tree`
    async fn create_tree(
        &self,
        repo: &RepoRef,
        base_tree: &str,
        overrides: &[TreeOverride],
    ) -> Result<String, ProviderError>;

    async fn create_commit(
        &self,
        repo: &RepoRef,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String, ProviderError>;

    /// Move `branch` to `new_sha` only if it still points at `expected_sha`.
    ///
    /// Returns `ProviderError::RefConflict` when the branch has moved.
    async fn update_ref(
        &self,
        repo: &RepoRef,
        branch: &str,
        expected_sha: &str,
        new_sha: &str,
    ) -> Result<(), ProviderError>;
}

/// Builds provider instances bound to a user credential
pub trait ProviderFactory: Send + Sync {
    fn connect(&self, credential: &SecretString) -> Result<Arc<dyn GitProvider>, ProviderError>;
}

/// Factory for `GitHubProvider` instances sharing one configuration
pub struct GitHubFactory {
    api_base: String,
}

impl GitHubFactory {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
        }
    }
}

impl ProviderFactory for GitHubFactory {
    fn connect(&self, credential: &SecretString) -> Result<Arc<dyn GitProvider>, ProviderError> {
        let config = GitHubConfig::new(credential.clone()).with_api_base(&self.api_base);
        Ok(Arc::new(GitHubProvider::new(config)?))
    }
}
