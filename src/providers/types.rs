//! Shared types for git hosting providers
//!
//! This module contains the types shared by every provider implementation:
//! repository coordinates, directory listings, object-level write inputs
//! and the provider error type.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Path used for the repository root in listings and navigation tokens
pub const ROOT_PATH: &str = "/";

/// Kind of a remote tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

/// Remote file/directory entry
///
/// Read-only projection of one provider listing entry. Never persisted;
/// recomputed on every browse call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// File or directory name
    pub name: String,
    /// Path relative to the repository root (no leading slash)
    pub path: String,
    pub kind: EntryKind,
    /// File size in bytes (0 for directories)
    pub size: u64,
}

impl RemoteEntry {
    /// Create a new directory entry
    pub fn directory(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
        }
    }

    /// Create a new file entry
    pub fn file(name: impl Into<String>, path: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind: EntryKind::File,
            size,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Result of listing a path.
///
/// Providers answer a directory path with its entries and a file path with
/// the single file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    Directory(Vec<RemoteEntry>),
    File(RemoteEntry),
}

impl Listing {
    /// Normalize a single entry answer: a directory entry becomes a
    /// one-element directory listing, anything else is a file view.
    pub fn from_single(entry: RemoteEntry) -> Self {
        if entry.is_dir() {
            Listing::Directory(vec![entry])
        } else {
            Listing::File(entry)
        }
    }
}

/// Repository coordinates (`owner/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse a full `owner/name` string
    pub fn parse(full_name: &str) -> Result<Self, ProviderError> {
        let trimmed = full_name.trim();
        match trimmed.split_once('/') {
            Some((owner, name))
                if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(ProviderError::InvalidPath(format!(
                "Repository must be owner/name, got '{}'",
                trimmed
            ))),
        }
    }

    /// Qualify a bare repository name with the account login.
    /// Input that already carries an owner is parsed as-is.
    pub fn qualify(input: &str, login: &str) -> Result<Self, ProviderError> {
        let trimmed = input.trim();
        if trimmed.contains('/') {
            return Self::parse(trimmed);
        }
        if trimmed.is_empty() {
            return Err(ProviderError::InvalidPath("Repository name is empty".to_string()));
        }
        Ok(Self::new(login, trimmed))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Head of a branch as read before a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTip {
    pub commit_sha: String,
    pub tree_sha: String,
}

/// Single blob placed on top of a base tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeOverride {
    /// Path relative to the repository root
    pub path: String,
    pub blob_sha: String,
}

/// Normalize a user- or provider-supplied path.
///
/// The root is `/`; every other path is relative with no leading or
/// trailing slash (`notes/daily.md`).
pub fn normalize_path(path: &str) -> String {
    let replaced = path.trim().replace('\\', "/");
    let parts: Vec<&str> = replaced
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if parts.is_empty() {
        ROOT_PATH.to_string()
    } else {
        parts.join("/")
    }
}

/// Textual parent directory. The parent of a root-level path, and of the
/// root itself, is the root.
pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(pos) => normalized[..pos].to_string(),
        None => ROOT_PATH.to_string(),
    }
}

/// Join a folder and a file name into a root-relative path
pub fn join_path(folder: &str, name: &str) -> String {
    let folder = normalize_path(folder);
    let name = name.trim_matches('/');
    if folder == ROOT_PATH {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}

/// How the core reacts to a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad credential or unknown repository/branch/path: re-prompt
    InputValidation,
    /// Network or server failure: generic retry message
    Unavailable,
    /// Branch moved between read and write
    Conflict,
}

/// Provider error type
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Branch '{branch}' moved: expected {expected}")]
    RefConflict { branch: String, expected: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Map this error onto the core error taxonomy
    pub fn classify(&self) -> ErrorClass {
        match self {
            ProviderError::AuthenticationFailed(_)
            | ProviderError::NotFound(_)
            | ProviderError::InvalidPath(_) => ErrorClass::InputValidation,
            ProviderError::RefConflict { .. } => ErrorClass::Conflict,
            ProviderError::ConnectionFailed(_)
            | ProviderError::ServerError(_)
            | ProviderError::ParseError(_)
            | ProviderError::Other(_) => ErrorClass::Unavailable,
        }
    }
}

/// Maximum length of an API error body carried into an error message
const API_ERROR_MAX_LEN: usize = 200;

/// Trim an API error body for logs and user-facing messages and mask
/// anything that looks like a GitHub token.
pub fn sanitize_api_error(body: &str) -> String {
    let masked: Vec<String> = body
        .split_whitespace()
        .map(|word| {
            let bare = word.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_');
            if bare.starts_with("ghp_") || bare.starts_with("gho_") || bare.starts_with("github_pat_") {
                "***".to_string()
            } else {
                word.to_string()
            }
        })
        .collect();
    let joined = masked.join(" ");
    if joined.chars().count() > API_ERROR_MAX_LEN {
        let cut: String = joined.chars().take(API_ERROR_MAX_LEN).collect();
        format!("{}...", cut)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_path_reaches_root() {
        assert_eq!(parent_path("a/b"), "a");
        assert_eq!(parent_path(&parent_path("a/b")), "/");
        assert_eq!(parent_path("/"), "/");
        assert_eq!(parent_path("notes.md"), "/");
        assert_eq!(parent_path("/a/b/c/"), "a/b");
    }

    #[test]
    fn test_normalize_and_join() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("//docs//daily/"), "docs/daily");
        assert_eq!(normalize_path("docs\\img"), "docs/img");
        assert_eq!(join_path("/", "a.jpg"), "a.jpg");
        assert_eq!(join_path("assets/", "a.jpg"), "assets/a.jpg");
    }

    #[test]
    fn test_repo_ref_qualify() {
        let repo = RepoRef::qualify("notes", "octo").unwrap();
        assert_eq!(repo.full_name(), "octo/notes");
        let repo = RepoRef::qualify("team/wiki", "octo").unwrap();
        assert_eq!(repo.full_name(), "team/wiki");
        assert!(RepoRef::qualify("  ", "octo").is_err());
        assert!(RepoRef::parse("a/b/c").is_err());
    }

    #[test]
    fn test_listing_from_single() {
        let dir = Listing::from_single(RemoteEntry::directory("d", "d"));
        assert!(matches!(dir, Listing::Directory(ref e) if e.len() == 1));
        let file = Listing::from_single(RemoteEntry::file("f.md", "f.md", 3));
        assert!(matches!(file, Listing::File(_)));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(ProviderError::NotFound("x".into()).classify(), ErrorClass::InputValidation);
        assert_eq!(ProviderError::Other("x".into()).classify(), ErrorClass::Unavailable);
        let conflict = ProviderError::RefConflict { branch: "main".into(), expected: "abc".into() };
        assert_eq!(conflict.classify(), ErrorClass::Conflict);
    }

    #[test]
    fn test_sanitize_api_error_masks_tokens() {
        let body = "Bad credentials for ghp_abcdef123 please retry";
        let cleaned = sanitize_api_error(body);
        assert!(!cleaned.contains("ghp_abcdef123"));
        assert!(cleaned.contains("***"));
        let long = "x".repeat(500);
        assert!(sanitize_api_error(&long).ends_with("..."));
    }
}
