//! Append engine
//!
//! Writes notes and assets to the remote tree at the object level:
//! blob → tree (one path overridden on the tip tree) → commit (tip as only
//! parent) → compare-and-swap ref update. A moved branch restarts the whole
//! sequence from a fresh tip, up to `MAX_REF_ATTEMPTS` times.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::error::NotesError;
use crate::providers::{join_path, GitProvider, ProviderError, ProviderFactory, RepoRef, TreeOverride};
use crate::store::UserAccount;
use crate::transport::AttachmentKind;

/// Read-modify-write attempts before a conflict is surfaced
pub const MAX_REF_ATTEMPTS: usize = 3;

pub const NOTE_COMMIT_MESSAGE: &str = "Append note from telegram";
const ASSET_FILE_PREFIX: &str = "from_telegram";

/// Result of a successful mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub commit_sha: String,
    /// Path written, relative to the repository root
    pub path: String,
    /// Attempts used, 1 when the first ref update succeeded
    pub attempts: usize,
}

/// One async mutex per (repository, branch)
#[derive(Default)]
pub struct BranchLocks {
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, repo: &RepoRef, branch: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry((repo.full_name(), branch.to_string()))
                .or_default(),
        )
    }
}

/// New note file content: previous content, a newline, then the note
pub fn append_text(previous: &str, text: &str) -> String {
    format!("{}\n{}", previous, text)
}

/// Commit message for an uploaded attachment
pub fn asset_commit_message(kind: AttachmentKind, file_name: &str) -> String {
    let what = match kind {
        AttachmentKind::Photo => "photo",
        AttachmentKind::Document => "file",
    };
    format!("Upload {} from telegram: {}", what, file_name)
}

/// Asset file name stamped with `now` (UTC, second resolution)
pub fn asset_file_name(now: DateTime<Utc>, extension: &str) -> String {
    format!(
        "{}_{}.{}",
        ASSET_FILE_PREFIX,
        now.format("%Y%m%d_%H%M%S"),
        extension.trim_start_matches('.')
    )
}

enum Change<'a> {
    Append { path: &'a str, text: &'a str },
    Put { path: String, content: &'a [u8] },
}

impl Change<'_> {
    fn path(&self) -> &str {
        match self {
            Change::Append { path, .. } => *path,
            Change::Put { path, .. } => path.as_str(),
        }
    }
}

pub struct NoteAppender {
    factory: Arc<dyn ProviderFactory>,
    locks: BranchLocks,
}

impl NoteAppender {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            locks: BranchLocks::new(),
        }
    }

    /// Append `text` as a new line of the account's note file
    pub async fn append_note(&self, account: &UserAccount, text: &str) -> Result<CommitOutcome, NotesError> {
        let change = Change::Append {
            path: &account.note_path,
            text,
        };
        self.commit_change(account, change, NOTE_COMMIT_MESSAGE.to_string()).await
    }

    /// Store `bytes` in the account's assets folder under a time-stamped name
    pub async fn upload_asset(
        &self,
        account: &UserAccount,
        bytes: &[u8],
        extension: &str,
        kind: AttachmentKind,
    ) -> Result<CommitOutcome, NotesError> {
        let name = asset_file_name(Utc::now(), extension);
        self.upload_asset_named(account, bytes, &name, kind).await
    }

    pub async fn upload_asset_named(
        &self,
        account: &UserAccount,
        bytes: &[u8],
        file_name: &str,
        kind: AttachmentKind,
    ) -> Result<CommitOutcome, NotesError> {
        let change = Change::Put {
            path: join_path(&account.assets_folder, file_name),
            content: bytes,
        };
        self.commit_change(account, change, asset_commit_message(kind, file_name))
            .await
    }

    async fn commit_change(
        &self,
        account: &UserAccount,
        change: Change<'_>,
        message: String,
    ) -> Result<CommitOutcome, NotesError> {
        let provider = self.factory.connect(&account.credential)?;
        let repo = RepoRef::parse(&account.repository)?;
        let branch = account.branch.as_str();

        let lock = self.locks.lock_for(&repo, branch);
        let _guard = lock.lock().await;

        for attempt in 1..=MAX_REF_ATTEMPTS {
            match self
                .try_commit(provider.as_ref(), &repo, branch, &change, &message)
                .await
            {
                Ok(commit_sha) => {
                    info!(
                        "Committed {} to {}@{} as {} (attempt {})",
                        change.path(),
                        repo,
                        branch,
                        commit_sha,
                        attempt
                    );
                    return Ok(CommitOutcome {
                        commit_sha,
                        path: change.path().to_string(),
                        attempts: attempt,
                    });
                }
                Err(ProviderError::RefConflict { .. }) => {
                    warn!(
                        "Branch {}@{} moved during write, attempt {}/{}",
                        repo, branch, attempt, MAX_REF_ATTEMPTS
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(NotesError::ConcurrentMutationConflict {
            branch: branch.to_string(),
            attempts: MAX_REF_ATTEMPTS,
        })
    }

    /// One read-modify-write pass, returning the new commit sha
    async fn try_commit(
        &self,
        provider: &dyn GitProvider,
        repo: &RepoRef,
        branch: &str,
        change: &Change<'_>,
        message: &str,
    ) -> Result<String, ProviderError> {
        let tip = provider.branch_tip(repo, branch).await?;

        let content = match change {
            Change::Append { path, text } => {
                let previous = match provider.read_file(repo, &tip.commit_sha, path).await? {
                    Some(bytes) => String::from_utf8(bytes).map_err(|_| {
                        ProviderError::InvalidPath(format!("{} is not a UTF-8 text file", path))
                    })?,
                    None => String::new(),
                };
                append_text(&previous, text).into_bytes()
            }
            Change::Put { content, .. } => content.to_vec(),
        };

        let blob_sha = provider.create_blob(repo, &content).await?;
        let tree_sha = provider
            .create_tree(
                repo,
                &tip.tree_sha,
                &[TreeOverride {
                    path: change.path().to_string(),
                    blob_sha,
                }],
            )
            .await?;
        let commit_sha = provider
            .create_commit(repo, message, &tree_sha, std::slice::from_ref(&tip.commit_sha))
            .await?;
        provider
            .update_ref(repo, branch, &tip.commit_sha, &commit_sha)
            .await?;
        Ok(commit_sha)
    }
}
