//! Remote tree browser
//!
//! Renders one level of a remote repository as an inline action grid.
//! One browser type serves both pickers; `TargetKind` decides where the
//! `Select` action appears.

use std::sync::Arc;

use crate::codec::{CallbackCodec, NavAction};
use crate::providers::{
    normalize_path, parent_path, GitProvider, Listing, ProviderError, RemoteEntry, RepoRef,
    ROOT_PATH,
};
use crate::transport::{InlineButton, ReplyMarkup};

/// Entry buttons per row
pub const ENTRY_ROW_WIDTH: usize = 3;

const BACK_LABEL: &str = "<- Back";
const SELECT_LABEL: &str = "Select";
const SELECT_FOLDER_LABEL: &str = "Select this folder";

/// What the browser lets the user pick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    File,
    Directory,
}

/// One rendered action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionButton {
    pub label: String,
    pub token: String,
}

/// Prompt text plus action rows, ready to send or edit in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserView {
    pub text: String,
    pub rows: Vec<Vec<ActionButton>>,
}

impl BrowserView {
    pub fn markup(&self) -> ReplyMarkup {
        ReplyMarkup::Inline(
            self.rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| InlineButton {
                            text: b.label.clone(),
                            callback_data: b.token.clone(),
                        })
                        .collect()
                })
                .collect(),
        )
    }
}

/// Split items into rows of `width`, keeping order
pub fn chunk_rows<T: Clone>(items: &[T], width: usize) -> Vec<Vec<T>> {
    items.chunks(width.max(1)).map(|c| c.to_vec()).collect()
}

pub struct RemoteTreeBrowser {
    provider: Arc<dyn GitProvider>,
    repo: RepoRef,
    branch: String,
    target: TargetKind,
    codec: CallbackCodec,
}

impl RemoteTreeBrowser {
    pub fn new(
        provider: Arc<dyn GitProvider>,
        repo: RepoRef,
        branch: impl Into<String>,
        target: TargetKind,
        codec: CallbackCodec,
    ) -> Self {
        Self {
            provider,
            repo,
            branch: branch.into(),
            target,
            codec,
        }
    }

    pub fn target(&self) -> TargetKind {
        self.target
    }

    /// Raw listing of `path` on the browsed branch
    pub async fn list(&self, path: &str) -> Result<Listing, ProviderError> {
        self.provider
            .list_directory(&self.repo, &self.branch, &normalize_path(path))
            .await
    }

    /// List `path` and build its view
    pub async fn render(&self, path: &str) -> Result<BrowserView, ProviderError> {
        let path = normalize_path(path);
        match self.list(&path).await? {
            Listing::Directory(entries) => Ok(self.directory_view(&path, entries)),
            Listing::File(_) if self.target == TargetKind::File => Ok(self.file_view(&path)),
            Listing::File(_) => Err(ProviderError::InvalidPath(format!("{} is not a folder", path))),
        }
    }

    fn button(&self, label: impl Into<String>, action: NavAction, path: &str) -> ActionButton {
        ActionButton {
            label: label.into(),
            token: self.codec.encode(action, path),
        }
    }

    fn entry_label(entry: &RemoteEntry) -> String {
        if entry.is_dir() {
            format!("📁  {}", entry.name)
        } else {
            format!("🗎  {}", entry.name)
        }
    }

    /// Directories first, provider order kept within each group
    pub fn directory_view(&self, path: &str, entries: Vec<RemoteEntry>) -> BrowserView {
        let (dirs, files): (Vec<RemoteEntry>, Vec<RemoteEntry>) =
            entries.into_iter().partition(RemoteEntry::is_dir);

        let buttons: Vec<ActionButton> = dirs
            .iter()
            .chain(files.iter())
            .map(|entry| self.button(Self::entry_label(entry), NavAction::Browse, &entry.path))
            .collect();
        let mut rows = chunk_rows(&buttons, ENTRY_ROW_WIDTH);

        if path != ROOT_PATH {
            rows.push(vec![self.button(BACK_LABEL, NavAction::Back, &parent_path(path))]);
        }

        let text = match self.target {
            TargetKind::File => "Choose directory or file.".to_string(),
            TargetKind::Directory => {
                rows.push(vec![self.button(SELECT_FOLDER_LABEL, NavAction::Select, path)]);
                format!("Choose a folder or select the current one: {}", path)
            }
        };

        BrowserView { text, rows }
    }

    pub fn file_view(&self, path: &str) -> BrowserView {
        BrowserView {
            text: format!("Do you want to choose this file: {}", path),
            rows: vec![
                vec![self.button(BACK_LABEL, NavAction::Back, &parent_path(path))],
                vec![self.button(SELECT_LABEL, NavAction::Select, path)],
            ],
        }
    }
}
