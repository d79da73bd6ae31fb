//! In-memory git provider for tests
//!
//! Content-addressed object store (SHA-1 over a typed header, like git) with
//! branches, compare-and-swap ref updates, and a hook that lets a test play
//! a foreign writer moving a branch right before the next ref update.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::{
    normalize_path, BranchTip, GitProvider, Listing, ProviderError, ProviderFactory, RemoteEntry,
    RepoRef, TreeOverride, ROOT_PATH,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Blob,
    Tree,
}

#[derive(Debug, Clone)]
struct TreeItem {
    kind: ItemKind,
    sha: String,
}

#[derive(Debug, Clone)]
enum Object {
    Blob(Vec<u8>),
    Tree(BTreeMap<String, TreeItem>),
    Commit {
        tree: String,
        parents: Vec<String>,
        message: String,
    },
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Object>,
    /// full repo name -> branch -> commit sha
    repos: BTreeMap<String, BTreeMap<String, String>>,
    foreign_writes: Vec<(String, String, String, Vec<u8>)>,
    ref_updates: usize,
}

impl State {
    fn store(&mut self, object: Object) -> String {
        let mut hasher = Sha1::new();
        match &object {
            Object::Blob(bytes) => {
                hasher.update(format!("blob {}\0", bytes.len()));
                hasher.update(bytes);
            }
            Object::Tree(items) => {
                hasher.update(b"tree\0");
                for (name, item) in items {
                    hasher.update(format!("{:?} {} {}\n", item.kind, name, item.sha));
                }
            }
            Object::Commit { tree, parents, message } => {
                hasher.update(format!("commit\0{}\n{}\n{}", tree, parents.join(","), message));
            }
        }
        let sha = hex::encode(hasher.finalize());
        self.objects.insert(sha.clone(), object);
        sha
    }

    fn tree(&self, sha: &str) -> Result<&BTreeMap<String, TreeItem>, ProviderError> {
        match self.objects.get(sha) {
            Some(Object::Tree(items)) => Ok(items),
            _ => Err(ProviderError::NotFound(format!("tree {}", sha))),
        }
    }

    fn commit_tree(&self, sha: &str) -> Result<String, ProviderError> {
        match self.objects.get(sha) {
            Some(Object::Commit { tree, .. }) => Ok(tree.clone()),
            _ => Err(ProviderError::NotFound(format!("commit {}", sha))),
        }
    }

    fn branches(&self, repo: &RepoRef) -> Result<&BTreeMap<String, String>, ProviderError> {
        self.repos
            .get(&repo.full_name())
            .ok_or_else(|| ProviderError::NotFound(format!("repository {}", repo)))
    }

    fn resolve_commit(&self, repo: &RepoRef, reference: &str) -> Result<String, ProviderError> {
        if let Some(sha) = self.branches(repo)?.get(reference) {
            return Ok(sha.clone());
        }
        if matches!(self.objects.get(reference), Some(Object::Commit { .. })) {
            return Ok(reference.to_string());
        }
        Err(ProviderError::NotFound(format!("reference {}", reference)))
    }

    /// Walk to `path` from the root tree, returning the item found there
    fn lookup(&self, root_tree: &str, path: &str) -> Result<Option<TreeItem>, ProviderError> {
        let normalized = normalize_path(path);
        if normalized == ROOT_PATH {
            return Ok(Some(TreeItem { kind: ItemKind::Tree, sha: root_tree.to_string() }));
        }
        let mut current = TreeItem { kind: ItemKind::Tree, sha: root_tree.to_string() };
        for part in normalized.split('/') {
            if current.kind != ItemKind::Tree {
                return Ok(None);
            }
            match self.tree(&current.sha)?.get(part) {
                Some(item) => current = item.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn insert_path(
        &mut self,
        tree_sha: Option<&str>,
        parts: &[&str],
        blob_sha: &str,
    ) -> Result<String, ProviderError> {
        let mut items = match tree_sha {
            Some(sha) => self.tree(sha)?.clone(),
            None => BTreeMap::new(),
        };
        let (head, rest) = parts
            .split_first()
            .ok_or_else(|| ProviderError::InvalidPath("empty tree path".to_string()))?;
        if rest.is_empty() {
            items.insert(head.to_string(), TreeItem { kind: ItemKind::Blob, sha: blob_sha.to_string() });
        } else {
            let child = items
                .get(*head)
                .filter(|i| i.kind == ItemKind::Tree)
                .map(|i| i.sha.clone());
            let child_sha = self.insert_path(child.as_deref(), rest, blob_sha)?;
            items.insert(head.to_string(), TreeItem { kind: ItemKind::Tree, sha: child_sha });
        }
        Ok(self.store(Object::Tree(items)))
    }

    fn apply_overrides(&mut self, base_tree: &str, overrides: &[TreeOverride]) -> Result<String, ProviderError> {
        let mut root = base_tree.to_string();
        for o in overrides {
            let normalized = normalize_path(&o.path);
            let parts: Vec<&str> = normalized.split('/').collect();
            root = self.insert_path(Some(&root), &parts, &o.blob_sha)?;
        }
        Ok(root)
    }

    fn commit_files(&mut self, repo: &str, branch: &str, files: &[(&str, &[u8])], message: &str) -> String {
        let parent = self.repos.get(repo).and_then(|b| b.get(branch)).cloned();
        let base = match &parent {
            Some(sha) => self.commit_tree(sha).unwrap_or_default(),
            None => self.store(Object::Tree(BTreeMap::new())),
        };
        let overrides: Vec<TreeOverride> = files
            .iter()
            .map(|(path, content)| TreeOverride {
                path: path.to_string(),
                blob_sha: self.store(Object::Blob(content.to_vec())),
            })
            .collect();
        let tree = self.apply_overrides(&base, &overrides).unwrap_or(base);
        let commit = self.store(Object::Commit {
            tree,
            parents: parent.into_iter().collect(),
            message: message.to_string(),
        });
        self.repos
            .entry(repo.to_string())
            .or_default()
            .insert(branch.to_string(), commit.clone());
        commit
    }
}

/// Shared in-memory repository host
#[derive(Clone)]
pub struct MemoryGitProvider {
    login: String,
    state: Arc<Mutex<State>>,
}

impl MemoryGitProvider {
    pub fn new(login: &str) -> Self {
        Self {
            login: login.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create (or extend) `repo` with one commit on `branch` holding `files`.
    /// Directories are implied by the paths.
    pub fn seed(&self, repo: &str, branch: &str, files: &[(&str, &str)]) -> String {
        let files: Vec<(&str, &[u8])> = files.iter().map(|(p, c)| (*p, c.as_bytes())).collect();
        self.lock().commit_files(repo, branch, &files, "seed")
    }

    /// Commit `content` at `path` on the branch right before the next ref
    /// update, as if another client had pushed in the meantime. Each armed
    /// write fires once, in arming order.
    pub fn arm_foreign_write(&self, repo: &str, branch: &str, path: &str, content: &str) {
        self.lock().foreign_writes.push((
            repo.to_string(),
            branch.to_string(),
            path.to_string(),
            content.as_bytes().to_vec(),
        ));
    }

    pub fn head(&self, repo: &str, branch: &str) -> Option<String> {
        self.lock().repos.get(repo).and_then(|b| b.get(branch)).cloned()
    }

    pub fn parents(&self, commit: &str) -> Vec<String> {
        match self.lock().objects.get(commit) {
            Some(Object::Commit { parents, .. }) => parents.clone(),
            _ => Vec::new(),
        }
    }

    pub fn commit_message(&self, commit: &str) -> Option<String> {
        match self.lock().objects.get(commit) {
            Some(Object::Commit { message, .. }) => Some(message.clone()),
            _ => None,
        }
    }

    /// Content of `path` at the branch head
    pub fn file(&self, repo: &str, branch: &str, path: &str) -> Option<String> {
        let state = self.lock();
        let head = state.repos.get(repo)?.get(branch)?.clone();
        let tree = state.commit_tree(&head).ok()?;
        let item = state.lookup(&tree, path).ok()??;
        match state.objects.get(&item.sha) {
            Some(Object::Blob(bytes)) => String::from_utf8(bytes.clone()).ok(),
            _ => None,
        }
    }

    pub fn ref_updates(&self) -> usize {
        self.lock().ref_updates
    }
}

#[async_trait]
impl GitProvider for MemoryGitProvider {
    fn display_name(&self) -> String {
        "memory".to_string()
    }

    async fn resolve_identity(&self) -> Result<String, ProviderError> {
        Ok(self.login.clone())
    }

    async fn list_repositories(&self) -> Result<Vec<String>, ProviderError> {
        let prefix = format!("{}/", self.login);
        Ok(self
            .lock()
            .repos
            .keys()
            .filter_map(|full| full.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn list_branches(&self, repo: &RepoRef) -> Result<Vec<String>, ProviderError> {
        Ok(self.lock().branches(repo)?.keys().cloned().collect())
    }

    async fn list_directory(
        &self,
        repo: &RepoRef,
        reference: &str,
        path: &str,
    ) -> Result<Listing, ProviderError> {
        let state = self.lock();
        let commit = state.resolve_commit(repo, reference)?;
        let root = state.commit_tree(&commit)?;
        let normalized = normalize_path(path);
        let item = state
            .lookup(&root, &normalized)?
            .ok_or_else(|| ProviderError::NotFound(normalized.clone()))?;
        match item.kind {
            ItemKind::Tree => {
                let entries = state
                    .tree(&item.sha)?
                    .iter()
                    .map(|(name, child)| {
                        let child_path = if normalized == ROOT_PATH {
                            name.clone()
                        } else {
                            format!("{}/{}", normalized, name)
                        };
                        match child.kind {
                            ItemKind::Tree => RemoteEntry::directory(name.clone(), child_path),
                            ItemKind::Blob => {
                                let size = match state.objects.get(&child.sha) {
                                    Some(Object::Blob(b)) => b.len() as u64,
                                    _ => 0,
                                };
                                RemoteEntry::file(name.clone(), child_path, size)
                            }
                        }
                    })
                    .collect();
                Ok(Listing::Directory(entries))
            }
            ItemKind::Blob => {
                let name = normalized.rsplit('/').next().unwrap_or(&normalized).to_string();
                Ok(Listing::File(RemoteEntry::file(name, normalized.clone(), 0)))
            }
        }
    }

    async fn read_file(
        &self,
        repo: &RepoRef,
        reference: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        let state = self.lock();
        let commit = state.resolve_commit(repo, reference)?;
        let root = state.commit_tree(&commit)?;
        match state.lookup(&root, path)? {
            Some(item) => match state.objects.get(&item.sha) {
                Some(Object::Blob(bytes)) => Ok(Some(bytes.clone())),
                _ => Err(ProviderError::InvalidPath(format!("{} is not a file", path))),
            },
            None => Ok(None),
        }
    }

    async fn branch_tip(&self, repo: &RepoRef, branch: &str) -> Result<BranchTip, ProviderError> {
        tokio::task::yield_now().await;
        let state = self.lock();
        let commit_sha = state
            .branches(repo)?
            .get(branch)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("branch {}", branch)))?;
        let tree_sha = state.commit_tree(&commit_sha)?;
        Ok(BranchTip { commit_sha, tree_sha })
    }

    async fn create_blob(&self, _repo: &RepoRef, content: &[u8]) -> Result<String, ProviderError> {
        Ok(self.lock().store(Object::Blob(content.to_vec())))
    }

    async fn create_tree(
        &self,
        _repo: &RepoRef,
        base_tree: &str,
        overrides: &[TreeOverride],
    ) -> Result<String, ProviderError> {
        tokio::task::yield_now().await;
        self.lock().apply_overrides(base_tree, overrides)
    }

    async fn create_commit(
        &self,
        _repo: &RepoRef,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String, ProviderError> {
        Ok(self.lock().store(Object::Commit {
            tree: tree_sha.to_string(),
            parents: parents.to_vec(),
            message: message.to_string(),
        }))
    }

    async fn update_ref(
        &self,
        repo: &RepoRef,
        branch: &str,
        expected_sha: &str,
        new_sha: &str,
    ) -> Result<(), ProviderError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if !state.foreign_writes.is_empty() {
            let (r, b, path, content) = state.foreign_writes.remove(0);
            state.commit_files(&r, &b, &[(path.as_str(), content.as_slice())], "foreign write");
        }
        let full = repo.full_name();
        let current = state
            .repos
            .get(&full)
            .and_then(|b| b.get(branch))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("branch {}", branch)))?;
        if current != expected_sha {
            return Err(ProviderError::RefConflict {
                branch: branch.to_string(),
                expected: expected_sha.to_string(),
            });
        }
        state.ref_updates += 1;
        state
            .repos
            .entry(full)
            .or_default()
            .insert(branch.to_string(), new_sha.to_string());
        Ok(())
    }
}

/// Factory handing out the shared in-memory host for one accepted token
pub struct MemoryFactory {
    provider: MemoryGitProvider,
    token: String,
}

impl MemoryFactory {
    pub fn new(provider: MemoryGitProvider, token: &str) -> Self {
        Self {
            provider,
            token: token.to_string(),
        }
    }
}

impl ProviderFactory for MemoryFactory {
    fn connect(&self, credential: &SecretString) -> Result<Arc<dyn GitProvider>, ProviderError> {
        if credential.expose_secret() != self.token {
            return Err(ProviderError::AuthenticationFailed("Bad credentials".to_string()));
        }
        Ok(Arc::new(self.provider.clone()))
    }
}
