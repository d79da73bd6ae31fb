//! GitHub Provider
//!
//! Implements GitProvider for GitHub using the REST API v3.
//! Uses a personal access token (Bearer) for authentication.
//!
//! API Base: https://api.github.com
//! Listing: `GET /repos/{owner}/{repo}/contents/{path}?ref=...`
//! Writes: git data API (blobs, trees, commits, refs)

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{
    normalize_path, sanitize_api_error, send_with_retry, BranchTip, GitProvider, RetryPolicy,
    Listing, ProviderError, RemoteEntry, RepoRef, TreeOverride, ROOT_PATH,
};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("telenotes/", env!("CARGO_PKG_VERSION"));
const PER_PAGE: usize = 100;
/// Hard stop for paginated listings (repositories, branches)
const MAX_PAGES: usize = 10;
const FILE_MODE: &str = "100644";

fn github_log(msg: &str) {
    info!("[GITHUB] {}", msg);
}

// ─── API Response Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhNamed {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhContent {
    #[serde(rename = "type")]
    kind: String, // "dir", "file", "symlink", "submodule"
    name: String,
    path: String,
    #[serde(default)]
    size: u64,
    sha: String,
    content: Option<String>,
    encoding: Option<String>,
}

/// The contents endpoint returns an array for directories and an object
/// for anything else.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentsPayload {
    Many(Vec<GhContent>),
    One(GhContent),
}

#[derive(Debug, Deserialize)]
struct GhObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    object: GhObject,
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    tree: GhObject,
}

#[derive(Debug, Deserialize)]
struct GhBlob {
    content: String,
    encoding: String,
}

// ─── Config ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: SecretString,
    pub api_base: String,
}

impl GitHubConfig {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }
}

// ─── Provider ────────────────────────────────────────────────────────────

pub struct GitHubProvider {
    config: GitHubConfig,
    client: reqwest::Client,
}

impl GitHubProvider {
    pub fn new(config: GitHubConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .connect_timeout(std::time::Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::ConnectionFailed(format!("HTTP client init failed: {}", e)))?;
        Ok(Self { config, client })
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    fn auth_header(&self) -> Result<HeaderValue, ProviderError> {
        HeaderValue::from_str(&format!("Bearer {}", self.config.token.expose_secret()))
            .map_err(|e| {
                ProviderError::AuthenticationFailed(format!("Invalid characters in token: {}", e))
            })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    fn repo_url(&self, repo: &RepoRef, path: &str) -> String {
        self.api_url(&format!(
            "/repos/{}/{}{}",
            urlencoding::encode(&repo.owner),
            urlencoding::encode(&repo.name),
            path
        ))
    }

    /// Percent-encode each segment, keeping `/` separators
    fn encode_segments(path: &str) -> String {
        path.split('/')
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn request(&self, method: reqwest::Method, url: &str) -> Result<reqwest::RequestBuilder, ProviderError> {
        Ok(self
            .client
            .request(method, url)
            .header(AUTHORIZATION, self.auth_header()?)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION))
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, ProviderError> {
        let request = self
            .request(reqwest::Method::GET, url)?
            .build()
            .map_err(|e| ProviderError::ConnectionFailed(format!("Build request failed: {}", e)))?;
        send_with_retry(&self.client, request, &RetryPolicy::default())
            .await
            .map_err(|e| ProviderError::ConnectionFailed(format!("Request failed: {}", e)))
    }

    /// Object creation is content-addressed, so repeating it is harmless
    async fn post_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let request = self
            .request(reqwest::Method::POST, url)?
            .json(body)
            .build()
            .map_err(|e| ProviderError::ConnectionFailed(format!("Build request failed: {}", e)))?;
        send_with_retry(&self.client, request, &RetryPolicy::default())
            .await
            .map_err(|e| ProviderError::ConnectionFailed(format!("Request failed: {}", e)))
    }

    /// Turn a non-success response into a `ProviderError`
    async fn error_for(context: &str, response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        map_status(context, status, &sanitize_api_error(&body))
    }

    async fn parse_json<T: DeserializeOwned>(
        context: &str,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        if !response.status().is_success() {
            return Err(Self::error_for(context, response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(format!("{}: {}", context, e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, context: &str, url: &str) -> Result<T, ProviderError> {
        let response = self.get_with_retry(url).await?;
        Self::parse_json(context, response).await
    }

    /// Collect every page of a `?per_page=` listing of named objects
    async fn list_names(&self, context: &str, base_url: &str) -> Result<Vec<String>, ProviderError> {
        let separator = if base_url.contains('?') { '&' } else { '?' };
        let mut names = Vec::new();
        for page in 1..=MAX_PAGES {
            let url = format!("{}{}per_page={}&page={}", base_url, separator, PER_PAGE, page);
            let batch: Vec<GhNamed> = self.get_json(context, &url).await?;
            let done = batch.len() < PER_PAGE;
            names.extend(batch.into_iter().map(|n| n.name));
            if done {
                break;
            }
        }
        Ok(names)
    }

    fn contents_url(&self, repo: &RepoRef, reference: &str, path: &str) -> String {
        let normalized = normalize_path(path);
        let encoded = if normalized == ROOT_PATH {
            String::new()
        } else {
            Self::encode_segments(&normalized)
        };
        format!(
            "{}?ref={}",
            self.repo_url(repo, &format!("/contents/{}", encoded)),
            urlencoding::encode(reference)
        )
    }

    fn to_remote_entry(content: &GhContent) -> RemoteEntry {
        if content.kind == "dir" {
            RemoteEntry::directory(content.name.clone(), content.path.clone())
        } else {
            RemoteEntry::file(content.name.clone(), content.path.clone(), content.size)
        }
    }

    async fn read_blob(&self, repo: &RepoRef, sha: &str) -> Result<Vec<u8>, ProviderError> {
        let url = self.repo_url(repo, &format!("/git/blobs/{}", sha));
        let blob: GhBlob = self.get_json("Read blob", &url).await?;
        if blob.encoding != "base64" {
            return Ok(blob.content.into_bytes());
        }
        decode_base64_content(&blob.content)
    }
}

/// Map an HTTP status to the provider error taxonomy
fn map_status(context: &str, status: StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        401 => ProviderError::AuthenticationFailed(format!("{}: {}", context, body)),
        403 if body.to_ascii_lowercase().contains("rate limit") => {
            ProviderError::ServerError(format!("{}: rate limited", context))
        }
        403 => ProviderError::AuthenticationFailed(format!("{}: {}", context, body)),
        404 => ProviderError::NotFound(format!("{}: {}", context, body)),
        422 => ProviderError::InvalidPath(format!("{}: {}", context, body)),
        s if s >= 500 => ProviderError::ServerError(format!("{} ({}): {}", context, status, body)),
        _ => ProviderError::Other(format!("{} ({}): {}", context, status, body)),
    }
}

/// GitHub wraps base64 content at 60 columns
fn decode_base64_content(content: &str) -> Result<Vec<u8>, ProviderError> {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| ProviderError::ParseError(format!("Invalid base64 content: {}", e)))
}

#[async_trait]
impl GitProvider for GitHubProvider {
    fn display_name(&self) -> String {
        format!("GitHub ({})", self.config.api_base)
    }

    async fn resolve_identity(&self) -> Result<String, ProviderError> {
        let user: GhUser = self.get_json("Resolve identity", &self.api_url("/user")).await?;
        github_log(&format!("Token resolved to account {}", user.login));
        Ok(user.login)
    }

    async fn list_repositories(&self) -> Result<Vec<String>, ProviderError> {
        let url = self.api_url("/user/repos?affiliation=owner&sort=updated");
        let names = self.list_names("List repositories", &url).await?;
        debug!("[GITHUB] Listed {} repositories", names.len());
        Ok(names)
    }

    async fn list_branches(&self, repo: &RepoRef) -> Result<Vec<String>, ProviderError> {
        let url = self.repo_url(repo, "/branches");
        let names = self.list_names("List branches", &url).await?;
        debug!("[GITHUB] Listed {} branches in {}", names.len(), repo);
        Ok(names)
    }

    async fn list_directory(
        &self,
        repo: &RepoRef,
        reference: &str,
        path: &str,
    ) -> Result<Listing, ProviderError> {
        let url = self.contents_url(repo, reference, path);
        let payload: ContentsPayload = self.get_json("List directory", &url).await?;
        Ok(match payload {
            ContentsPayload::Many(items) => {
                Listing::Directory(items.iter().map(Self::to_remote_entry).collect())
            }
            ContentsPayload::One(item) => Listing::from_single(Self::to_remote_entry(&item)),
        })
    }

    async fn read_file(
        &self,
        repo: &RepoRef,
        reference: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        let url = self.contents_url(repo, reference, path);
        let response = self.get_with_retry(&url).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload: ContentsPayload = Self::parse_json("Read file", response).await?;
        let item = match payload {
            ContentsPayload::One(item) if item.kind == "file" => item,
            _ => {
                return Err(ProviderError::InvalidPath(format!("{} is not a file", path)));
            }
        };
        match (item.encoding.as_deref(), item.content.as_deref()) {
            (Some("base64"), Some(content)) => decode_base64_content(content).map(Some),
            // Files above 1 MB come back with encoding "none"; fetch the blob
            _ => self.read_blob(repo, &item.sha).await.map(Some),
        }
    }

    async fn branch_tip(&self, repo: &RepoRef, branch: &str) -> Result<BranchTip, ProviderError> {
        let ref_url = self.repo_url(repo, &format!("/git/ref/heads/{}", Self::encode_segments(branch)));
        let head: GhRef = self.get_json("Read branch", &ref_url).await?;
        let commit_url = self.repo_url(repo, &format!("/git/commits/{}", head.object.sha));
        let commit: GhCommit = self.get_json("Read commit", &commit_url).await?;
        Ok(BranchTip {
            commit_sha: head.object.sha,
            tree_sha: commit.tree.sha,
        })
    }

    async fn create_blob(&self, repo: &RepoRef, content: &[u8]) -> Result<String, ProviderError> {
        let body = json!({
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "encoding": "base64",
        });
        let response = self.post_with_retry(&self.repo_url(repo, "/git/blobs"), &body).await?;
        let blob: GhObject = Self::parse_json("Create blob", response).await?;
        Ok(blob.sha)
    }

    async fn create_tree(
        &self,
        repo: &RepoRef,
        base_tree: &str,
        overrides: &[TreeOverride],
    ) -> Result<String, ProviderError> {
        let entries: Vec<serde_json::Value> = overrides
            .iter()
            .map(|o| {
                json!({
                    "path": normalize_path(&o.path),
                    "mode": FILE_MODE,
                    "type": "blob",
                    "sha": o.blob_sha,
                })
            })
            .collect();
        let body = json!({ "base_tree": base_tree, "tree": entries });
        let response = self.post_with_retry(&self.repo_url(repo, "/git/trees"), &body).await?;
        let tree: GhObject = Self::parse_json("Create tree", response).await?;
        Ok(tree.sha)
    }

    async fn create_commit(
        &self,
        repo: &RepoRef,
        message: &str,
        tree_sha: &str,
        parents: &[String],
    ) -> Result<String, ProviderError> {
        let body = json!({ "message": message, "tree": tree_sha, "parents": parents });
        let response = self.post_with_retry(&self.repo_url(repo, "/git/commits"), &body).await?;
        let commit: GhObject = Self::parse_json("Create commit", response).await?;
        Ok(commit.sha)
    }

    async fn update_ref(
        &self,
        repo: &RepoRef,
        branch: &str,
        expected_sha: &str,
        new_sha: &str,
    ) -> Result<(), ProviderError> {
        let branch_path = Self::encode_segments(branch);

        // Cheap early check; the fast-forward rule below closes the race
        let ref_url = self.repo_url(repo, &format!("/git/ref/heads/{}", branch_path));
        let head: GhRef = self.get_json("Read branch", &ref_url).await?;
        check_tip(branch, expected_sha, &head.object.sha)?;

        // new_sha's only parent is expected_sha, so with force=false GitHub
        // rejects the update as non-fast-forward if the branch moved meanwhile.
        let url = self.repo_url(repo, &format!("/git/refs/heads/{}", branch_path));
        let response = self
            .request(reqwest::Method::PATCH, &url)?
            .json(&json!({ "sha": new_sha, "force": false }))
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response.text().await.unwrap_or_default()
        };
        ref_update_result(branch, expected_sha, status, &body)?;
        github_log(&format!("{}@{} -> {}", repo, branch, new_sha));
        Ok(())
    }
}

fn ref_conflict(branch: &str, expected_sha: &str) -> ProviderError {
    ProviderError::RefConflict {
        branch: branch.to_string(),
        expected: expected_sha.to_string(),
    }
}

/// The branch must still point where the write started
fn check_tip(branch: &str, expected_sha: &str, actual_sha: &str) -> Result<(), ProviderError> {
    if actual_sha == expected_sha {
        Ok(())
    } else {
        Err(ref_conflict(branch, expected_sha))
    }
}

/// Interpret the response to `PATCH git/refs/heads/{branch}` with `force=false`
fn ref_update_result(
    branch: &str,
    expected_sha: &str,
    status: StatusCode,
    body: &str,
) -> Result<(), ProviderError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::CONFLICT {
        let lower = body.to_ascii_lowercase();
        if lower.contains("fast forward") || lower.contains("fast-forward") {
            return Err(ref_conflict(branch, expected_sha));
        }
    }
    Err(map_status("Update branch", status, &sanitize_api_error(body)))
}
