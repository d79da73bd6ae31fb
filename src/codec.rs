//! Navigation token codec
//!
//! Inline buttons carry a short string back to the bot when pressed. A token
//! names the browser instance that produced it (prefix), the action, and the
//! target path:
//!
//! ```text
//! nfs:n:docs/daily.md      direct form, path embedded
//! nfs:s#5f1c0a9e2b7d4c31   interned form, path kept in the PathTable
//! ```
//!
//! Telegram limits callback data to 64 bytes. Paths that do not fit are
//! interned in a shared, capacity-bounded table and referenced by digest.

use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Upper bound on an encoded token, in bytes
pub const MAX_TOKEN_BYTES: usize = 64;
const SEPARATOR: char = ':';
const ID_MARKER: char = '#';
/// Hex digits of the path digest used as table id
const PATH_ID_LEN: usize = 16;
const DEFAULT_TABLE_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavAction {
    /// Open a directory or file view
    Browse,
    /// Return to the parent directory
    Back,
    /// Pick the path
    Select,
}

impl NavAction {
    fn tag(self) -> char {
        match self {
            NavAction::Browse => 'n',
            NavAction::Back => 'b',
            NavAction::Select => 's',
        }
    }

    fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'n' => Some(NavAction::Browse),
            'b' => Some(NavAction::Back),
            's' => Some(NavAction::Select),
            _ => None,
        }
    }
}

/// Decoded navigation token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavToken {
    pub prefix: String,
    pub action: NavAction,
    pub path: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Callback prefix must not be empty")]
    EmptyPrefix,
    #[error("Invalid callback prefix: {0}")]
    InvalidPrefix(String),
    #[error("Callback prefix already registered: {0}")]
    DuplicatePrefix(String),
    #[error("Malformed navigation token")]
    Malformed,
    #[error("Token prefix mismatch: expected {expected}, found {found}")]
    PrefixMismatch { expected: String, found: String },
    #[error("Unknown navigation action: {0}")]
    UnknownAction(char),
    #[error("Navigation path expired")]
    UnknownPathId,
}

/// Server-side path storage for paths too long to embed in a token
pub struct PathTable {
    entries: Mutex<HashMap<String, String>>,
    capacity: usize,
}

impl PathTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `path` and return its id. Ids are stable for a given path.
    /// When the table is full it is cleared; tokens pointing at evicted
    /// ids then fail to decode.
    pub fn intern(&self, path: &str) -> String {
        let digest = hex::encode(Sha1::digest(path.as_bytes()));
        let id = digest[..PATH_ID_LEN].to_string();
        let mut entries = self.lock();
        if !entries.contains_key(&id) && entries.len() >= self.capacity {
            debug!("Path table reached {} entries, evicting all", entries.len());
            entries.clear();
        }
        entries.insert(id.clone(), path.to_string());
        id
    }

    pub fn resolve(&self, id: &str) -> Option<String> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Hands out codecs with unique prefixes sharing one path table
pub struct CodecRegistry {
    prefixes: Mutex<HashSet<String>>,
    table: Arc<PathTable>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TABLE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            prefixes: Mutex::new(HashSet::new()),
            table: Arc::new(PathTable::new(capacity)),
        }
    }

    /// Register a prefix. Rejects empty prefixes, prefixes containing the
    /// token separators, prefixes too long to leave room for an interned
    /// id, and prefixes already registered.
    pub fn register(&self, prefix: &str) -> Result<CallbackCodec, CodecError> {
        if prefix.is_empty() {
            return Err(CodecError::EmptyPrefix);
        }
        let interned_len = prefix.len() + 3 + PATH_ID_LEN;
        if prefix.contains(SEPARATOR)
            || prefix.contains(ID_MARKER)
            || prefix.chars().any(char::is_whitespace)
            || interned_len > MAX_TOKEN_BYTES
        {
            return Err(CodecError::InvalidPrefix(prefix.to_string()));
        }
        let mut prefixes = self.prefixes.lock().unwrap_or_else(|e| e.into_inner());
        if !prefixes.insert(prefix.to_string()) {
            return Err(CodecError::DuplicatePrefix(prefix.to_string()));
        }
        Ok(CallbackCodec {
            prefix: prefix.to_string(),
            table: Arc::clone(&self.table),
        })
    }
}

/// Encoder/decoder bound to one browser prefix
#[derive(Clone)]
pub struct CallbackCodec {
    prefix: String,
    table: Arc<PathTable>,
}

impl std::fmt::Debug for CallbackCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackCodec").field("prefix", &self.prefix).finish()
    }
}

impl CallbackCodec {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Encode an action on `path`. The result never exceeds `MAX_TOKEN_BYTES`.
    pub fn encode(&self, action: NavAction, path: &str) -> String {
        let direct = format!("{}{}{}{}{}", self.prefix, SEPARATOR, action.tag(), SEPARATOR, path);
        if direct.len() <= MAX_TOKEN_BYTES {
            return direct;
        }
        let id = self.table.intern(path);
        format!("{}{}{}{}{}", self.prefix, SEPARATOR, action.tag(), ID_MARKER, id)
    }

    /// Whether a token was produced by a codec with this prefix
    pub fn owns(&self, token: &str) -> bool {
        token_prefix(token) == Some(self.prefix.as_str())
    }

    /// Decode a token. Anything malformed, foreign or expired is rejected.
    pub fn decode(&self, token: &str) -> Result<NavToken, CodecError> {
        if token.len() > MAX_TOKEN_BYTES {
            return Err(CodecError::Malformed);
        }
        let (prefix, rest) = token.split_once(SEPARATOR).ok_or(CodecError::Malformed)?;
        if prefix != self.prefix {
            return Err(CodecError::PrefixMismatch {
                expected: self.prefix.clone(),
                found: prefix.to_string(),
            });
        }
        let mut chars = rest.chars();
        let tag = chars.next().ok_or(CodecError::Malformed)?;
        let action = NavAction::from_tag(tag).ok_or(CodecError::UnknownAction(tag))?;
        let marker = chars.next().ok_or(CodecError::Malformed)?;
        let payload = chars.as_str();
        if payload.is_empty() {
            return Err(CodecError::Malformed);
        }
        let path = match marker {
            SEPARATOR => payload.to_string(),
            ID_MARKER => self.table.resolve(payload).ok_or(CodecError::UnknownPathId)?,
            _ => return Err(CodecError::Malformed),
        };
        Ok(NavToken {
            prefix: prefix.to_string(),
            action,
            path,
        })
    }
}

/// Prefix part of a token, if it has one
pub fn token_prefix(token: &str) -> Option<&str> {
    token.split_once(SEPARATOR).map(|(prefix, _)| prefix)
}
