//! User account store
//!
//! SQLite backend for registered notebooks:
//! - One row per chat user (`user_id` primary key, upsert on create)
//! - WAL mode, schema created idempotently on open
//! - Credentials held as `SecretString` once loaded

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

use crate::providers::ROOT_PATH;
use crate::transport::UserId;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UserAccount {
    pub user_id: UserId,
    pub credential: SecretString,
    /// `owner/name`
    pub repository: String,
    pub branch: String,
    pub note_path: String,
    pub assets_folder: String,
    pub registered: bool,
}

impl UserAccount {
    /// Account as written at the end of registration, before it is
    /// marked registered
    pub fn pending(
        user_id: UserId,
        credential: SecretString,
        repository: impl Into<String>,
        branch: impl Into<String>,
        note_path: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            credential,
            repository: repository.into(),
            branch: branch.into(),
            note_path: note_path.into(),
            assets_folder: ROOT_PATH.to_string(),
            registered: false,
        }
    }

    /// All fields a registered account needs are present
    pub fn is_complete(&self) -> bool {
        !self.credential.expose_secret().is_empty()
            && !self.repository.is_empty()
            && !self.branch.is_empty()
            && !self.note_path.is_empty()
    }
}

/// Fields changed after registration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountUpdate {
    pub assets_folder: Option<String>,
    pub registered: Option<bool>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("User {0} not found")]
    NotFound(UserId),
    #[error("User {0} is missing required fields")]
    Incomplete(UserId),
}

/// Persistent user store
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>, StoreError>;

    /// Insert or replace the row for `account.user_id`
    async fn create_user(&self, account: &UserAccount) -> Result<(), StoreError>;

    async fn update_user(&self, user_id: UserId, update: &AccountUpdate) -> Result<UserAccount, StoreError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteUserStore(Mutex<Connection>);

/// Acquire DB lock with poison recovery
fn acquire_lock(store: &SqliteUserStore) -> std::sync::MutexGuard<'_, Connection> {
    store.0.lock().unwrap_or_else(|e| {
        log::warn!("User store mutex was poisoned, recovering: {e}");
        e.into_inner()
    })
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY,
            credential TEXT NOT NULL,
            repository TEXT NOT NULL,
            branch TEXT NOT NULL,
            note_path TEXT NOT NULL,
            assets_folder TEXT NOT NULL DEFAULT '/',
            registered INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    Ok(())
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserAccount> {
    Ok(UserAccount {
        user_id: row.get(0)?,
        credential: SecretString::from(row.get::<_, String>(1)?),
        repository: row.get(2)?,
        branch: row.get(3)?,
        note_path: row.get(4)?,
        assets_folder: row.get(5)?,
        registered: row.get(6)?,
    })
}

const SELECT_USER: &str = "SELECT user_id, credential, repository, branch, note_path, assets_folder, registered
     FROM users WHERE user_id = ?1";

impl SqliteUserStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
                }
            }
        }

        let conn = Connection::open(path)?;

        // Credentials live in this file
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        apply_schema(&conn)?;
        log::info!("User store opened at {}", path.display());
        Ok(Self(Mutex::new(conn)))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self(Mutex::new(conn)))
    }

    fn load(conn: &Connection, user_id: UserId) -> Result<Option<UserAccount>, StoreError> {
        Ok(conn
            .query_row(SELECT_USER, params![user_id], row_to_account)
            .optional()?)
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>, StoreError> {
        let conn = acquire_lock(self);
        Self::load(&conn, user_id)
    }

    async fn create_user(&self, account: &UserAccount) -> Result<(), StoreError> {
        if account.registered && !account.is_complete() {
            return Err(StoreError::Incomplete(account.user_id));
        }
        let conn = acquire_lock(self);
        conn.execute(
            "INSERT INTO users (user_id, credential, repository, branch, note_path, assets_folder, registered)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                credential = excluded.credential,
                repository = excluded.repository,
                branch = excluded.branch,
                note_path = excluded.note_path,
                assets_folder = excluded.assets_folder,
                registered = excluded.registered",
            params![
                account.user_id,
                account.credential.expose_secret(),
                account.repository,
                account.branch,
                account.note_path,
                account.assets_folder,
                account.registered,
            ],
        )?;
        log::info!("Stored account for user {} ({})", account.user_id, account.repository);
        Ok(())
    }

    async fn update_user(&self, user_id: UserId, update: &AccountUpdate) -> Result<UserAccount, StoreError> {
        let conn = acquire_lock(self);
        let mut account = Self::load(&conn, user_id)?.ok_or(StoreError::NotFound(user_id))?;

        if let Some(folder) = &update.assets_folder {
            account.assets_folder = folder.clone();
        }
        if let Some(registered) = update.registered {
            if registered && !account.is_complete() {
                return Err(StoreError::Incomplete(user_id));
            }
            account.registered = registered;
        }

        conn.execute(
            "UPDATE users SET assets_folder = ?2, registered = ?3 WHERE user_id = ?1",
            params![user_id, account.assets_folder, account.registered],
        )?;
        Ok(account)
    }
}
