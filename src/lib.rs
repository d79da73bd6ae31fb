//! telenotes - keep notes in a GitHub repository from a Telegram chat
//!
//! A chat user registers a repository, branch and note file through a short
//! dialogue, then every text message is appended to that file and every
//! photo or document is committed to an assets folder.

pub mod appender;
pub mod browser;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod providers;
pub mod registration;
pub mod store;
pub mod transport;

pub use appender::{CommitOutcome, NoteAppender, MAX_REF_ATTEMPTS};
pub use browser::{BrowserView, RemoteTreeBrowser, TargetKind};
pub use codec::{CallbackCodec, CodecError, CodecRegistry, NavAction, NavToken};
pub use config::{BotConfig, ConfigError};
pub use dispatcher::Dispatcher;
pub use error::NotesError;
pub use registration::{RegistrationMachine, RegistrationStep, SessionStore};
pub use store::{SqliteUserStore, UserAccount, UserStore};
