//! Registration dialogue
//!
//! Explicit state machine collecting the notebook coordinates of a chat
//! user. `RegistrationMachine::step` consumes one inbound event and returns
//! the next session plus the effects the dispatcher must execute. Steps only
//! perform read-only provider calls; writes are returned as effects.
//!
//! ```text
//! Idle -> AwaitCredential -> AwaitRepository -> AwaitBranch -> PickingFile -> Done
//!                                                                   Done <-> PickingAssetsFolder
//! ```

use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::browser::{chunk_rows, BrowserView, RemoteTreeBrowser, TargetKind};
use crate::codec::{CallbackCodec, CodecError, CodecRegistry, NavAction};
use crate::error::NotesError;
use crate::providers::{
    normalize_path, ErrorClass, Listing, ProviderError, ProviderFactory, RepoRef,
};
use crate::store::UserAccount;
use crate::transport::{Attachment, EventKind, MessageId, ReplyMarkup, UserId};

/// Callback prefix of the note file picker
pub const FILE_PICKER_PREFIX: &str = "nfs";
/// Callback prefix of the assets folder picker
pub const FOLDER_PICKER_PREFIX: &str = "afs";
/// Quick-pick buttons per keyboard row
pub const QUICK_PICK_ROW_WIDTH: usize = 3;

const TOKEN_PROMPT: &str = "Please enter your GitHub token for the notes repository.";
const TOKEN_INCORRECT: &str = "GitHub token is incorrect. Try again.";
const TOKEN_DELETE_HINT: &str =
    "Please delete the message with your token from this chat for security reasons.";
const REPOSITORY_PROMPT: &str = "What is your notes repository?";
const BRANCH_PROMPT: &str = "What is your notes branch?";
const FILE_PROMPT: &str = "And finally, in which file would you like to store your notes?";
const FILE_PICK_HINT: &str = "Use the buttons above to pick a file, or send /cancel.";
const FOLDER_PICK_HINT: &str = "Use the buttons above to pick a folder, or send /cancel.";
const FINISHED: &str = "Ok all finished!";
const CANCELLED: &str = "Cancelled.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationStep {
    Idle,
    AwaitCredential,
    AwaitRepository,
    AwaitBranch,
    PickingFile,
    Done,
    PickingAssetsFolder,
}

/// Values accumulated across steps
#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub login: Option<String>,
    pub credential: Option<SecretString>,
    /// `owner/name`
    pub repository: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub step: RegistrationStep,
    pub collected: Collected,
}

impl ConversationSession {
    pub fn new(step: RegistrationStep) -> Self {
        Self {
            step,
            collected: Collected::default(),
        }
    }

    fn at(mut self, step: RegistrationStep) -> Self {
        self.step = step;
        self
    }
}

/// Transient per-user sessions
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<UserId, ConversationSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: UserId) -> Option<ConversationSession> {
        self.sessions.read().await.get(&user_id).cloned()
    }

    pub async fn put(&self, user_id: UserId, session: ConversationSession) {
        self.sessions.write().await.insert(user_id, session);
    }

    pub async fn remove(&self, user_id: UserId) -> Option<ConversationSession> {
        self.sessions.write().await.remove(&user_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Work a step asks the dispatcher to perform
#[derive(Debug, Clone)]
pub enum Effect {
    Reply {
        text: String,
        markup: Option<ReplyMarkup>,
    },
    /// Send a new browser message
    ShowBrowser(BrowserView),
    /// Replace a browser message in place
    EditBrowser {
        message_id: MessageId,
        view: BrowserView,
    },
    AnswerCallback {
        query_id: String,
        text: Option<String>,
    },
    /// Persist the account and mark it registered
    FinalizeAccount(UserAccount),
    UpdateAssetsFolder(String),
    AppendNote(String),
    UploadAsset(Attachment),
}

impl Effect {
    fn reply(text: impl Into<String>) -> Self {
        Effect::Reply {
            text: text.into(),
            markup: None,
        }
    }

    fn reply_with(text: impl Into<String>, markup: ReplyMarkup) -> Self {
        Effect::Reply {
            text: text.into(),
            markup: Some(markup),
        }
    }

    fn answer(query_id: &str, text: Option<String>) -> Self {
        Effect::AnswerCallback {
            query_id: query_id.to_string(),
            text,
        }
    }
}

/// Outcome of one step. `session == None` means no transient session is
/// kept (the user is Idle or Done).
#[derive(Debug, Clone)]
pub struct Transition {
    pub session: Option<ConversationSession>,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(session: ConversationSession, effects: Vec<Effect>) -> Self {
        Self {
            session: Some(session),
            effects,
        }
    }

    fn end(effects: Vec<Effect>) -> Self {
        Self {
            session: None,
            effects,
        }
    }

    fn keep(session: Option<ConversationSession>, effects: Vec<Effect>) -> Self {
        Self { session, effects }
    }

    pub fn step(&self) -> Option<RegistrationStep> {
        self.session.as_ref().map(|s| s.step)
    }
}

/// Per-event facts the machine needs besides the session
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub user_id: UserId,
    pub user_name: &'a str,
    pub account: Option<&'a UserAccount>,
}

impl StepContext<'_> {
    fn registered(&self) -> Option<&UserAccount> {
        self.account.filter(|a| a.registered)
    }
}

/// Reply-keyboard rows of quick picks, or keyboard removal when empty
fn quick_picks(names: &[String]) -> ReplyMarkup {
    if names.is_empty() {
        ReplyMarkup::Remove
    } else {
        ReplyMarkup::Keyboard(chunk_rows(names, QUICK_PICK_ROW_WIDTH))
    }
}

/// Reply for a provider failure; input problems get the step's own text
fn failure_reply(err: ProviderError, invalid_text: impl Into<String>) -> Effect {
    match err.classify() {
        ErrorClass::InputValidation => Effect::reply(invalid_text),
        _ => {
            warn!("Provider failure during registration: {}", err);
            Effect::reply(NotesError::from(err).user_message())
        }
    }
}

fn expired(query_id: &str, err: CodecError) -> Effect {
    debug!("Rejected navigation token: {}", err);
    Effect::answer(query_id, Some(NotesError::from(err).user_message()))
}

pub struct RegistrationMachine {
    factory: Arc<dyn ProviderFactory>,
    file_codec: CallbackCodec,
    folder_codec: CallbackCodec,
}

impl RegistrationMachine {
    pub fn new(factory: Arc<dyn ProviderFactory>, registry: &CodecRegistry) -> Result<Self, CodecError> {
        Ok(Self {
            factory,
            file_codec: registry.register(FILE_PICKER_PREFIX)?,
            folder_codec: registry.register(FOLDER_PICKER_PREFIX)?,
        })
    }

    /// Step the user is in, given the stored session and account
    pub fn current_step(session: Option<&ConversationSession>, ctx: &StepContext<'_>) -> RegistrationStep {
        match session {
            // The folder picker belongs to a registered account
            Some(s) if s.step == RegistrationStep::PickingAssetsFolder && ctx.registered().is_none() => {
                RegistrationStep::Idle
            }
            Some(s) => s.step,
            None if ctx.registered().is_some() => RegistrationStep::Done,
            None => RegistrationStep::Idle,
        }
    }

    /// Advance the dialogue by one event
    pub async fn step(
        &self,
        session: Option<ConversationSession>,
        event: &EventKind,
        ctx: &StepContext<'_>,
    ) -> Transition {
        let current = Self::current_step(session.as_ref(), ctx);
        debug!("User {} in {:?} received {:?}", ctx.user_id, current, event_name(event));

        match (current, event) {
            (RegistrationStep::Idle | RegistrationStep::Done, EventKind::Cancel) => {
                Transition::end(Vec::new())
            }
            (_, EventKind::Cancel) => {
                info!("Registration cancelled by user {} in {:?}", ctx.user_id, current);
                Transition::end(vec![Effect::reply_with(CANCELLED, ReplyMarkup::Remove)])
            }
            (RegistrationStep::Done | RegistrationStep::PickingAssetsFolder, EventKind::Start) => {
                Transition::end(vec![Effect::reply_with(
                    format!("Hi {}!\nYou are already registered", ctx.user_name),
                    ReplyMarkup::Remove,
                )])
            }
            (_, EventKind::Start) => Transition::to(
                ConversationSession::new(RegistrationStep::AwaitCredential),
                vec![Effect::reply_with(
                    format!(
                        "Nice to meet you, {}!\nLet's get started with registration.\n{}",
                        ctx.user_name, TOKEN_PROMPT
                    ),
                    ReplyMarkup::Remove,
                )],
            ),
            (_, EventKind::Callback { query_id, message_id, data }) => {
                self.on_callback(current, session, query_id, *message_id, data, ctx).await
            }
            (RegistrationStep::Idle, _) => Transition::to(
                ConversationSession::new(RegistrationStep::AwaitCredential),
                vec![Effect::reply_with(
                    format!(
                        "Nice to meet you, {}!\nLet's get started with registration before sending notes.\n{}",
                        ctx.user_name, TOKEN_PROMPT
                    ),
                    ReplyMarkup::Remove,
                )],
            ),
            (RegistrationStep::Done, event) => self.on_registered(event, ctx).await,
            (RegistrationStep::AwaitCredential, EventKind::Text(text)) => {
                self.on_credential(session, text).await
            }
            (RegistrationStep::AwaitRepository, EventKind::Text(text)) => {
                self.on_repository(session, text).await
            }
            (RegistrationStep::AwaitBranch, EventKind::Text(text)) => self.on_branch(session, text).await,
            (RegistrationStep::AwaitCredential, _) => Transition::keep(session, vec![Effect::reply(TOKEN_PROMPT)]),
            (RegistrationStep::AwaitRepository, _) => {
                Transition::keep(session, vec![Effect::reply(REPOSITORY_PROMPT)])
            }
            (RegistrationStep::AwaitBranch, _) => Transition::keep(session, vec![Effect::reply(BRANCH_PROMPT)]),
            (RegistrationStep::PickingFile, _) => Transition::keep(session, vec![Effect::reply(FILE_PICK_HINT)]),
            (RegistrationStep::PickingAssetsFolder, _) => {
                Transition::keep(session, vec![Effect::reply(FOLDER_PICK_HINT)])
            }
        }
    }

    // ─── Credential / repository / branch ───

    async fn on_credential(&self, session: Option<ConversationSession>, text: &str) -> Transition {
        let token = text.trim();
        if token.is_empty() {
            return Transition::keep(session, vec![Effect::reply(TOKEN_PROMPT)]);
        }
        let credential = SecretString::from(token.to_string());

        let identity = async {
            let provider = self.factory.connect(&credential)?;
            let login = provider.resolve_identity().await?;
            let repos = provider.list_repositories().await?;
            Ok::<_, ProviderError>((login, repos))
        }
        .await;

        let (login, repos) = match identity {
            Ok(found) => found,
            Err(e) => return Transition::keep(session, vec![failure_reply(e, TOKEN_INCORRECT)]),
        };

        info!("Credential accepted for GitHub user {}", login);
        let mut next = session
            .unwrap_or_else(|| ConversationSession::new(RegistrationStep::AwaitCredential))
            .at(RegistrationStep::AwaitRepository);
        next.collected.login = Some(login.clone());
        next.collected.credential = Some(credential);

        Transition::to(
            next,
            vec![
                Effect::reply(TOKEN_DELETE_HINT),
                Effect::reply_with(
                    format!("Your github username is {}.\n{}", login, REPOSITORY_PROMPT),
                    quick_picks(&repos),
                ),
            ],
        )
    }

    async fn on_repository(&self, session: Option<ConversationSession>, text: &str) -> Transition {
        let Some(mut next) = session else {
            return Transition::end(Vec::new());
        };
        let (Some(login), Some(credential)) = (next.collected.login.clone(), next.collected.credential.clone())
        else {
            return Transition::to(
                ConversationSession::new(RegistrationStep::AwaitCredential),
                vec![Effect::reply(TOKEN_PROMPT)],
            );
        };

        let not_found = format!("Repository {} was not found. Try again.", text.trim());
        let lookup = async {
            let repo = RepoRef::qualify(text, &login)?;
            let provider = self.factory.connect(&credential)?;
            let branches = provider.list_branches(&repo).await?;
            Ok::<_, ProviderError>((repo, branches))
        }
        .await;

        match lookup {
            Ok((repo, branches)) => {
                next.collected.repository = Some(repo.full_name());
                Transition::to(
                    next.at(RegistrationStep::AwaitBranch),
                    vec![Effect::reply_with(BRANCH_PROMPT, quick_picks(&branches))],
                )
            }
            Err(e) => Transition::to(next, vec![failure_reply(e, not_found)]),
        }
    }

    async fn on_branch(&self, session: Option<ConversationSession>, text: &str) -> Transition {
        let Some(mut next) = session else {
            return Transition::end(Vec::new());
        };
        let (Some(credential), Some(repository)) =
            (next.collected.credential.clone(), next.collected.repository.clone())
        else {
            return Transition::to(
                ConversationSession::new(RegistrationStep::AwaitCredential),
                vec![Effect::reply(TOKEN_PROMPT)],
            );
        };
        let branch = text.trim().to_string();

        let checked = async {
            let repo = RepoRef::parse(&repository)?;
            let provider = self.factory.connect(&credential)?;
            let branches = provider.list_branches(&repo).await?;
            if !branches.iter().any(|b| *b == branch) {
                return Ok((branches, None));
            }
            let browser =
                RemoteTreeBrowser::new(provider, repo, &branch, TargetKind::File, self.file_codec.clone());
            let view = browser.render("/").await?;
            Ok::<_, ProviderError>((branches, Some(view)))
        }
        .await;

        match checked {
            Ok((_, Some(view))) => {
                next.collected.branch = Some(branch);
                Transition::to(
                    next.at(RegistrationStep::PickingFile),
                    vec![
                        Effect::reply_with(FILE_PROMPT, ReplyMarkup::Remove),
                        Effect::ShowBrowser(view),
                    ],
                )
            }
            Ok((branches, None)) => Transition::to(
                next,
                vec![Effect::reply_with(
                    format!("Branch {} does not exist. {}", branch, BRANCH_PROMPT),
                    quick_picks(&branches),
                )],
            ),
            Err(e) => Transition::to(next, vec![failure_reply(e, format!("Branch {} is not usable. Try again.", branch))]),
        }
    }

    // ─── Registered user ───

    async fn on_registered(&self, event: &EventKind, ctx: &StepContext<'_>) -> Transition {
        let Some(account) = ctx.registered() else {
            return Transition::end(Vec::new());
        };
        match event {
            EventKind::Text(text) => Transition::end(vec![Effect::AppendNote(text.clone())]),
            EventKind::Attachment(attachment) => {
                Transition::end(vec![Effect::UploadAsset(attachment.clone())])
            }
            EventKind::ChangeAssetsFolder => {
                let rendered = async {
                    let browser = self.account_browser(account, TargetKind::Directory)?;
                    browser.render("/").await
                }
                .await;
                match rendered {
                    Ok(view) => Transition::to(
                        ConversationSession::new(RegistrationStep::PickingAssetsFolder),
                        vec![Effect::ShowBrowser(view)],
                    ),
                    Err(e) => Transition::end(vec![Effect::reply(NotesError::from(e).user_message())]),
                }
            }
            _ => Transition::end(Vec::new()),
        }
    }

    fn account_browser(&self, account: &UserAccount, target: TargetKind) -> Result<RemoteTreeBrowser, ProviderError> {
        let provider = self.factory.connect(&account.credential)?;
        let repo = RepoRef::parse(&account.repository)?;
        let codec = match target {
            TargetKind::File => self.file_codec.clone(),
            TargetKind::Directory => self.folder_codec.clone(),
        };
        Ok(RemoteTreeBrowser::new(provider, repo, &account.branch, target, codec))
    }

    fn session_browser(&self, collected: &Collected) -> Result<RemoteTreeBrowser, ProviderError> {
        let (Some(credential), Some(repository), Some(branch)) =
            (&collected.credential, &collected.repository, &collected.branch)
        else {
            return Err(ProviderError::InvalidPath("Registration data is incomplete".to_string()));
        };
        let provider = self.factory.connect(credential)?;
        let repo = RepoRef::parse(repository)?;
        Ok(RemoteTreeBrowser::new(provider, repo, branch, TargetKind::File, self.file_codec.clone()))
    }

    // ─── Navigation callbacks ───

    async fn on_callback(
        &self,
        current: RegistrationStep,
        session: Option<ConversationSession>,
        query_id: &str,
        message_id: Option<MessageId>,
        data: &str,
        ctx: &StepContext<'_>,
    ) -> Transition {
        let picker = match (current, session.as_ref(), ctx.registered()) {
            (RegistrationStep::PickingFile, Some(s), _) => {
                Some((&self.file_codec, self.session_browser(&s.collected)))
            }
            (RegistrationStep::PickingAssetsFolder, Some(_), Some(account)) => {
                Some((&self.folder_codec, self.account_browser(account, TargetKind::Directory)))
            }
            _ => None,
        };
        let Some((codec, browser)) = picker else {
            let stale = NotesError::StateMismatch(format!("callback in {:?}", current));
            debug!("{}", stale);
            return Transition::keep(session, vec![Effect::answer(query_id, Some(stale.user_message()))]);
        };

        let token = match codec.decode(data) {
            Ok(token) => token,
            Err(e) => return Transition::keep(session, vec![expired(query_id, e)]),
        };
        let browser = match browser {
            Ok(b) => b,
            Err(e) => {
                return Transition::keep(
                    session,
                    vec![Effect::answer(query_id, Some(NotesError::from(e).user_message()))],
                )
            }
        };

        match token.action {
            NavAction::Browse | NavAction::Back => match browser.render(&token.path).await {
                Ok(view) => {
                    let shown = match message_id {
                        Some(message_id) => Effect::EditBrowser { message_id, view },
                        None => Effect::ShowBrowser(view),
                    };
                    Transition::keep(session, vec![Effect::answer(query_id, None), shown])
                }
                Err(e) => Transition::keep(
                    session,
                    vec![Effect::answer(query_id, Some(NotesError::from(e).user_message()))],
                ),
            },
            NavAction::Select => self.on_select(current, session, query_id, &token.path, browser, ctx).await,
        }
    }

    async fn on_select(
        &self,
        current: RegistrationStep,
        session: Option<ConversationSession>,
        query_id: &str,
        path: &str,
        browser: RemoteTreeBrowser,
        ctx: &StepContext<'_>,
    ) -> Transition {
        let path = normalize_path(path);
        let listing = browser.list(&path).await;
        let kind_ok = matches!(
            (&listing, browser.target()),
            (Ok(Listing::File(_)), TargetKind::File) | (Ok(Listing::Directory(_)), TargetKind::Directory)
        );
        if !kind_ok {
            let text = match listing {
                Err(e) if e.classify() != ErrorClass::InputValidation => NotesError::from(e).user_message(),
                _ => format!("{} can not be selected here.", path),
            };
            return Transition::keep(session, vec![Effect::answer(query_id, Some(text))]);
        }

        match (current, session) {
            (RegistrationStep::PickingFile, Some(session)) => {
                let collected = session.collected;
                let (Some(credential), Some(repository), Some(branch)) =
                    (collected.credential, collected.repository, collected.branch)
                else {
                    return Transition::end(vec![Effect::answer(query_id, None)]);
                };
                info!("User {} registered {} on {} ({})", ctx.user_id, repository, branch, path);
                let account = UserAccount::pending(ctx.user_id, credential, repository, branch, path);
                // Store writes precede the callback answer
                Transition::end(vec![
                    Effect::FinalizeAccount(account),
                    Effect::answer(query_id, None),
                    Effect::reply_with(FINISHED, ReplyMarkup::Remove),
                ])
            }
            (_, _) => Transition::end(vec![
                Effect::UpdateAssetsFolder(path.clone()),
                Effect::answer(query_id, None),
                Effect::reply(format!("Photos and files will be saved to {}", path)),
            ]),
        }
    }
}

fn event_name(event: &EventKind) -> &'static str {
    match event {
        EventKind::Start => "start",
        EventKind::Cancel => "cancel",
        EventKind::ChangeAssetsFolder => "folder",
        EventKind::Text(_) => "text",
        EventKind::Attachment(_) => "attachment",
        EventKind::Callback { .. } => "callback",
    }
}
