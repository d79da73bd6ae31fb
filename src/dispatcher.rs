//! Dispatcher
//!
//! Routes inbound events through the registration machine and executes the
//! effects it returns: chat replies, browser messages, account writes,
//! note appends and asset uploads.
//!
//! Every user with pending events gets a worker task fed by its own queue.
//! A user's events run in arrival order; different users never wait on each
//! other, and polling continues while workers are busy. Idle workers retire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::appender::NoteAppender;
use crate::codec::{CodecError, CodecRegistry};
use crate::error::NotesError;
use crate::providers::ProviderFactory;
use crate::registration::{ConversationSession, Effect, RegistrationMachine, SessionStore, StepContext};
use crate::store::{AccountUpdate, UserAccount, UserStore};
use crate::transport::{ChatTransport, InboundEvent, UpdateSource, UserId};

/// Pause after a failed poll before asking again
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);
/// A worker with an empty queue for this long exits
const WORKER_IDLE: Duration = Duration::from_secs(60);
/// How long shutdown waits for queued events
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

type EventQueue = mpsc::UnboundedSender<InboundEvent>;

pub struct Dispatcher {
    transport: Arc<dyn ChatTransport>,
    store: Arc<dyn UserStore>,
    sessions: SessionStore,
    machine: RegistrationMachine,
    appender: NoteAppender,
    workers: Mutex<HashMap<UserId, EventQueue>>,
    /// Events dispatched and not yet handled
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<dyn UserStore>,
        factory: Arc<dyn ProviderFactory>,
        registry: &CodecRegistry,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            transport,
            store,
            sessions: SessionStore::new(),
            machine: RegistrationMachine::new(Arc::clone(&factory), registry)?,
            appender: NoteAppender::new(factory),
            workers: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Poll `source` until Ctrl-C, then let queued events finish
    pub async fn run(self: Arc<Self>, source: &dyn UpdateSource) -> Result<(), NotesError> {
        info!("Dispatcher started, waiting for updates");
        loop {
            let batch = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested, stopping dispatcher");
                    break;
                }
                batch = source.next_batch() => batch,
            };

            match batch {
                Ok(events) => {
                    if !events.is_empty() {
                        debug!("Dispatching {} update(s)", events.len());
                    }
                    for event in events {
                        self.dispatch(event);
                    }
                }
                Err(e) => {
                    warn!("Polling for updates failed: {}", e);
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.wait_idle()).await.is_err() {
            warn!(
                "{} event(s) still running at shutdown",
                self.in_flight.load(Ordering::SeqCst)
            );
        }
        Ok(())
    }

    /// Queue `event` on its user's worker, starting one if needed
    pub fn dispatch(self: &Arc<Self>, event: InboundEvent) {
        let user_id = event.user_id;
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let mut workers = self.lock_workers();
        let event = match workers.get(&user_id) {
            Some(queue) => match queue.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (queue, rx) = mpsc::unbounded_channel();
        if let Err(mpsc::error::SendError(lost)) = queue.send(event) {
            // rx is alive in this scope, so this cannot happen
            error!("Could not queue event for user {}", lost.user_id);
            self.finish_one();
            return;
        }
        workers.insert(user_id, queue);
        debug!("Started worker for user {}", user_id);
        tokio::spawn(Arc::clone(self).work(user_id, rx));
    }

    /// Wait until every dispatched event has been handled
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn work(self: Arc<Self>, user_id: UserId, mut rx: mpsc::UnboundedReceiver<InboundEvent>) {
        loop {
            let event = match tokio::time::timeout(WORKER_IDLE, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(_) => {
                    // Retire under the map lock so no event slips in between
                    let mut workers = self.lock_workers();
                    match rx.try_recv() {
                        Ok(event) => event,
                        Err(_) => {
                            workers.remove(&user_id);
                            debug!("Worker for user {} retired", user_id);
                            return;
                        }
                    }
                }
            };

            if let Err(e) = self.handle(event).await {
                error!("Failed to handle event from user {}: {}", user_id, e);
            }
            self.finish_one();
        }
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<UserId, EventQueue>> {
        self.workers.lock().unwrap_or_else(|poisoned| {
            warn!("Worker map lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Handle a single inbound event
    pub async fn handle(&self, event: InboundEvent) -> Result<(), NotesError> {
        let account = self.store.get_user(event.user_id).await?;
        let mut previous = self.sessions.get(event.user_id).await;
        let ctx = StepContext {
            user_id: event.user_id,
            user_name: &event.user_name,
            account: account.as_ref(),
        };

        let transition = self.machine.step(previous.clone(), &event.kind, &ctx).await;
        self.save_session(event.user_id, transition.session).await;

        for effect in transition.effects {
            let finalizing = matches!(effect, Effect::FinalizeAccount(_));
            if let Err(e) = self.execute(&event, account.as_ref(), effect).await {
                warn!("Effect failed for user {}: {}", event.user_id, e);
                if finalizing {
                    // Let the user select again
                    self.save_session(event.user_id, previous.take()).await;
                }
                self.report(&event, &e).await;
                break;
            }
        }
        Ok(())
    }

    async fn save_session(&self, user_id: UserId, session: Option<ConversationSession>) {
        match session {
            Some(session) => self.sessions.put(user_id, session).await,
            None => {
                self.sessions.remove(user_id).await;
            }
        }
    }

    async fn report(&self, event: &InboundEvent, err: &NotesError) {
        if let Err(e) = self
            .transport
            .send_message(event.chat_id, &err.user_message(), None)
            .await
        {
            warn!("Could not report failure to user {}: {}", event.user_id, e);
        }
    }

    async fn execute(
        &self,
        event: &InboundEvent,
        account: Option<&UserAccount>,
        effect: Effect,
    ) -> Result<(), NotesError> {
        let chat_id = event.chat_id;
        match effect {
            Effect::Reply { text, markup } => {
                self.transport
                    .send_message(chat_id, &text, markup.as_ref())
                    .await
                    .map_err(NotesError::chat)?;
            }
            Effect::ShowBrowser(view) => {
                self.transport
                    .send_message(chat_id, &view.text, Some(&view.markup()))
                    .await
                    .map_err(NotesError::chat)?;
            }
            Effect::EditBrowser { message_id, view } => {
                self.transport
                    .edit_message(chat_id, message_id, &view.text, Some(&view.markup()))
                    .await
                    .map_err(NotesError::chat)?;
            }
            Effect::AnswerCallback { query_id, text } => {
                // Best effort: Telegram rejects answers to old queries
                if let Err(e) = self.transport.answer_callback(&query_id, text.as_deref()).await {
                    debug!("Callback answer for user {} not delivered: {}", event.user_id, e);
                }
            }
            Effect::FinalizeAccount(new_account) => {
                self.store.create_user(&new_account).await?;
                self.store
                    .update_user(
                        new_account.user_id,
                        &AccountUpdate {
                            registered: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!("User {} is registered", new_account.user_id);
            }
            Effect::UpdateAssetsFolder(folder) => {
                self.store
                    .update_user(
                        event.user_id,
                        &AccountUpdate {
                            assets_folder: Some(folder.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!("User {} assets folder set to {}", event.user_id, folder);
            }
            Effect::AppendNote(text) => {
                let account = registered(account, event.user_id)?;
                let outcome = self.appender.append_note(account, &text).await?;
                self.transport
                    .send_message(chat_id, &format!("Note saved to {}", outcome.path), None)
                    .await
                    .map_err(NotesError::chat)?;
            }
            Effect::UploadAsset(attachment) => {
                let account = registered(account, event.user_id)?;
                let bytes = self
                    .transport
                    .download_attachment(&attachment.file_id)
                    .await
                    .map_err(NotesError::chat)?;
                let outcome = self
                    .appender
                    .upload_asset(account, &bytes, &attachment.extension(), attachment.kind)
                    .await?;
                self.transport
                    .send_message(chat_id, &format!("File saved to {}", outcome.path), None)
                    .await
                    .map_err(NotesError::chat)?;
            }
        }
        Ok(())
    }
}

fn registered(account: Option<&UserAccount>, user_id: UserId) -> Result<&UserAccount, NotesError> {
    account
        .filter(|a| a.registered)
        .ok_or_else(|| NotesError::StateMismatch(format!("user {} is not registered", user_id)))
}
