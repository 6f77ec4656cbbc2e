use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use maewchat_client::{ChatBackend, Subscription};
use maewchat_types::models::{Conversation, NewConversation, User};

use crate::error::ChatError;
use crate::generation::Generation;
use crate::notice::Notices;

/// The signed-in user's conversations, newest first, kept current by
/// reloading on every change to the conversations table.
pub struct ConversationList<B: ChatBackend> {
    inner: Arc<ListInner<B>>,
    notices: Notices,
    cancel: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

struct ListInner<B> {
    backend: Arc<B>,
    user: User,
    state: watch::Sender<Vec<Conversation>>,
    generation: Generation,
    /// Created here but not yet returned by any load.
    unconfirmed: Mutex<Vec<Conversation>>,
}

impl<B: ChatBackend> ListInner<B> {
    fn unconfirmed(&self) -> std::sync::MutexGuard<'_, Vec<Conversation>> {
        match self.unconfirmed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn load(&self) -> Result<(), ChatError> {
        let generation = self.generation.advance();
        let rows = self.backend.list_conversations(self.user.id).await.map_err(|e| {
            error!("Load conversations failed: {}", e);
            ChatError::from(e)
        })?;
        let applied = self.state.send_if_modified(|list| {
            if !self.generation.is_current(generation) {
                return false;
            }
            // A load that started before our own insert landed lacks the row.
            let mut unconfirmed = self.unconfirmed();
            unconfirmed.retain(|c| !rows.iter().any(|r| r.id == c.id));
            *list = unconfirmed.iter().cloned().chain(rows).collect();
            true
        });
        if !applied {
            debug!("Dropped superseded conversation load");
        }
        Ok(())
    }
}

impl<B: ChatBackend> ConversationList<B> {
    /// Load the list and start following changes.
    pub async fn open(backend: Arc<B>, user: User, notices: Notices) -> Self {
        let (state, _) = watch::channel(Vec::new());
        let inner = Arc::new(ListInner {
            backend,
            user,
            state,
            generation: Generation::default(),
            unconfirmed: Mutex::new(Vec::new()),
        });

        let _ = notices.report(inner.load().await);

        let cancel = CancellationToken::new();
        let watcher = match inner.backend.subscribe_conversations().await {
            Ok(subscription) => Some(tokio::spawn(follow_changes(
                inner.clone(),
                subscription,
                cancel.clone(),
                notices.clone(),
            ))),
            Err(e) => {
                error!("Subscribe to conversations failed: {}", e);
                notices.error(e.to_string());
                None
            }
        };

        Self {
            inner,
            notices,
            cancel,
            watcher,
        }
    }

    pub fn user(&self) -> &User {
        &self.inner.user
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Conversation>> {
        self.inner.state.subscribe()
    }

    pub async fn reload(&self) -> Result<(), ChatError> {
        self.inner.load().await
    }

    /// Start a conversation with `other_user_id`. The new row is shown right
    /// away instead of waiting for its change notification.
    ///
    /// Duplicate pairs are not checked here.
    pub async fn create(&self, other_user_id: &str) -> Result<Conversation, ChatError> {
        let notices = &self.notices;
        let raw = other_user_id.trim();
        if raw.is_empty() {
            return notices.report(Err(ChatError::validation("Enter other user id")));
        }
        let Ok(other) = raw.parse::<Uuid>() else {
            return notices.report(Err(ChatError::validation("Invalid user id")));
        };

        let created = self
            .inner
            .backend
            .create_conversation(NewConversation {
                user1_id: self.inner.user.id,
                user2_id: other,
            })
            .await
            .map_err(ChatError::from);
        let conversation = notices.report(created)?;

        // Its change notification may have beaten the response here.
        self.inner.unconfirmed().insert(0, conversation.clone());
        self.inner.state.send_if_modified(|list| {
            if list.iter().any(|c| c.id == conversation.id) {
                return false;
            }
            list.insert(0, conversation.clone());
            true
        });
        Ok(conversation)
    }

    /// Stop following changes and release the subscription.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
    }
}

impl<B: ChatBackend> Drop for ConversationList<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn follow_changes<B: ChatBackend>(
    inner: Arc<ListInner<B>>,
    mut subscription: Subscription<Conversation>,
    cancel: CancellationToken,
    notices: Notices,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            change = subscription.next() => match change {
                Some(change) => {
                    debug!("Conversations changed ({:?}), reloading", change.kind);
                    if let Err(e) = inner.load().await {
                        warn!("Reload after change failed: {}", e);
                    }
                }
                None => {
                    warn!("Conversation feed ended");
                    notices.error("Live conversation updates stopped");
                    break;
                }
            },
        }
    }
    subscription.release();
}
