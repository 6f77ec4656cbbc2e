use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use maewchat_client::ChatBackend;
use maewchat_types::models::{Conversation, Message, NewMessage, User};

use crate::error::ChatError;
use crate::generation::Generation;
use crate::notice::Notices;

/// What the message pane shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadView {
    pub conversation: Option<Conversation>,
    /// Oldest first; live inserts are appended in arrival order.
    pub messages: Vec<Message>,
    /// Newest message, which the pane keeps scrolled into view.
    pub scroll_to: Option<Uuid>,
    pub loading: bool,
}

/// Messages of the selected conversation.
///
/// Selecting a conversation loads its history and follows its inserts. Sent
/// messages are not added locally: they show up when their insert
/// notification comes back.
pub struct MessageThread<B: ChatBackend> {
    backend: Arc<B>,
    me: User,
    state: Arc<watch::Sender<ThreadView>>,
    notices: Notices,
    generation: Generation,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<B: ChatBackend> MessageThread<B> {
    pub fn new(backend: Arc<B>, me: User, notices: Notices) -> Self {
        let (state, _) = watch::channel(ThreadView::default());
        Self {
            backend,
            me,
            state: Arc::new(state),
            notices,
            generation: Generation::default(),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn view(&self) -> ThreadView {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ThreadView> {
        self.state.subscribe()
    }

    pub fn is_mine(&self, message: &Message) -> bool {
        message.sender_id == self.me.id
    }

    /// Switch to `conversation`. Whatever the previous selection still had in
    /// flight is cancelled and can no longer touch the view.
    pub fn select(&mut self, conversation: Conversation) {
        self.teardown();
        let generation = self.generation.advance();
        let conversation_id = conversation.id;
        self.state.send_replace(ThreadView {
            conversation: Some(conversation),
            messages: Vec::new(),
            scroll_to: None,
            loading: true,
        });

        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();
        self.task = Some(tokio::spawn(follow(
            self.backend.clone(),
            conversation_id,
            Tracked {
                state: self.state.clone(),
                generation: self.generation.clone(),
                mine: generation,
            },
            cancel,
            self.notices.clone(),
        )));
    }

    /// Deselect and empty the pane.
    pub fn clear(&mut self) {
        self.teardown();
        self.generation.advance();
        self.state.send_replace(ThreadView::default());
    }

    fn teardown(&mut self) {
        self.cancel.cancel();
        // The task notices the cancellation on its own and releases its
        // subscription; nothing it does afterwards can reach the view.
        self.task = None;
    }

    /// Submit `text` to the selected conversation.
    pub async fn send(&self, text: &str) -> Result<Message, ChatError> {
        if text.trim().is_empty() {
            return self.notices.report(Err(ChatError::validation("Message is empty")));
        }
        let selected = self.state.borrow().conversation.as_ref().map(|c| c.id);
        let Some(conversation_id) = selected else {
            return self
                .notices
                .report(Err(ChatError::validation("Select a conversation first")));
        };

        let result = self
            .backend
            .insert_message(NewMessage {
                conversation_id,
                content: text.to_string(),
            })
            .await
            .map_err(ChatError::from);
        if let Ok(message) = &result {
            debug!("Sent message {} to {}", message.id, conversation_id);
        }
        self.notices.report(result)
    }

    /// Cancel the selection and wait until its subscription is released.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<B: ChatBackend> Drop for MessageThread<B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle on the view that only writes while its generation is current.
struct Tracked {
    state: Arc<watch::Sender<ThreadView>>,
    generation: Generation,
    mine: u64,
}

impl Tracked {
    fn is_current(&self) -> bool {
        self.generation.is_current(self.mine)
    }

    /// Apply `change` and scroll to the newest message. The generation is
    /// checked under the view lock so a concurrent `select` cannot slip in
    /// between check and write.
    fn apply(&self, change: impl FnOnce(&mut ThreadView)) -> bool {
        let applied = self.state.send_if_modified(|view| {
            if !self.generation.is_current(self.mine) {
                return false;
            }
            change(view);
            view.scroll_to = view.messages.last().map(|m| m.id);
            true
        });
        if !applied {
            debug!("Dropped update for a deselected conversation");
        }
        applied
    }
}

async fn follow<B: ChatBackend>(
    backend: Arc<B>,
    conversation_id: Uuid,
    view: Tracked,
    cancel: CancellationToken,
    notices: Notices,
) {
    let started = async {
        tokio::join!(
            backend.list_messages(conversation_id),
            backend.subscribe_messages(conversation_id),
        )
    };
    let (history, subscription) = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        started = started => started,
    };

    // Inserts that landed while the history query ran are buffered in the
    // subscription and may already be part of the history.
    let mut loaded = HashSet::new();
    match history {
        Ok(messages) => {
            loaded.extend(messages.iter().map(|m| m.id));
            view.apply(|v| {
                v.messages = messages;
                v.loading = false;
            });
        }
        Err(e) => {
            error!("Load messages for {} failed: {}", conversation_id, e);
            view.apply(|v| v.loading = false);
            if view.is_current() {
                notices.error(e.to_string());
            }
        }
    }

    let mut subscription = match subscription {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("Subscribe to messages of {} failed: {}", conversation_id, e);
            if view.is_current() {
                notices.error(e.to_string());
            }
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            change = subscription.next() => match change {
                Some(change) => match change.record {
                    Some(message) if loaded.contains(&message.id) => {
                        debug!("Skipping {} already in history", message.id);
                    }
                    Some(message) => {
                        view.apply(|v| v.messages.push(message));
                    }
                    None => {}
                },
                None => {
                    warn!("Message feed for {} ended", conversation_id);
                    if view.is_current() {
                        notices.error("Live updates for this conversation stopped");
                    }
                    break;
                }
            },
        }
    }
    subscription.release();
}
