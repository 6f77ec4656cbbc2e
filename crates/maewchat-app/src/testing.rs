//! In-memory stand-in for the hosted platform.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Notify, broadcast, mpsc, watch};
use uuid::Uuid;

use maewchat_client::auth::AuthEvents;
use maewchat_client::{AuthBackend, ChatBackend, ClientError, Subscription};
use maewchat_types::events::{AuthEvent, AuthEventKind, ChangeData, ChangeKind};
use maewchat_types::models::{
    Conversation, Message, NewConversation, NewMessage, Session, User, UserMetadata,
};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn user(email: &str) -> User {
    User {
        id: Uuid::new_v4(),
        email: Some(email.into()),
        user_metadata: UserMetadata::default(),
    }
}

pub fn session_for(user: &User) -> Session {
    Session {
        access_token: format!("token-{}", user.id),
        refresh_token: "refresh".into(),
        token_type: "bearer".into(),
        expires_in: 3600,
        expires_at: Some(Utc::now().timestamp() + 3600),
        user: user.clone(),
    }
}

pub fn conversation(a: Uuid, b: Uuid, created: i64) -> Conversation {
    Conversation {
        id: Uuid::new_v4(),
        user1_id: a,
        user2_id: b,
        created_at: at(created),
    }
}

pub fn message(conversation_id: Uuid, sender_id: Uuid, content: &str, created: i64) -> Message {
    Message {
        id: Uuid::new_v4(),
        conversation_id,
        sender_id,
        content: content.into(),
        created_at: at(created),
    }
}

fn change<T: serde::Serialize>(kind: ChangeKind, table: &str, record: &T) -> ChangeData {
    serde_json::from_value(serde_json::json!({
        "type": kind,
        "schema": "public",
        "table": table,
        "record": record,
    }))
    .unwrap()
}

#[derive(Default)]
pub struct FakeBackend {
    pub conversations: Mutex<Vec<Conversation>>,
    pub messages: Mutex<Vec<Message>>,
    pub inserted: Mutex<Vec<NewMessage>>,
    pub magic_links: Mutex<Vec<String>>,
    pub list_conversation_calls: AtomicUsize,
    session: Mutex<Option<Session>>,
    auth_events: Mutex<Option<broadcast::Sender<AuthEvent>>>,
    failure: Mutex<Option<String>>,
    gates: Mutex<HashMap<Uuid, Arc<Notify>>>,
    list_gate: Mutex<Option<Arc<Notify>>>,
    conversation_feeds: Mutex<Vec<mpsc::UnboundedSender<ChangeData>>>,
    message_feeds: Mutex<HashMap<Uuid, Vec<mpsc::UnboundedSender<ChangeData>>>>,
    active_subscriptions: Arc<AtomicUsize>,
    clock: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signed_in(user: &User) -> Arc<Self> {
        let backend = Self::default();
        *backend.session.lock().unwrap() = Some(session_for(user));
        Arc::new(backend)
    }

    /// Make the next backend call fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.into());
    }

    fn take_failure(&self) -> Result<(), ClientError> {
        match self.failure.lock().unwrap().take() {
            Some(message) => Err(ClientError::Api { status: 400, message }),
            None => Ok(()),
        }
    }

    /// Hold `list_messages` for `conversation_id` until the returned gate is
    /// notified.
    pub fn gate(&self, conversation_id: Uuid) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(conversation_id, gate.clone());
        gate
    }

    /// Hold the next `list_conversations` call until the returned gate is
    /// notified. Later calls go through.
    pub fn gate_next_list(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.list_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Close every change feed, as a dropped socket would.
    pub fn end_feeds(&self) {
        self.conversation_feeds.lock().unwrap().clear();
        self.message_feeds.lock().unwrap().clear();
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active_subscriptions.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Sender<AuthEvent> {
        self.auth_events
            .lock()
            .unwrap()
            .get_or_insert_with(|| broadcast::channel(16).0)
            .clone()
    }

    pub fn push_session(&self, kind: AuthEventKind, session: Option<Session>) {
        *self.session.lock().unwrap() = session.clone();
        let _ = self.events().send(AuthEvent { kind, session });
    }

    fn sender_id(&self) -> Uuid {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.user.id)
            .unwrap_or_default()
    }

    fn tick(&self) -> i64 {
        1000 + self.clock.fetch_add(1, Ordering::SeqCst) as i64
    }

    fn track<T: serde::de::DeserializeOwned>(
        &self,
        topic: String,
        rx: mpsc::UnboundedReceiver<ChangeData>,
    ) -> Subscription<T> {
        self.active_subscriptions.fetch_add(1, Ordering::SeqCst);
        let active = self.active_subscriptions.clone();
        Subscription::new(topic, rx, move || {
            active.fetch_sub(1, Ordering::SeqCst);
        })
    }

    /// Push a change notification on the conversations feed.
    pub fn publish_conversation(&self, kind: ChangeKind, conversation: &Conversation) {
        let data = change(kind, "conversations", conversation);
        self.conversation_feeds
            .lock()
            .unwrap()
            .retain(|tx| tx.send(data.clone()).is_ok());
    }

    /// Deliver the insert notification for a stored message.
    pub fn deliver(&self, message: &Message) {
        let data = change(ChangeKind::Insert, "messages", message);
        if let Some(feeds) = self.message_feeds.lock().unwrap().get_mut(&message.conversation_id) {
            feeds.retain(|tx| tx.send(data.clone()).is_ok());
        }
    }
}

#[async_trait]
impl AuthBackend for FakeBackend {
    async fn current_user(&self) -> Result<Option<User>, ClientError> {
        self.take_failure()?;
        Ok(self.session.lock().unwrap().as_ref().map(|s| s.user.clone()))
    }

    fn auth_events(&self) -> AuthEvents {
        let rx = self.events().subscribe();
        let initial = AuthEvent {
            kind: AuthEventKind::InitialSession,
            session: self.session.lock().unwrap().clone(),
        };
        AuthEvents::new(Some(initial), rx)
    }

    async fn request_magic_link(&self, email: &str) -> Result<(), ClientError> {
        self.magic_links.lock().unwrap().push(email.into());
        self.take_failure()
    }

    async fn verify_otp(&self, email: &str, _code: &str) -> Result<Session, ClientError> {
        self.take_failure()?;
        let session = session_for(&user(email));
        self.push_session(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn complete_magic_link(&self, _url: &str) -> Result<Session, ClientError> {
        self.take_failure()?;
        let session = session_for(&user("link@example.com"));
        self.push_session(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), ClientError> {
        let result = self.take_failure();
        self.push_session(AuthEventKind::SignedOut, None);
        result
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, ClientError> {
        self.list_conversation_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.list_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.take_failure()?;
        let mut rows: Vec<Conversation> = self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.involves(user_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, ClientError> {
        self.take_failure()?;
        let row = Conversation {
            id: Uuid::new_v4(),
            user1_id: new.user1_id,
            user2_id: new.user2_id,
            created_at: at(self.tick()),
        };
        self.conversations.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, ClientError> {
        let gate = self.gates.lock().unwrap().get(&conversation_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.take_failure()?;
        let mut rows: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, ClientError> {
        self.take_failure()?;
        self.inserted.lock().unwrap().push(new.clone());
        let row = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: self.sender_id(),
            content: new.content,
            created_at: at(self.tick()),
        };
        self.messages.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn subscribe_conversations(&self) -> Result<Subscription<Conversation>, ClientError> {
        self.take_failure()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.conversation_feeds.lock().unwrap().push(tx);
        Ok(self.track("realtime:public:conversations".into(), rx))
    }

    async fn subscribe_messages(&self, conversation_id: Uuid) -> Result<Subscription<Message>, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.message_feeds
            .lock()
            .unwrap()
            .entry(conversation_id)
            .or_default()
            .push(tx);
        Ok(self.track(format!("realtime:messages:conversation_id=eq.{conversation_id}"), rx))
    }
}

/// Wait until the watched value satisfies `ready`.
pub async fn settle<T: Clone>(rx: &mut watch::Receiver<T>, ready: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(ready))
        .await
        .expect("view did not settle")
        .expect("view dropped")
        .clone()
}

/// Poll `ready` until it holds.
pub async fn until(mut ready: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Next notice, waiting for it if needed.
pub async fn next_notice(rx: &mut mpsc::UnboundedReceiver<crate::notice::Notice>) -> crate::notice::Notice {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no notice")
        .expect("notices closed")
}

/// Drain every notice queued so far.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<crate::notice::Notice>) -> Vec<crate::notice::Notice> {
    let mut notices = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        notices.push(notice);
    }
    notices
}
