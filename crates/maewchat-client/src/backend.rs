//! The seams the views are written against. [`PublicClient`] implements both
//! traits against the hosted platform.

use async_trait::async_trait;
use uuid::Uuid;

use maewchat_types::events::{ChangeKind, PostgresChangeFilter};
use maewchat_types::models::{Conversation, Message, NewConversation, NewMessage, Session, User};

use crate::auth::AuthEvents;
use crate::client::PublicClient;
use crate::error::ClientError;
use crate::realtime::Subscription;
use crate::rest::{self, CONVERSATIONS, MESSAGES};

#[async_trait]
pub trait AuthBackend: Send + Sync + 'static {
    async fn current_user(&self) -> Result<Option<User>, ClientError>;

    fn auth_events(&self) -> AuthEvents;

    async fn request_magic_link(&self, email: &str) -> Result<(), ClientError>;

    async fn verify_otp(&self, email: &str, code: &str) -> Result<Session, ClientError>;

    async fn complete_magic_link(&self, url: &str) -> Result<Session, ClientError>;

    async fn sign_out(&self) -> Result<(), ClientError>;
}

#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Conversations where `user_id` is either participant, newest first.
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, ClientError>;

    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, ClientError>;

    /// Messages of a conversation, oldest first.
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, ClientError>;

    async fn insert_message(&self, new: NewMessage) -> Result<Message, ClientError>;

    /// Every change to the conversations table, unfiltered.
    async fn subscribe_conversations(&self) -> Result<Subscription<Conversation>, ClientError>;

    /// Inserts into one conversation.
    async fn subscribe_messages(&self, conversation_id: Uuid) -> Result<Subscription<Message>, ClientError>;
}

#[async_trait]
impl AuthBackend for PublicClient {
    async fn current_user(&self) -> Result<Option<User>, ClientError> {
        self.auth().get_user().await
    }

    fn auth_events(&self) -> AuthEvents {
        self.auth().subscribe()
    }

    async fn request_magic_link(&self, email: &str) -> Result<(), ClientError> {
        self.auth().request_magic_link(email).await
    }

    async fn verify_otp(&self, email: &str, code: &str) -> Result<Session, ClientError> {
        self.auth().verify_otp(email, code).await
    }

    async fn complete_magic_link(&self, url: &str) -> Result<Session, ClientError> {
        self.auth().session_from_url(url).await
    }

    async fn sign_out(&self) -> Result<(), ClientError> {
        self.auth().sign_out().await
    }
}

#[async_trait]
impl ChatBackend for PublicClient {
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, ClientError> {
        let bearer = self.auth().bearer().await;
        self.rest()
            .select(CONVERSATIONS, &rest::conversations_for(user_id), &bearer)
            .await
    }

    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, ClientError> {
        let bearer = self.auth().bearer().await;
        self.rest().insert_single(CONVERSATIONS, &new, &bearer).await
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, ClientError> {
        let bearer = self.auth().bearer().await;
        self.rest()
            .select(MESSAGES, &rest::messages_in(conversation_id), &bearer)
            .await
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message, ClientError> {
        let bearer = self.auth().bearer().await;
        self.rest().insert_single(MESSAGES, &new, &bearer).await
    }

    async fn subscribe_conversations(&self) -> Result<Subscription<Conversation>, ClientError> {
        self.keep_realtime_authorized();
        let bearer = self.auth().bearer().await;
        self.realtime()
            .subscribe(
                "public:conversations",
                &[PostgresChangeFilter::table(CONVERSATIONS)],
                &bearer,
            )
            .await
    }

    async fn subscribe_messages(&self, conversation_id: Uuid) -> Result<Subscription<Message>, ClientError> {
        self.keep_realtime_authorized();
        let bearer = self.auth().bearer().await;
        let filter = PostgresChangeFilter::table(MESSAGES)
            .on(ChangeKind::Insert)
            .where_eq("conversation_id", conversation_id);
        let name = format!("messages:{}", filter.filter.as_deref().unwrap_or_default());
        self.realtime().subscribe(&name, &[filter], &bearer).await
    }
}
