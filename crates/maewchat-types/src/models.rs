use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity issued by the platform's auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

/// Optional display metadata attached to a user by the auth service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub avatar_path: Option<String>,
}

impl User {
    /// Human-readable label: username, then email, then the raw id.
    pub fn display_name(&self) -> String {
        self.user_metadata
            .username
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// An authenticated session as returned by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: i64,
    /// Unix seconds. The auth service sends it on most grants; when absent it
    /// is derived from `expires_in` at the moment the session is stored.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".into()
}

impl Session {
    /// True when the access token expires within `margin_secs` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, margin_secs: i64) -> bool {
        match self.expires_at {
            Some(at) => at - now.timestamp() <= margin_secs,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// The participant that is not `user_id`.
    pub fn peer_of(&self, user_id: Uuid) -> Uuid {
        if self.user1_id == user_id {
            self.user2_id
        } else {
            self.user1_id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// -- Insert payloads --

#[derive(Debug, Clone, Serialize)]
pub struct NewConversation {
    pub user1_id: Uuid,
    pub user2_id: Uuid,
}

/// The sender is not part of the payload: the platform fills `sender_id`
/// from the caller's access token.
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(a: Uuid, b: Uuid) -> Conversation {
        Conversation {
            id: Uuid::new_v4(),
            user1_id: a,
            user2_id: b,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn conversation_participants() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let conv = conversation(a, b);
        assert!(conv.involves(a));
        assert!(conv.involves(b));
        assert!(!conv.involves(c));
        assert_eq!(conv.peer_of(a), b);
        assert_eq!(conv.peer_of(b), a);
    }

    #[test]
    fn message_row_parses_postgres_timestamp() {
        let row = serde_json::json!({
            "id": "5b0f3c52-5d7c-4b8a-9a55-0f0f6a1e8d11",
            "conversation_id": "0d2c1b9e-8a77-4c0e-9f53-2d6d7f4b1a20",
            "sender_id": "a7c0e3a4-8f5e-4a70-b6c1-3c2d1e0f9b88",
            "content": "hello",
            "created_at": "2024-05-01T10:15:30.123456+00:00"
        });
        let msg: Message = serde_json::from_value(row).unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.created_at.timestamp(), 1714558530);
    }

    #[test]
    fn user_without_metadata_falls_back_to_email() {
        let user: User = serde_json::from_value(serde_json::json!({
            "id": "a7c0e3a4-8f5e-4a70-b6c1-3c2d1e0f9b88",
            "email": "you@example.com"
        }))
        .unwrap();
        assert_eq!(user.display_name(), "you@example.com");
    }

    #[test]
    fn session_expiry_margin() {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: None,
            user_metadata: UserMetadata::default(),
        };
        let mut session = Session {
            access_token: "a".into(),
            refresh_token: "r".into(),
            token_type: "bearer".into(),
            expires_in: 3600,
            expires_at: Some(now.timestamp() + 5),
            user,
        };
        assert!(session.expires_within(now, 10));
        session.expires_at = Some(now.timestamp() + 3600);
        assert!(!session.expires_within(now, 10));
    }

    #[test]
    fn new_message_payload_has_no_sender() {
        let payload = NewMessage {
            conversation_id: Uuid::nil(),
            content: "hi".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("sender_id").is_none());
        assert_eq!(json["content"], "hi");
    }
}
