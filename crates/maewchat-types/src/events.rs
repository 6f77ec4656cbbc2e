use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Session, User};

// -- Auth --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthEventKind {
    /// Delivered first to every new listener with whatever session is stored.
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// A session change pushed by the auth layer.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn user(&self) -> Option<&User> {
        self.session.as_ref().map(|s| &s.user)
    }
}

// -- Realtime (Phoenix channel frames) --

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const HEARTBEAT: &str = "heartbeat";
pub const POSTGRES_CHANGES: &str = "postgres_changes";
pub const ACCESS_TOKEN: &str = "access_token";
pub const PHOENIX_TOPIC: &str = "phoenix";

/// One frame on the realtime socket, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default)]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    pub fn heartbeat(msg_ref: String) -> Self {
        Self {
            topic: PHOENIX_TOPIC.into(),
            event: HEARTBEAT.into(),
            payload: Value::Object(Default::default()),
            msg_ref: Some(msg_ref),
            join_ref: None,
        }
    }

    pub fn join(topic: &str, payload: Value, msg_ref: String) -> Self {
        Self {
            topic: topic.into(),
            event: PHX_JOIN.into(),
            payload,
            join_ref: Some(msg_ref.clone()),
            msg_ref: Some(msg_ref),
        }
    }

    pub fn leave(topic: &str, msg_ref: String) -> Self {
        Self {
            topic: topic.into(),
            event: PHX_LEAVE.into(),
            payload: Value::Object(Default::default()),
            msg_ref: Some(msg_ref),
            join_ref: None,
        }
    }

    /// Hand a joined channel a fresh JWT before the old one expires.
    pub fn access_token(topic: &str, token: &str, join_ref: &str, msg_ref: String) -> Self {
        Self {
            topic: topic.into(),
            event: ACCESS_TOKEN.into(),
            payload: serde_json::json!({ "access_token": token }),
            msg_ref: Some(msg_ref),
            join_ref: Some(join_ref.into()),
        }
    }
}

/// `payload` of a `phx_reply` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Best-effort reason text for an error reply.
    pub fn reason(&self) -> String {
        self.response
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.response.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

/// A `postgres_changes` binding sent in the join config.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostgresChangeFilter {
    pub event: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresChangeFilter {
    /// Every change on `public.<table>`.
    pub fn table(table: &str) -> Self {
        Self {
            event: ChangeKind::All,
            schema: "public".into(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn on(mut self, event: ChangeKind) -> Self {
        self.event = event;
        self
    }

    pub fn where_eq(mut self, column: &str, value: impl std::fmt::Display) -> Self {
        self.filter = Some(format!("{column}=eq.{value}"));
        self
    }
}

/// Join payload for a channel carrying only `postgres_changes` bindings.
pub fn join_payload(filters: &[PostgresChangeFilter], access_token: &str) -> Value {
    serde_json::json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": filters,
            "private": false,
        },
        "access_token": access_token,
    })
}

/// `payload` of a `postgres_changes` push.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresChangesPayload {
    pub data: ChangeData,
    #[serde(default)]
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeData {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

/// A typed change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    pub kind: ChangeKind,
    /// The new row; `None` for deletes.
    pub record: Option<T>,
    /// Primary key columns of the previous row (all columns under replica
    /// identity full).
    pub old_record: Option<Value>,
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeData {
    pub fn decode<T: DeserializeOwned>(self) -> Result<ChangeEvent<T>, serde_json::Error> {
        let record = match self.kind {
            ChangeKind::Delete => None,
            _ => Some(serde_json::from_value(self.record.unwrap_or(Value::Null))?),
        };
        Ok(ChangeEvent {
            kind: self.kind,
            record,
            old_record: self.old_record,
            commit_timestamp: self.commit_timestamp,
        })
    }
}
