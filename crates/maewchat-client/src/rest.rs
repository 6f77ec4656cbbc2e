use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::config::endpoint;
use crate::error::{ClientError, check};

pub const CONVERSATIONS: &str = "conversations";
pub const MESSAGES: &str = "messages";

/// Accept header that makes the data API return one object instead of an
/// array, failing when the statement affected anything but exactly one row.
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Query string for a table read: `select`, column filters and ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    params: Vec<(String, String)>,
}

impl Select {
    pub fn all() -> Self {
        Self {
            params: vec![("select".into(), "*".into())],
        }
    }

    pub fn eq(mut self, column: &str, value: impl std::fmt::Display) -> Self {
        self.params.push((column.into(), format!("eq.{value}")));
        self
    }

    /// Match rows where any of `(column, value)` is equal.
    pub fn or_eq(mut self, clauses: &[(&str, String)]) -> Self {
        let inner: Vec<String> = clauses
            .iter()
            .map(|(column, value)| format!("{column}.eq.{value}"))
            .collect();
        self.params.push(("or".into(), format!("({})", inner.join(","))));
        self
    }

    pub fn order(mut self, column: &str, order: Order) -> Self {
        let dir = match order {
            Order::Asc => "asc",
            Order::Desc => "desc",
        };
        self.params.push(("order".into(), format!("{column}.{dir}")));
        self
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

/// Conversations where `user_id` is either participant, newest first.
pub fn conversations_for(user_id: Uuid) -> Select {
    Select::all()
        .or_eq(&[("user1_id", user_id.to_string()), ("user2_id", user_id.to_string())])
        .order("created_at", Order::Desc)
}

/// Messages of one conversation, oldest first.
pub fn messages_in(conversation_id: Uuid) -> Select {
    Select::all()
        .eq("conversation_id", conversation_id)
        .order("created_at", Order::Asc)
}

/// Data sub-client over the platform's table API.
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
}

impl RestClient {
    pub(crate) fn new(http: reqwest::Client, project: &Url) -> Self {
        Self {
            http,
            base: endpoint(project, "rest/v1"),
        }
    }

    pub fn table_url(&self, table: &str) -> Url {
        endpoint(&self.base, table)
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &Select,
        bearer: &str,
    ) -> Result<Vec<T>, ClientError> {
        debug!("select {} {:?}", table, query.params());
        let response = self
            .http
            .get(self.table_url(table))
            .query(query.params())
            .bearer_auth(bearer)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Insert one row and return it as stored.
    pub async fn insert_single<T, B>(&self, table: &str, body: &B, bearer: &str) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        debug!("insert into {}", table);
        let response = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .header(reqwest::header::ACCEPT, SINGLE_OBJECT)
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}
