use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use maewchat_types::events::{AuthEvent, AuthEventKind};
use maewchat_types::models::{Session, User};

use crate::config::endpoint;
use crate::error::{ClientError, check};

/// Refresh the access token when it has less than this left.
const REFRESH_MARGIN_SECS: i64 = 10;

/// Default lifetime the auth service gives access tokens.
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Auth sub-client: magic links, session storage and session-change events.
pub struct AuthClient {
    http: reqwest::Client,
    base: Url,
    api_key: String,
    redirect_to: Option<String>,
    session: RwLock<Option<Session>>,
    events: broadcast::Sender<AuthEvent>,
}

/// Stream of session changes. Starts with an `InitialSession` event carrying
/// the session stored when the stream was created.
pub struct AuthEvents {
    initial: Option<AuthEvent>,
    rx: broadcast::Receiver<AuthEvent>,
}

impl AuthEvents {
    pub fn new(initial: Option<AuthEvent>, rx: broadcast::Receiver<AuthEvent>) -> Self {
        Self { initial, rx }
    }

    pub async fn next(&mut self) -> Option<AuthEvent> {
        if let Some(event) = self.initial.take() {
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Auth listener lagged by {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct LinkParams {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl AuthClient {
    pub(crate) fn new(
        http: reqwest::Client,
        project: &Url,
        api_key: String,
        redirect_to: Option<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            http,
            base: endpoint(project, "auth/v1"),
            api_key,
            redirect_to,
            session: RwLock::new(None),
            events,
        }
    }

    fn url(&self, path: &str) -> Url {
        endpoint(&self.base, path)
    }

    pub fn session(&self) -> Option<Session> {
        match self.session.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe(&self) -> AuthEvents {
        let rx = self.events.subscribe();
        let initial = AuthEvent {
            kind: AuthEventKind::InitialSession,
            session: self.session(),
        };
        AuthEvents::new(Some(initial), rx)
    }

    fn store(&self, kind: AuthEventKind, session: Option<Session>) {
        match self.session.write() {
            Ok(mut guard) => *guard = session.clone(),
            Err(poisoned) => *poisoned.into_inner() = session.clone(),
        }
        // No listeners is fine.
        let _ = self.events.send(AuthEvent { kind, session });
    }

    fn establish(&self, kind: AuthEventKind, mut session: Session) -> Session {
        if session.expires_at.is_none() {
            session.expires_at = Some(Utc::now().timestamp() + session.expires_in);
        }
        info!("Session {:?} for user {}", kind, session.user.id);
        self.store(kind, Some(session.clone()));
        session
    }

    /// Token for the `Authorization` header: the session's access token,
    /// refreshed first when close to expiry, or the anonymous key.
    pub async fn bearer(&self) -> String {
        let Some(session) = self.session() else {
            return self.api_key.clone();
        };
        if session.expires_within(Utc::now(), REFRESH_MARGIN_SECS) {
            match self.refresh_session().await {
                Ok(fresh) => return fresh.access_token,
                Err(e) => warn!("Token refresh failed: {}", e),
            }
        }
        session.access_token
    }

    /// Ask the auth service to email a one-time sign-in link. Nothing changes
    /// locally until the link is used.
    pub async fn request_magic_link(&self, email: &str) -> Result<(), ClientError> {
        let mut url = self.url("otp");
        if let Some(redirect) = &self.redirect_to {
            url.query_pairs_mut().append_pair("redirect_to", redirect);
        }
        debug!("Requesting magic link for {}", email);
        check(
            self.http
                .post(url)
                .bearer_auth(&self.api_key)
                .json(&json!({ "email": email, "create_user": true }))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    /// Exchange the one-time code from the sign-in email for a session.
    pub async fn verify_otp(&self, email: &str, code: &str) -> Result<Session, ClientError> {
        let session: Session = check(
            self.http
                .post(self.url("verify"))
                .bearer_auth(&self.api_key)
                .json(&json!({ "type": "email", "email": email, "token": code }))
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Ok(self.establish(AuthEventKind::SignedIn, session))
    }

    /// Finish sign-in from the URL a magic link redirected to. The tokens
    /// arrive in the fragment (`#access_token=...`), or in the query for some
    /// redirect setups.
    pub async fn session_from_url(&self, link: &str) -> Result<Session, ClientError> {
        let url = Url::parse(link.trim())?;
        let mut params: HashMap<String, String> = url
            .fragment()
            .map(|f| url::form_urlencoded::parse(f.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        if !params.contains_key("access_token") && !params.contains_key("error_description") {
            params = url.query_pairs().into_owned().collect();
        }

        if let Some(description) = params.get("error_description") {
            return Err(ClientError::Invalid(description.clone()));
        }

        let link: LinkParams = serde_json::from_value(json!({
            "access_token": params.get("access_token"),
            "refresh_token": params.get("refresh_token"),
            "token_type": params.get("token_type"),
            "expires_in": params.get("expires_in").and_then(|v| v.parse::<i64>().ok()),
            "expires_at": params.get("expires_at").and_then(|v| v.parse::<i64>().ok()),
        }))
        .map_err(|_| ClientError::Invalid("Link does not contain a session".into()))?;

        let user = self.fetch_user(&link.access_token).await?;
        let session = Session {
            access_token: link.access_token,
            refresh_token: link.refresh_token,
            token_type: link.token_type.unwrap_or_else(|| "bearer".into()),
            expires_in: link.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
            expires_at: link.expires_at,
            user,
        };
        Ok(self.establish(AuthEventKind::SignedIn, session))
    }

    pub async fn refresh_session(&self) -> Result<Session, ClientError> {
        let current = self.session().ok_or(ClientError::NotSignedIn)?;
        let mut url = self.url("token");
        url.query_pairs_mut().append_pair("grant_type", "refresh_token");
        let session: Session = check(
            self.http
                .post(url)
                .bearer_auth(&self.api_key)
                .json(&json!({ "refresh_token": current.refresh_token }))
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Ok(self.establish(AuthEventKind::TokenRefreshed, session))
    }

    /// Refresh ahead of time when the session has less than `margin_secs`
    /// left. Returns whether a refresh happened.
    pub async fn refresh_if_expiring(&self, margin_secs: i64) -> Result<bool, ClientError> {
        match self.session() {
            Some(session) if session.expires_within(Utc::now(), margin_secs) => {
                self.refresh_session().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fetch_user(&self, access_token: &str) -> Result<User, ClientError> {
        Ok(check(
            self.http
                .get(self.url("user"))
                .bearer_auth(access_token)
                .send()
                .await?,
        )
        .await?
        .json()
        .await?)
    }

    /// The signed-in user as the auth service currently sees it, or `None`
    /// without a session.
    pub async fn get_user(&self) -> Result<Option<User>, ClientError> {
        if self.session().is_none() {
            return Ok(None);
        }
        let token = self.bearer().await;
        let user = self.fetch_user(&token).await?;
        if let Ok(mut guard) = self.session.write() {
            if let Some(session) = guard.as_mut() {
                session.user = user.clone();
            }
        }
        Ok(Some(user))
    }

    /// Revoke the session on the auth service. The local session is cleared
    /// and `SignedOut` emitted even when the revoke call fails.
    pub async fn sign_out(&self) -> Result<(), ClientError> {
        let result = match self.session() {
            Some(session) => self
                .http
                .post(self.url("logout"))
                .bearer_auth(&session.access_token)
                .send()
                .await
                .map_err(ClientError::from),
            None => {
                self.store(AuthEventKind::SignedOut, None);
                return Ok(());
            }
        };
        self.store(AuthEventKind::SignedOut, None);
        check(result?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, http::HeaderMap, routing::{get, post}};
    use serde_json::Value;

    use super::*;

    const USER_ID: &str = "a7c0e3a4-8f5e-4a70-b6c1-3c2d1e0f9b88";

    #[derive(Clone, Default)]
    struct Seen {
        requests: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
    }

    fn user_json() -> Value {
        json!({ "id": USER_ID, "email": "you@example.com" })
    }

    /// Throwaway auth service on a random local port.
    async fn fake_auth() -> (Url, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .route(
                "/auth/v1/otp",
                post(|State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    seen.requests.lock().unwrap().push(("otp".into(), auth, body));
                    Json(json!({}))
                }),
            )
            .route(
                "/auth/v1/user",
                get(|| async { Json(user_json()) }),
            )
            .route(
                "/auth/v1/token",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({
                        "access_token": format!("after-{}", body["refresh_token"].as_str().unwrap_or_default()),
                        "refresh_token": "rt2",
                        "token_type": "bearer",
                        "expires_in": 3600,
                        "user": user_json(),
                    }))
                }),
            )
            .route(
                "/auth/v1/logout",
                post(|| async { axum::http::StatusCode::NO_CONTENT }),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (Url::parse(&format!("http://{addr}")).unwrap(), seen)
    }

    fn client(project: &Url) -> AuthClient {
        AuthClient::new(reqwest::Client::new(), project, "anon".into(), None)
    }

    #[tokio::test]
    async fn magic_link_is_one_call_and_no_session() {
        let (project, seen) = fake_auth().await;
        let auth = client(&project);

        auth.request_magic_link("you@example.com").await.unwrap();

        let requests = seen.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.as_deref(), Some("Bearer anon"));
        assert_eq!(requests[0].2["email"], "you@example.com");
        assert!(auth.session().is_none());
    }

    #[tokio::test]
    async fn link_fragment_establishes_session() {
        let (project, _) = fake_auth().await;
        let auth = client(&project);
        let mut events = auth.subscribe();

        let initial = events.next().await.unwrap();
        assert_eq!(initial.kind, AuthEventKind::InitialSession);
        assert!(initial.session.is_none());

        let session = auth
            .session_from_url(
                "http://localhost:3000/chat#access_token=at&refresh_token=rt&expires_in=3600&token_type=bearer&type=magiclink",
            )
            .await
            .unwrap();
        assert_eq!(session.access_token, "at");
        assert!(session.expires_at.is_some());
        assert_eq!(session.user.id.to_string(), USER_ID);

        let signed_in = events.next().await.unwrap();
        assert_eq!(signed_in.kind, AuthEventKind::SignedIn);
        assert_eq!(auth.bearer().await, "at");
    }

    #[tokio::test]
    async fn refreshes_only_close_to_expiry() {
        let (project, _) = fake_auth().await;
        let auth = client(&project);
        auth.session_from_url("http://localhost/#access_token=at&refresh_token=rt&expires_in=30")
            .await
            .unwrap();
        let mut events = auth.subscribe();
        events.next().await.unwrap();

        assert!(!auth.refresh_if_expiring(10).await.unwrap());
        assert!(auth.refresh_if_expiring(60).await.unwrap());

        let refreshed = events.next().await.unwrap();
        assert_eq!(refreshed.kind, AuthEventKind::TokenRefreshed);
        assert_eq!(refreshed.session.unwrap().access_token, "after-rt");
        assert_eq!(auth.bearer().await, "after-rt");
    }

    #[tokio::test]
    async fn link_error_is_surfaced() {
        let auth = client(&Url::parse("http://127.0.0.1:9").unwrap());
        let err = auth
            .session_from_url("http://localhost:3000/#error=access_denied&error_description=Email+link+is+invalid+or+has+expired")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Email link is invalid or has expired");
    }

    #[tokio::test]
    async fn link_without_tokens_is_rejected() {
        let auth = client(&Url::parse("http://127.0.0.1:9").unwrap());
        let err = auth.session_from_url("http://localhost:3000/chat").await.unwrap_err();
        assert!(matches!(err, ClientError::Invalid(_)));
    }

    #[tokio::test]
    async fn sign_out_clears_session_and_notifies() {
        let (project, _) = fake_auth().await;
        let auth = client(&project);
        auth.session_from_url("http://localhost/#access_token=at&refresh_token=rt")
            .await
            .unwrap();

        let mut events = auth.subscribe();
        assert!(events.next().await.unwrap().session.is_some());

        auth.sign_out().await.unwrap();
        let event = events.next().await.unwrap();
        assert_eq!(event.kind, AuthEventKind::SignedOut);
        assert!(event.session.is_none());
        assert!(auth.session().is_none());
        assert_eq!(auth.bearer().await, "anon");
    }
}
