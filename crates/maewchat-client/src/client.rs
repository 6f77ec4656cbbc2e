use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, warn};

use maewchat_types::events::{AuthEvent, AuthEventKind};

use crate::auth::{AuthClient, AuthEvents};
use crate::config::PublicConfig;
use crate::error::ClientError;
use crate::realtime::RealtimeClient;
use crate::rest::RestClient;

/// The browser-safe platform client. Build it once at start-up and hand
/// clones to every view; clones share the session and the realtime socket.
#[derive(Clone)]
pub struct PublicClient {
    inner: Arc<PublicClientInner>,
}

struct PublicClientInner {
    auth: AuthClient,
    rest: RestClient,
    realtime: RealtimeClient,
    token_sync: AtomicBool,
}

/// How often the session is checked for an upcoming expiry while realtime
/// channels are in use.
const TOKEN_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Refresh this long before the access token expires.
const REFRESH_AHEAD_SECS: i64 = 60;

/// HTTP client that sends `apikey` on every request.
pub(crate) fn http_client(api_key: &str) -> Result<reqwest::Client, ClientError> {
    let mut headers = HeaderMap::new();
    let mut key = HeaderValue::from_str(api_key)?;
    key.set_sensitive(true);
    headers.insert("apikey", key);
    Ok(reqwest::Client::builder().default_headers(headers).build()?)
}

impl PublicClient {
    pub fn new(config: PublicConfig) -> Result<Self, ClientError> {
        let http = http_client(&config.anon_key)?;
        Ok(Self {
            inner: Arc::new(PublicClientInner {
                auth: AuthClient::new(
                    http.clone(),
                    &config.url,
                    config.anon_key.clone(),
                    config.redirect_to.clone(),
                ),
                rest: RestClient::new(http, &config.url),
                realtime: RealtimeClient::new(&config.url, &config.anon_key)?,
                token_sync: AtomicBool::new(false),
            }),
        })
    }

    pub fn auth(&self) -> &AuthClient {
        &self.inner.auth
    }

    pub fn rest(&self) -> &RestClient {
        &self.inner.rest
    }

    pub fn realtime(&self) -> &RealtimeClient {
        &self.inner.realtime
    }

    /// Keep joined realtime channels authorized: refresh the session before it
    /// expires and hand every new access token to the socket. Started once, by
    /// the first subscription; stops when the client is dropped.
    pub(crate) fn keep_realtime_authorized(&self) {
        if self.inner.token_sync.swap(true, Ordering::AcqRel) {
            return;
        }
        let events = self.inner.auth.subscribe();
        tokio::spawn(sync_realtime_token(Arc::downgrade(&self.inner), events));
    }
}

/// The access token a realtime channel should switch to after `event`.
fn fresh_token(event: &AuthEvent) -> Option<&str> {
    match event.kind {
        AuthEventKind::SignedIn | AuthEventKind::TokenRefreshed => {
            event.session.as_ref().map(|s| s.access_token.as_str())
        }
        AuthEventKind::InitialSession | AuthEventKind::SignedOut => None,
    }
}

async fn sync_realtime_token(client: Weak<PublicClientInner>, mut events: AuthEvents) {
    let mut ticker = tokio::time::interval(TOKEN_CHECK_INTERVAL);
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let Some(inner) = client.upgrade() else { break };
                if let Some(token) = fresh_token(&event) {
                    debug!("Forwarding {:?} token to realtime", event.kind);
                    inner.realtime.set_auth(token);
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = client.upgrade() else { break };
                // A successful refresh comes back through `events`.
                if let Err(e) = inner.auth.refresh_if_expiring(REFRESH_AHEAD_SECS).await {
                    warn!("Token refresh failed: {}", e);
                }
            }
        }
    }
}
