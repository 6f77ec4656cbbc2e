use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use maewchat_client::AuthBackend;
use maewchat_types::models::User;

use crate::error::ChatError;
use crate::notice::Notices;

/// Tracks who is signed in and drives the magic-link flow.
pub struct SessionController<A: AuthBackend> {
    auth: Arc<A>,
    user: Arc<watch::Sender<Option<User>>>,
    notices: Notices,
    listener: Option<JoinHandle<()>>,
}

impl<A: AuthBackend> SessionController<A> {
    pub fn new(auth: Arc<A>, notices: Notices) -> Self {
        let (user, _) = watch::channel(None);
        Self {
            auth,
            user: Arc::new(user),
            notices,
            listener: None,
        }
    }

    /// Adopt the stored session, then follow session changes until
    /// [`stop`](Self::stop).
    pub async fn start(&mut self) {
        self.stop();

        let mut events = self.auth.auth_events();
        if let Some(initial) = events.next().await {
            self.user.send_replace(initial.user().cloned());
        }

        // Refresh the profile from the auth service; keep it only if the
        // identity has not changed meanwhile.
        match self.auth.current_user().await {
            Ok(Some(fresh)) => {
                self.user.send_if_modified(|current| match current {
                    Some(known) if known.id == fresh.id && *known != fresh => {
                        *known = fresh;
                        true
                    }
                    _ => false,
                });
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to fetch current user: {}", e),
        }

        let user = self.user.clone();
        self.listener = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                debug!("Auth event {:?}", event.kind);
                user.send_replace(event.user().cloned());
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }

    pub fn user(&self) -> Option<User> {
        self.user.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<User>> {
        self.user.subscribe()
    }

    /// Email a sign-in link. Identity only changes once the link is used.
    pub async fn request_magic_link(&self, email: &str) -> Result<(), ChatError> {
        let email = email.trim();
        if email.is_empty() {
            return self.notices.report(Err(ChatError::validation("Enter email")));
        }
        let result = self.auth.request_magic_link(email).await.map_err(ChatError::from);
        if result.is_ok() {
            info!("Magic link requested for {}", email);
            self.notices.info("Check your email for the magic link");
        }
        self.notices.report(result)
    }

    /// Sign in with the one-time code from the magic link email.
    pub async fn verify_code(&self, email: &str, code: &str) -> Result<User, ChatError> {
        let (email, code) = (email.trim(), code.trim());
        if email.is_empty() {
            return self.notices.report(Err(ChatError::validation("Enter email")));
        }
        if code.is_empty() {
            return self
                .notices
                .report(Err(ChatError::validation("Enter the code from the email")));
        }
        let result = self.auth.verify_otp(email, code).await;
        self.notices
            .report(result.map(|session| session.user).map_err(ChatError::from))
    }

    /// Sign in from the URL the magic link redirected to.
    pub async fn complete_link(&self, url: &str) -> Result<User, ChatError> {
        let url = url.trim();
        if url.is_empty() {
            return self
                .notices
                .report(Err(ChatError::validation("Paste the link from the email")));
        }
        let result = self.auth.complete_magic_link(url).await;
        self.notices
            .report(result.map(|session| session.user).map_err(ChatError::from))
    }

    /// Revoke the session. Local identity is cleared even if the revoke fails.
    pub async fn sign_out(&self) -> Result<(), ChatError> {
        let result = self.auth.sign_out().await.map_err(ChatError::from);
        self.user.send_replace(None);
        self.notices.report(result)
    }
}

impl<A: AuthBackend> Drop for SessionController<A> {
    fn drop(&mut self) {
        self.stop();
    }
}
