use thiserror::Error;
use url::Url;

pub const URL_VAR: &str = "SUPABASE_URL";
pub const ANON_KEY_VAR: &str = "SUPABASE_ANON_KEY";
pub const REDIRECT_VAR: &str = "MAEWCHAT_REDIRECT_URL";
#[cfg(feature = "admin")]
pub const SERVICE_ROLE_KEY_VAR: &str = "SUPABASE_SERVICE_ROLE_KEY";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Missing {0}")]
    Missing(&'static str),

    #[error("Invalid {var}: {source}")]
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    lookup(var)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(var))
}

fn project_url(var: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim()).map_err(|source| ConfigError::InvalidUrl { var, source })
}

/// Browser-safe settings: project URL and anonymous key.
#[derive(Debug, Clone)]
pub struct PublicConfig {
    pub url: Url,
    pub anon_key: String,
    /// Where the magic link sends the user after sign-in.
    pub redirect_to: Option<String>,
}

impl PublicConfig {
    pub fn new(url: &str, anon_key: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: project_url(URL_VAR, url)?,
            anon_key: anon_key.into(),
            redirect_to: None,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = required(&lookup, URL_VAR)?;
        let anon_key = required(&lookup, ANON_KEY_VAR)?;
        let mut config = Self::new(&url, anon_key)?;
        config.redirect_to = lookup(REDIRECT_VAR).filter(|v| !v.trim().is_empty());
        Ok(config)
    }
}

/// Server-only settings. Never construct this in code that ships to a user's
/// machine.
#[cfg(feature = "admin")]
#[derive(Clone)]
pub struct AdminConfig {
    pub url: Url,
    pub service_role_key: String,
}

#[cfg(feature = "admin")]
impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("url", &self.url.as_str())
            .field("service_role_key", &"<redacted>")
            .finish()
    }
}

#[cfg(feature = "admin")]
impl AdminConfig {
    pub fn new(url: &str, service_role_key: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: project_url(URL_VAR, url)?,
            service_role_key: service_role_key.into(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// The key is checked before the URL so a deployment missing both is told
    /// about the secret first.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let key = required(&lookup, SERVICE_ROLE_KEY_VAR)?;
        let url = required(&lookup, URL_VAR)?;
        Self::new(&url, key)
    }
}

/// `<project>/<path>`, keeping any path prefix the project URL carries.
pub(crate) fn endpoint(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(None);
    url.set_fragment(None);
    url
}
