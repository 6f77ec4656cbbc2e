//! Privileged storage access bound to the service-role key.

use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::client::http_client;
use crate::config::{AdminConfig, endpoint};
use crate::error::{ClientError, check};

/// Server-side client. Holds no session: every call authenticates with the
/// service-role key directly.
pub struct AdminClient {
    http: reqwest::Client,
    storage: Url,
    service_role_key: String,
}

#[derive(Debug, Deserialize)]
struct SignedUrlBody {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

/// Strip leading/trailing slashes and collapse runs of slashes.
pub fn normalize_object_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl AdminClient {
    pub fn new(config: AdminConfig) -> Result<Self, ClientError> {
        Ok(Self {
            http: http_client(&config.service_role_key)?,
            storage: endpoint(&config.url, "storage/v1"),
            service_role_key: config.service_role_key,
        })
    }

    /// Mint a download URL for a private object, valid for `expires_in`
    /// seconds.
    pub async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        expires_in: u64,
    ) -> Result<String, ClientError> {
        let object = normalize_object_path(path);
        if object.is_empty() {
            return Err(ClientError::Invalid("Object path is empty".into()));
        }

        let mut url = endpoint(&self.storage, "object/sign");
        url.path_segments_mut()
            .map_err(|_| ClientError::Invalid("Storage URL cannot carry a path".into()))?
            .push(bucket)
            .extend(object.split('/'));

        debug!("Signing {}/{} for {}s", bucket, object, expires_in);
        let body: SignedUrlBody = check(
            self.http
                .post(url)
                .bearer_auth(&self.service_role_key)
                .json(&json!({ "expiresIn": expires_in }))
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;

        Ok(format!(
            "{}{}",
            self.storage.as_str().trim_end_matches('/'),
            body.signed_url
        ))
    }
}
