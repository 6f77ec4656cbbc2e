use serde::{Deserialize, Serialize};

// -- Signed avatar URL --

#[derive(Debug, Deserialize)]
pub struct SignedUrlQuery {
    pub path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlResponse {
    pub signed_url: String,
}

/// Body of every non-2xx response from the server.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
