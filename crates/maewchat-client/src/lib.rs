//! Clients for the hosted chat platform.
//!
//! [`PublicClient`] is the browser-safe entry point: auth, table queries and
//! realtime change feeds, all bound to the anonymous key plus whatever
//! session the user has established. The privileged storage client lives in
//! [`storage`] and only exists with the `admin` feature.

pub mod auth;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod realtime;
pub mod rest;

#[cfg(feature = "admin")]
pub mod storage;

pub use backend::{AuthBackend, ChatBackend};
pub use client::PublicClient;
pub use config::{ConfigError, PublicConfig};
pub use error::ClientError;
pub use realtime::Subscription;

#[cfg(feature = "admin")]
pub use config::AdminConfig;
#[cfg(feature = "admin")]
pub use storage::AdminClient;
