//! Shared data types for maewchat.
//!
//! `models` mirrors the rows and identities issued by the hosted platform,
//! `api` holds the bodies of the server's own HTTP route and `events` the
//! auth and realtime push payloads.

pub mod api;
pub mod events;
pub mod models;
