//! View controllers for the chat front-end.
//!
//! Each controller owns its slice of view state, publishes it on a
//! `tokio::sync::watch` channel and reports failures as [`notice::Notice`]s
//! instead of returning them to a user.

pub mod conversations;
pub mod error;
pub mod generation;
pub mod notice;
pub mod session;
pub mod terminal;
pub mod thread;

#[cfg(test)]
mod testing;

pub use conversations::ConversationList;
pub use error::ChatError;
pub use notice::{Notice, NoticeLevel, Notices};
pub use session::SessionController;
pub use thread::{MessageThread, ThreadView};
