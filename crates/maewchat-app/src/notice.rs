use tokio::sync::mpsc;

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A message the user has to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

/// Sending half of the notice queue the front-end drains.
#[derive(Clone)]
pub struct Notices {
    tx: mpsc::UnboundedSender<Notice>,
}

impl Notices {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, level: NoticeLevel, text: String) {
        // The front-end may already be gone during shutdown.
        let _ = self.tx.send(Notice { level, text });
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(NoticeLevel::Info, text.into());
    }

    pub fn error(&self, text: impl Into<String>) {
        self.push(NoticeLevel::Error, text.into());
    }

    /// Surface the error of `result`, if any, and hand the result back.
    pub fn report<T>(&self, result: Result<T, ChatError>) -> Result<T, ChatError> {
        if let Err(e) = &result {
            self.error(e.to_string());
        }
        result
    }
}
