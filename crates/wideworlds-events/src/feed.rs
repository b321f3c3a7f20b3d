use std::collections::VecDeque;
use tracing::debug;

/// Symbolic command error codes surfaced on the feed.
pub mod codes {
    pub const ERR_INVALID_COMMAND: &str = "ERR_INVALID_COMMAND";
    pub const ERR_INVALID_VALUE: &str = "ERR_INVALID_VALUE";
    pub const ERR_INVALID_VALUES: &str = "ERR_INVALID_VALUES";
    pub const ERR_NEGATIVE_YAW: &str = "ERR_NEGATIVE_YAW";
    pub const ERR_TOO_FEW_ARGUMENTS: &str = "ERR_TOO_FEW_ARGUMENTS";
}

/// Default retained message count before the oldest are dropped.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    Info,
    Warning,
    Error,
}

/// One message shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedMessage {
    pub kind: FeedKind,
    pub text: String,
    /// Symbolic code for command errors, when there is one.
    pub code: Option<&'static str>,
}

/// The user feed: a bounded message buffer the UI layer drains each
/// frame. Posting never fails and never blocks.
#[derive(Debug)]
pub struct UserFeed {
    messages: VecDeque<FeedMessage>,
    capacity: usize,
}

impl UserFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity,
        }
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.post(FeedMessage {
            kind: FeedKind::Info,
            text: text.into(),
            code: None,
        });
    }

    pub fn warning(&mut self, text: impl Into<String>) {
        self.post(FeedMessage {
            kind: FeedKind::Warning,
            text: text.into(),
            code: None,
        });
    }

    /// Post a symbolic command error.
    pub fn error(&mut self, code: &'static str) {
        self.post(FeedMessage {
            kind: FeedKind::Error,
            text: code.to_string(),
            code: Some(code),
        });
    }

    pub fn post(&mut self, message: FeedMessage) {
        debug!(kind = ?message.kind, text = %message.text, "feed message");
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn drain(&mut self) -> Vec<FeedMessage> {
        self.messages.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeedMessage> {
        self.messages.iter()
    }
}

impl Default for UserFeed {
    fn default() -> Self {
        Self::new()
    }
}
