//! Messages flowing through the dispatcher.

use crate::relay::registry::ConnectionId;
use bytes::Bytes;

/// Identity shown for text the relay itself originates.
pub const SYSTEM_IDENTITY: &str = "system";

/// Who a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Session(ConnectionId),
    System,
}

/// One line of text plus its origin. Consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub origin: Origin,
    pub text: String,
}

impl Message {
    pub fn from_session(id: ConnectionId, text: String) -> Self {
        Self {
            origin: Origin::Session(id),
            text,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            origin: Origin::System,
            text: text.into(),
        }
    }

    pub fn sender(&self) -> Option<ConnectionId> {
        match self.origin {
            Origin::Session(id) => Some(id),
            Origin::System => None,
        }
    }

    /// Render as a relay line: `<identity> says: <text>`.
    ///
    /// `identity` is the sender's current display name; system messages
    /// ignore it.
    pub fn relay_line(&self, identity: &str) -> Bytes {
        let identity = match self.origin {
            Origin::Session(_) => identity,
            Origin::System => SYSTEM_IDENTITY,
        };
        Bytes::from(format!("{identity} says: {}", self.text))
    }
}
