//! Display-name assignment for new sessions.
//!
//! The dispatcher owns one assigner and asks it for a name on every join.

use crate::relay::registry::ConnectionId;
use crate::relay::transport::PeerAddr;
use serde::Deserialize;

/// Maximum length of a display name, in characters.
pub const MAX_NAME_LENGTH: usize = 32;

/// Chooses the display name for a newly joined session.
pub trait AssignIdentity: Send {
    fn assign(&mut self, id: ConnectionId, peer: &PeerAddr) -> String;
}

/// Which built-in strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityKind {
    /// Everyone gets the same name.
    #[default]
    Fixed,
    /// The remote socket address.
    PeerAddress,
    /// `<name>-1`, `<name>-2`, ...
    Sequential,
}

impl IdentityKind {
    pub fn build(self, name: &str) -> Box<dyn AssignIdentity> {
        match self {
            IdentityKind::Fixed => Box::new(FixedIdentity(name.to_string())),
            IdentityKind::PeerAddress => Box::new(PeerIdentity {
                fallback: name.to_string(),
            }),
            IdentityKind::Sequential => Box::new(SequentialIdentity::new(name)),
        }
    }
}

pub struct FixedIdentity(pub String);

impl AssignIdentity for FixedIdentity {
    fn assign(&mut self, _id: ConnectionId, _peer: &PeerAddr) -> String {
        self.0.clone()
    }
}

pub struct PeerIdentity {
    fallback: String,
}

impl AssignIdentity for PeerIdentity {
    fn assign(&mut self, id: ConnectionId, peer: &PeerAddr) -> String {
        match peer {
            PeerAddr::Tcp(addr) => addr.to_string(),
            PeerAddr::Unix | PeerAddr::Unknown => format!("{}-{}", self.fallback, id.serial()),
        }
    }
}

pub struct SequentialIdentity {
    prefix: String,
    next: u64,
}

impl SequentialIdentity {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: 1,
        }
    }
}

impl AssignIdentity for SequentialIdentity {
    fn assign(&mut self, _id: ConnectionId, _peer: &PeerAddr) -> String {
        let name = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        name
    }
}

/// Check a requested display name. Returns the trimmed name.
pub fn validate_name(name: &str) -> Result<&str, String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("name must not be empty".into());
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(format!("name too long (max {MAX_NAME_LENGTH} chars)"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err("name must not contain whitespace".into());
    }
    if name.eq_ignore_ascii_case(crate::relay::message::SYSTEM_IDENTITY) {
        return Err("name is reserved".into());
    }
    Ok(name)
}
