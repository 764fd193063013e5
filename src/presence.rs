//! Presence and roster lookups used by the pub/sub access gates and
//! delivery filters.
//!
//! The roster store and presence session table live in the C2S layer;
//! this trait is the seam the pub/sub core queries through.

use jid::BareJid;

/// Presence show state of an available resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShowState {
    /// Available with no `<show/>` child
    Online,
    /// Away
    Away,
    /// Free for chat
    Chat,
    /// Do not disturb
    Dnd,
    /// Extended away
    Xa,
}

impl ShowState {
    /// Parse a `pubsub#show-values` token.
    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "away" => Some(Self::Away),
            "chat" => Some(Self::Chat),
            "dnd" => Some(Self::Dnd),
            "xa" => Some(Self::Xa),
            _ => None,
        }
    }

    /// Token form used in subscription option forms.
    pub fn as_token(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Chat => "chat",
            Self::Dnd => "dnd",
            Self::Xa => "xa",
        }
    }
}

impl std::fmt::Display for ShowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_token())
    }
}

/// Roster and presence queries the pub/sub core depends on.
pub trait PresenceDirectory: Send + Sync + 'static {
    /// Whether `contact` holds a presence subscription from `owner`
    /// (roster subscription state `from` or `both`).
    fn has_presence_subscription(&self, owner: &BareJid, contact: &BareJid) -> bool;

    /// Roster groups `owner` has placed `contact` in.
    fn roster_groups(&self, owner: &BareJid, contact: &BareJid) -> Vec<String>;

    /// Available resources of `jid` with their current show state.
    /// Empty when the entity is offline.
    fn available_resources(&self, jid: &BareJid) -> Vec<(String, ShowState)>;
}
