//! Node and group identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a node.
///
/// Ordering is the lexicographic order of the underlying string; every
/// deterministic tie-break in the system uses it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh identifier for a node starting for the first time.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

const LOBBY: &str = "all";
const DIRECT_PREFIX: &str = "dm:";

/// Identifier of a chat group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh identifier for a group created on this node.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// The group every node joins at startup.
    pub fn lobby() -> Self {
        Self(LOBBY.to_string())
    }

    /// The private two-party group of `a` and `b`.
    ///
    /// Both sides derive the same id without coordinating.
    pub fn direct(a: &PeerId, b: &PeerId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}{}:{}", DIRECT_PREFIX, lo, hi))
    }

    pub fn is_lobby(&self) -> bool {
        self.0 == LOBBY
    }

    pub fn is_direct(&self) -> bool {
        self.0.starts_with(DIRECT_PREFIX)
    }

    /// The two participants of a direct-message group.
    ///
    /// Peer ids may not contain `:` for this to be unambiguous; generated
    /// ULIDs never do.
    pub fn direct_participants(&self) -> Option<(PeerId, PeerId)> {
        let rest = self.0.strip_prefix(DIRECT_PREFIX)?;
        let (a, b) = rest.split_once(':')?;
        if a.is_empty() || b.is_empty() {
            return None;
        }
        Some((PeerId::new(a), PeerId::new(b)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_group_is_symmetric() {
        let alice = PeerId::new("alice");
        let bob = PeerId::new("bob");

        assert_eq!(GroupId::direct(&alice, &bob), GroupId::direct(&bob, &alice));
        assert_eq!(GroupId::direct(&alice, &bob).as_str(), "dm:alice:bob");
    }

    #[test]
    fn test_direct_participants() {
        let group = GroupId::direct(&PeerId::new("z"), &PeerId::new("a"));
        assert!(group.is_direct());
        assert_eq!(
            group.direct_participants(),
            Some((PeerId::new("a"), PeerId::new("z")))
        );

        assert_eq!(GroupId::lobby().direct_participants(), None);
        assert_eq!(GroupId::new("dm:only").direct_participants(), None);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(PeerId::generate(), PeerId::generate());
        assert_ne!(GroupId::generate(), GroupId::generate());
        assert!(!GroupId::generate().is_lobby());
    }

    #[test]
    fn test_peer_order_is_lexicographic() {
        assert!(PeerId::new("ann") < PeerId::new("bob"));
        assert!(PeerId::new("B") < PeerId::new("a"));
    }
}
