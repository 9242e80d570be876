//! Identity types shared by every netbus layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one remote peer (a reliable + unreliable socket pair).
///
/// This is a newtype over `i32` so a peer id can't be mixed up with a
/// message id or a port. Ids are handed out by a counter and never reused;
/// [`PeerId::INVALID`] is what the router returns for a refused request.
///
/// `#[serde(transparent)]` keeps the JSON form a plain number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub i32);

impl PeerId {
    /// The "no peer" id. Returned for refused or duplicate connects.
    pub const INVALID: PeerId = PeerId(-1);

    /// `true` unless this is [`PeerId::INVALID`] (or any other negative id).
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "peer-{}", self.0)
        } else {
            f.write_str("peer-invalid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_default_is_invalid() {
        assert_eq!(PeerId::default(), PeerId::INVALID);
        assert!(!PeerId::INVALID.is_valid());
        assert!(PeerId(0).is_valid());
    }

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId(3).to_string(), "peer-3");
        assert_eq!(PeerId::INVALID.to_string(), "peer-invalid");
    }

    #[test]
    fn test_peer_id_serializes_as_plain_number() {
        let json = serde_json::to_string(&PeerId(12)).unwrap();
        assert_eq!(json, "12");
    }
}
