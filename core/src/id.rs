//! Opaque identifier newtypes.
//!
//! Connections, sessions and rooms are all addressed by opaque string
//! identifiers. Generated identifiers are UUID v4, but the types accept
//! any caller-supplied string (room identifiers are usually chosen by
//! the application, e.g. `"lobby"`).

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id! {
    /// Identifier of a single transport connection.
    ConnectionId
}

opaque_id! {
    /// Identifier of a logical session, stable across reconnections.
    SessionId
}

opaque_id! {
    /// Identifier of a room.
    RoomId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(SessionId::generate()));
        }
    }

    #[test]
    fn display_matches_inner() {
        let id = RoomId::from("lobby");
        assert_eq!(id.to_string(), "lobby");
        assert_eq!(id.as_str(), "lobby");
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from("abc-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc-123\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
