//! Identifier types for ledger entities.
//!
//! All identifiers wrap a UUID. New identifiers use UUID v7 so that rows
//! created close together sort close together in indexes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a fresh, time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from the hyphenated textual form.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s.trim())?))
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(
    /// Authenticated caller identity. The engine trusts it as given.
    UserId
);

uuid_id!(
    /// Account identifier.
    ///
    /// The `Ord` implementation defines the global lock order: any code that
    /// locks several accounts in one transaction sorts by this order first.
    AccountId
);

uuid_id!(
    /// Identifier of a business transaction record (not a database transaction).
    TransactionId
);

uuid_id!(
    /// Identifier of a single ledger entry row.
    EntryId
);

uuid_id!(
    /// Identifier of an exchange quote.
    QuoteId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_display() {
        let id = AccountId::new();
        let parsed = AccountId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(QuoteId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_order_matches_textual_order() {
        let mut ids: Vec<AccountId> = (0..32).map(|_| AccountId::from_uuid(Uuid::new_v4())).collect();
        let mut texts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        ids.sort();
        texts.sort();
        let sorted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(sorted, texts);
    }
}
