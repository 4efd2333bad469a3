//! Numeric identifiers for users, chats and messages.
//!
//! These mirror the `BIGSERIAL` primary keys owned by the persistence
//! collaborator. Each is a distinct newtype so a chat id can never be passed
//! where a user id is expected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error returned when a string is not an unsigned decimal identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {0:?}")]
pub struct ParseIdError(String);

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw database identifier.
            #[must_use]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Returns the raw database identifier.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseIdError(s.to_string()));
                }
                s.parse::<i64>()
                    .map(Self)
                    .map_err(|_| ParseIdError(s.to_string()))
            }
        }
    };
}

numeric_id!(
    /// Identifier of a logical user; all of a user's connections share it.
    UserId
);

numeric_id!(
    /// Identifier of a two-party chat.
    ChatId
);

numeric_id!(
    /// Identifier of a single chat message.
    MessageId
);

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal() {
        assert_eq!("42".parse::<UserId>().ok(), Some(UserId::new(42)));
    }

    #[test]
    fn rejects_sign_and_garbage() {
        assert!("-1".parse::<UserId>().is_err());
        assert!("+1".parse::<UserId>().is_err());
        assert!("abc".parse::<UserId>().is_err());
        assert!("".parse::<UserId>().is_err());
    }

    #[test]
    fn rejects_values_beyond_i64() {
        assert!("18446744073709551615".parse::<UserId>().is_err());
    }

    #[test]
    fn serializes_transparently() {
        let json = serde_json::to_string(&ChatId::new(7)).ok();
        assert_eq!(json.as_deref(), Some("7"));
    }
}
