//! Frame routing protocol and server-pushed event envelope.
//!
//! Inbound frames use a minimal text protocol, `"<recipientUserID>:<body>"`,
//! split on the first `:`. Anything else is a
//! [`GatewayError::MalformedFrame`] which the caller logs and drops.
//!
//! Outbound chat notifications are JSON [`LiveEvent`]s.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Message, MessageId, UserId};
use crate::error::GatewayError;

/// Separator between recipient and body.
pub const DELIMITER: char = ':';

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedFrame<'a> {
    /// User the body is addressed to.
    pub recipient: UserId,
    /// Everything after the first delimiter, untouched.
    pub body: &'a str,
}

/// Splits a raw frame into recipient and body.
///
/// # Errors
///
/// Returns [`GatewayError::MalformedFrame`] when the delimiter is missing or
/// the recipient is not an unsigned decimal id.
pub fn route_frame(raw: &str) -> Result<RoutedFrame<'_>, GatewayError> {
    let Some((recipient, body)) = raw.split_once(DELIMITER) else {
        return Err(GatewayError::MalformedFrame(format!(
            "missing '{DELIMITER}' delimiter"
        )));
    };
    let recipient = recipient.parse::<UserId>().map_err(|_| {
        GatewayError::MalformedFrame(format!("invalid recipient user id {recipient:?}"))
    })?;
    Ok(RoutedFrame { recipient, body })
}

/// Routes a binary frame whose payload is UTF-8 text.
///
/// # Errors
///
/// Returns [`GatewayError::MalformedFrame`] for invalid UTF-8 and for
/// everything [`route_frame`] rejects.
pub fn route_binary(raw: &[u8]) -> Result<RoutedFrame<'_>, GatewayError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| GatewayError::MalformedFrame(format!("binary frame is not UTF-8: {e}")))?;
    route_frame(text)
}

/// Server-pushed notification about a chat message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    /// A new message was stored for the receiving user.
    NewMessage {
        /// The stored message.
        message: Message,
        /// Push timestamp.
        timestamp: DateTime<Utc>,
    },
    /// A message was edited by its sender.
    MessageEdited {
        /// The message after the edit.
        message: Message,
        /// Push timestamp.
        timestamp: DateTime<Utc>,
    },
    /// A message was deleted by its sender.
    MessageDeleted {
        /// Deleted message id.
        message_id: MessageId,
        /// Push timestamp.
        timestamp: DateTime<Utc>,
    },
}

impl LiveEvent {
    /// Serializes the event as one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if serialization fails.
    pub fn to_frame(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self).map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn routes_recipient_and_body() {
        let Ok(frame) = route_frame("42:hello") else {
            panic!("expected routed frame");
        };
        assert_eq!(frame.recipient, UserId::new(42));
        assert_eq!(frame.body, "hello");
    }

    #[test]
    fn splits_on_first_delimiter_only() {
        let Ok(frame) = route_frame("7:see you at 10:30") else {
            panic!("expected routed frame");
        };
        assert_eq!(frame.recipient, UserId::new(7));
        assert_eq!(frame.body, "see you at 10:30");
    }

    #[test]
    fn empty_body_is_allowed() {
        let Ok(frame) = route_frame("3:") else {
            panic!("expected routed frame");
        };
        assert_eq!(frame.body, "");
    }

    #[test]
    fn missing_delimiter_is_malformed() {
        assert!(matches!(
            route_frame("hello"),
            Err(GatewayError::MalformedFrame(_))
        ));
    }

    #[test]
    fn non_numeric_recipient_is_malformed() {
        assert!(matches!(
            route_frame("bob:hello"),
            Err(GatewayError::MalformedFrame(_))
        ));
        assert!(matches!(
            route_frame("-4:hello"),
            Err(GatewayError::MalformedFrame(_))
        ));
        assert!(matches!(
            route_frame(":hello"),
            Err(GatewayError::MalformedFrame(_))
        ));
    }

    #[test]
    fn binary_frames_route_when_utf8() {
        let Ok(frame) = route_binary(b"9:bin") else {
            panic!("expected routed frame");
        };
        assert_eq!(frame.recipient, UserId::new(9));
        assert!(route_binary(&[0xff, 0x3a, 0x41]).is_err());
    }

    #[test]
    fn live_event_is_tagged() {
        let event = LiveEvent::MessageDeleted {
            message_id: MessageId::new(5),
            timestamp: Utc::now(),
        };
        let Ok(json) = event.to_frame() else {
            panic!("serialization failed");
        };
        assert!(json.contains("\"type\":\"message_deleted\""));
        assert!(json.contains("\"message_id\":5"));
    }
}
