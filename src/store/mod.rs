//! Pending-notification store contract.
//!
//! Channels are append-only logs of notifications indexed by a 1-based,
//! monotonically increasing level. The system channel is the single
//! broadcast log; every other channel is the unicast mailbox of one
//! (user, device) pair. Levels are never reused: expired entries vanish
//! from snapshots but the top level only moves forward.

mod memory;

use std::fmt;

use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::protocol::Notification;

pub use memory::InMemoryStore;

/// Wire name of the system (broadcast-to-all) channel.
const SYSTEM_WIRE_NAME: &str = "0";
/// Human name under which the system channel is addressed by the HTTP API.
const SYSTEM_HUMAN_NAME: &str = "system";

/// Internal identifier of a notification channel.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    /// The broadcast-to-all channel.
    pub fn system() -> Self {
        Self(SYSTEM_WIRE_NAME.to_string())
    }

    /// The unicast mailbox of one (user, device) pair.
    pub fn unicast(user_id: &str, device_id: &str) -> Self {
        Self(format!("u:{user_id}:{device_id}"))
    }

    /// Parses a channel id as it appears on the wire (levels map keys).
    pub fn from_wire(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_WIRE_NAME
    }

    /// The (user, device) pair of a unicast channel, if this is one.
    pub fn unicast_parts(&self) -> Option<(&str, &str)> {
        let rest = self.0.strip_prefix("u:")?;
        rest.split_once(':')
    }

    pub fn as_wire(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown channel")]
    UnknownChannel,
    #[error("unknown token")]
    UnknownToken,
    #[error("unauthorized")]
    Unauthorized,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("internal store error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable (for the lifetime of the process, at least) pending-notification
/// storage plus token resolution.
///
/// Implementations must be safe for concurrent readers and writers, and an
/// append must be visible to every snapshot taken after it returns: a caller
/// that appends and then signals the broker is guaranteed that woken
/// sessions observe the new top level.
pub trait PendingStore: Send + Sync {
    /// Resolves a channel's human name to its internal id. Only `"system"`
    /// is addressable by name.
    fn get_internal_channel_id(&self, name: &str) -> StoreResult<ChannelId>;

    /// Resolves a registration token, or a bare (user, device) pair when the
    /// token is empty, to the corresponding unicast channel. A token bound
    /// to a different application or device fails with `Unauthorized`.
    fn get_channel_id_from_token(
        &self,
        token: &str,
        app_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> StoreResult<ChannelId>;

    /// Issues the token binding (app, device) for unicast delivery.
    /// Deterministic: re-registration returns the same token.
    fn register(&self, device_id: &str, app_id: &str) -> StoreResult<String>;

    /// Appends a broadcast notification, assigning the channel's next level.
    fn append_to_channel(
        &self,
        chan: &ChannelId,
        payload: Value,
        expire_on: OffsetDateTime,
    ) -> StoreResult<()>;

    /// Appends a unicast notification. Idempotent on `(chan, msg_id)`: a
    /// repeat append with the same message id leaves the log unchanged.
    fn append_to_unicast_channel(
        &self,
        chan: &ChannelId,
        app_id: &str,
        payload: Value,
        msg_id: &str,
        expire_on: OffsetDateTime,
    ) -> StoreResult<()>;

    /// The channel's current top level and its unexpired notifications in
    /// ascending level order.
    fn channel_snapshot(&self, chan: &ChannelId) -> StoreResult<(i64, Vec<Notification>)>;

    /// Every unicast channel addressed to the device that currently holds
    /// unexpired notifications, regardless of which user id keys it. This
    /// is what registration-time catch-up replays, so mail stored while the
    /// device was offline is never stranded.
    fn pending_channels_for_device(&self, device_id: &str) -> StoreResult<Vec<ChannelId>>;

    /// Removes acknowledged unicast notifications. Unknown ids are ignored.
    fn drop_by_msg_id(&self, chan: &ChannelId, msg_ids: &[String]) -> StoreResult<()>;

    /// Releases backing resources. The in-memory store has none.
    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_channel_identity() {
        let chan = ChannelId::system();
        assert!(chan.is_system());
        assert_eq!(chan.as_wire(), "0");
        assert_eq!(chan.unicast_parts(), None);
    }

    #[test]
    fn unicast_parts_roundtrip() {
        let chan = ChannelId::unicast("user-1", "dev-1");
        assert!(!chan.is_system());
        assert_eq!(chan.unicast_parts(), Some(("user-1", "dev-1")));
    }

    #[test]
    fn from_wire_rejects_empty() {
        assert_eq!(ChannelId::from_wire(""), None);
        assert_eq!(ChannelId::from_wire("0"), Some(ChannelId::system()));
    }
}
