//! Per-session protocol exchanges.
//!
//! An exchange is one server-initiated turn of the device conversation:
//! prepare an outbound frame from store + session state, wait for the
//! device's acknowledgement, apply its effect. The session loop drives the
//! wire; everything here is pure against the store and the session state,
//! which keeps the delivery rules unit-testable without sockets.

use serde_json::Value;

use crate::protocol::{Notification, ServerMessage};
use crate::store::{ChannelId, PendingStore, StoreResult};

use super::Session;

/// One queued protocol turn for a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exchange {
    /// Initial system-channel catch-up, seeded by the broker at registration.
    ConnBroadcast,
    /// Broadcast wake-up for a channel with new appends.
    Broadcast(ChannelId),
    /// Unicast wake-up for the session's mailbox channel.
    Unicast(ChannelId),
    /// Keepalive probe after a silent ping interval.
    Ping,
}

/// A prepared exchange: the frame to write and the effect of its ack.
#[derive(Clone, Debug, PartialEq)]
pub struct Prepared {
    pub message: ServerMessage,
    pub on_ack: AckAction,
}

/// What to do with the device's answer to an outbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckAction {
    /// ACK advances the session's known level for the channel.
    SetLevel { chan: ChannelId, level: i64 },
    /// ACK carries acknowledged msg ids to drop from the mailbox.
    DropAcked { chan: ChannelId },
    /// A PONG is expected and has no further effect.
    ExpectPong,
}

impl Exchange {
    /// Builds the outbound frame for this exchange, or `None` when there is
    /// nothing to do (the wake-up was a duplicate and the session already
    /// holds everything the store has).
    pub fn prepare(&self, sess: &Session, store: &dyn PendingStore) -> StoreResult<Option<Prepared>> {
        match self {
            Exchange::ConnBroadcast => prepare_broadcast(sess, store, &ChannelId::system(), true),
            Exchange::Broadcast(chan) => prepare_broadcast(sess, store, chan, false),
            Exchange::Unicast(chan) => prepare_unicast(store, chan),
            Exchange::Ping => Ok(Some(Prepared {
                message: ServerMessage::Ping,
                on_ack: AckAction::ExpectPong,
            })),
        }
    }
}

/// The initial connbroadcast always goes out, even with an empty tail: it
/// tells the device the channel's current top level. Later broadcast
/// wake-ups that filter down to nothing are skipped entirely.
fn prepare_broadcast(
    sess: &Session,
    store: &dyn PendingStore,
    chan: &ChannelId,
    initial: bool,
) -> StoreResult<Option<Prepared>> {
    let (top_level, notifs) = store.channel_snapshot(chan)?;
    let client_level = sess.levels.get(chan).copied().unwrap_or(0);
    let tail = filter_by_level(client_level, top_level, &notifs);
    // Devices that did not announce an image channel get the raw system
    // feed; a subscribed tag narrows it to matching payloads.
    let tag = sess.system_tag();
    let payloads = if chan.is_system() && tag.is_empty() {
        tail.iter().map(|n| n.payload.clone()).collect()
    } else {
        channel_filter(&tag, chan, tail)
    };

    if payloads.is_empty() && !initial {
        return Ok(None);
    }

    let chan_id = chan.as_wire().to_string();
    let message = if initial {
        ServerMessage::ConnBroadcast {
            chan_id,
            top_level,
            payloads,
        }
    } else {
        ServerMessage::Broadcast {
            chan_id,
            top_level,
            payloads,
        }
    };
    Ok(Some(Prepared {
        message,
        on_ack: AckAction::SetLevel {
            chan: chan.clone(),
            level: top_level,
        },
    }))
}

fn prepare_unicast(store: &dyn PendingStore, chan: &ChannelId) -> StoreResult<Option<Prepared>> {
    let (_, notifications) = store.channel_snapshot(chan)?;
    if notifications.is_empty() {
        return Ok(None);
    }
    Ok(Some(Prepared {
        message: ServerMessage::Notifications { notifications },
        on_ack: AckAction::DropAcked { chan: chan.clone() },
    }))
}

/// Picks the delivery tail for a device that last acknowledged
/// `client_level` on a channel whose log is at `top_level`.
///
/// A device ahead of the store (the store was reset under it) gets the
/// single most recent notification; a device further behind than the
/// unexpired window gets the whole window.
pub fn filter_by_level(client_level: i64, top_level: i64, notifs: &[Notification]) -> &[Notification] {
    if notifs.is_empty() {
        return notifs;
    }
    let mut delta = top_level - client_level;
    if delta < 0 {
        // too ahead, pick only last
        delta = 1;
    }
    let take = usize::try_from(delta).unwrap_or(0).min(notifs.len());
    &notifs[notifs.len() - take..]
}

/// On the system channel only payloads carrying the session's subscribed
/// tag as a top-level key are delivered; other channels pass through.
pub fn channel_filter(tag: &str, chan: &ChannelId, notifs: &[Notification]) -> Vec<Value> {
    if !notifs.is_empty() && chan.is_system() {
        return notifs
            .iter()
            .filter(|n| {
                n.payload
                    .as_object()
                    .is_some_and(|obj| obj.contains_key(tag))
            })
            .map(|n| n.payload.clone())
            .collect();
    }
    notifs.iter().map(|n| n.payload.clone()).collect()
}
