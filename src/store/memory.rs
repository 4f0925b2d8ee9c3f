//! In-memory pending store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use time::OffsetDateTime;

use crate::protocol::Notification;

use super::{ChannelId, PendingStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct ChannelLog {
    top_level: i64,
    entries: Vec<StoredEntry>,
}

#[derive(Debug)]
struct StoredEntry {
    notification: Notification,
    expire_on: OffsetDateTime,
}

/// Process-lifetime `PendingStore`. One lock guards all channels; every
/// operation is a short critical section, so writers (the HTTP API) and the
/// many session readers contend only briefly.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    channels: Mutex<BTreeMap<ChannelId, ChannelLog>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_log<T>(&self, chan: &ChannelId, f: impl FnOnce(&mut ChannelLog) -> T) -> T {
        let mut channels = self.channels.lock().expect("store lock poisoned");
        let log = channels.entry(chan.clone()).or_default();
        log.gc(OffsetDateTime::now_utc());
        f(log)
    }
}

impl ChannelLog {
    /// Drops expired entries. Their levels stay reserved: `top_level` never
    /// moves backwards.
    fn gc(&mut self, now: OffsetDateTime) {
        self.entries.retain(|entry| entry.expire_on > now);
    }
}

impl PendingStore for InMemoryStore {
    fn get_internal_channel_id(&self, name: &str) -> StoreResult<ChannelId> {
        if name == super::SYSTEM_HUMAN_NAME {
            return Ok(ChannelId::system());
        }
        Err(StoreError::UnknownChannel)
    }

    fn get_channel_id_from_token(
        &self,
        token: &str,
        app_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> StoreResult<ChannelId> {
        if !token.is_empty() {
            let decoded = BASE64
                .decode(token)
                .map_err(|_| StoreError::UnknownToken)?;
            let decoded = String::from_utf8(decoded).map_err(|_| StoreError::UnknownToken)?;
            let Some((tok_app, tok_device)) = decoded.split_once("::") else {
                return Err(StoreError::UnknownToken);
            };
            if tok_app != app_id {
                return Err(StoreError::Unauthorized);
            }
            if !device_id.is_empty() && device_id != tok_device {
                return Err(StoreError::Unauthorized);
            }
            return Ok(ChannelId::unicast(tok_device, tok_device));
        }
        if user_id.is_empty() || device_id.is_empty() {
            return Err(StoreError::UnknownToken);
        }
        Ok(ChannelId::unicast(user_id, device_id))
    }

    fn register(&self, device_id: &str, app_id: &str) -> StoreResult<String> {
        Ok(BASE64.encode(format!("{app_id}::{device_id}")))
    }

    fn append_to_channel(
        &self,
        chan: &ChannelId,
        payload: Value,
        expire_on: OffsetDateTime,
    ) -> StoreResult<()> {
        self.with_log(chan, |log| {
            log.top_level += 1;
            log.entries.push(StoredEntry {
                notification: Notification::broadcast(payload),
                expire_on,
            });
        });
        Ok(())
    }

    fn append_to_unicast_channel(
        &self,
        chan: &ChannelId,
        app_id: &str,
        payload: Value,
        msg_id: &str,
        expire_on: OffsetDateTime,
    ) -> StoreResult<()> {
        self.with_log(chan, |log| {
            let duplicate = log
                .entries
                .iter()
                .any(|entry| entry.notification.msg_id.as_deref() == Some(msg_id));
            if duplicate {
                return;
            }
            log.top_level += 1;
            log.entries.push(StoredEntry {
                notification: Notification::unicast(app_id, msg_id, payload),
                expire_on,
            });
        });
        Ok(())
    }

    fn channel_snapshot(&self, chan: &ChannelId) -> StoreResult<(i64, Vec<Notification>)> {
        Ok(self.with_log(chan, |log| {
            let notifications = log
                .entries
                .iter()
                .map(|entry| entry.notification.clone())
                .collect();
            (log.top_level, notifications)
        }))
    }

    fn pending_channels_for_device(&self, device_id: &str) -> StoreResult<Vec<ChannelId>> {
        let now = OffsetDateTime::now_utc();
        let mut channels = self.channels.lock().expect("store lock poisoned");
        let mut pending = Vec::new();
        for (chan, log) in channels.iter_mut() {
            let Some((_, chan_device)) = chan.unicast_parts() else {
                continue;
            };
            if chan_device != device_id {
                continue;
            }
            log.gc(now);
            if !log.entries.is_empty() {
                pending.push(chan.clone());
            }
        }
        Ok(pending)
    }

    fn drop_by_msg_id(&self, chan: &ChannelId, msg_ids: &[String]) -> StoreResult<()> {
        self.with_log(chan, |log| {
            log.entries.retain(|entry| {
                entry
                    .notification
                    .msg_id
                    .as_ref()
                    .is_none_or(|id| !msg_ids.contains(id))
            });
        });
        Ok(())
    }
}
