//! Device wire protocol messages.
//!
//! Every frame carries one JSON object whose `"T"` field selects the
//! message type. Field names are fixed by the protocol and preserved
//! through serde renames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single notification as it travels on the wire and sits in the store.
///
/// Broadcast notifications carry only a payload; unicast notifications also
/// carry the server-generated message id (the acknowledgement key) and the
/// destination application id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "AppId", default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(rename = "MsgId", default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(rename = "Payload")]
    pub payload: Value,
}

impl Notification {
    pub fn broadcast(payload: Value) -> Self {
        Self {
            app_id: None,
            msg_id: None,
            payload,
        }
    }

    pub fn unicast(app_id: impl Into<String>, msg_id: impl Into<String>, payload: Value) -> Self {
        Self {
            app_id: Some(app_id.into()),
            msg_id: Some(msg_id.into()),
            payload,
        }
    }
}

/// Timer parameters handed to the device in CONNACK.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParams {
    pub ping_interval_ms: u64,
    pub exchange_timeout_ms: u64,
}

/// Messages sent by the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "T")]
pub enum ClientMessage {
    #[serde(rename = "connect")]
    Connect {
        #[serde(rename = "DeviceId")]
        device_id: String,
        #[serde(rename = "Levels", default)]
        levels: BTreeMap<String, i64>,
        #[serde(rename = "Info", default)]
        info: BTreeMap<String, Value>,
        #[serde(rename = "Cookie", default, skip_serializing_if = "Option::is_none")]
        cookie: Option<String>,
    },
    #[serde(rename = "ack")]
    Ack {
        #[serde(rename = "AckedMsgIds", default, skip_serializing_if = "Vec::is_empty")]
        acked_msg_ids: Vec<String>,
    },
    #[serde(rename = "pong")]
    Pong,
}

/// Messages sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "T")]
pub enum ServerMessage {
    #[serde(rename = "connack")]
    ConnAck {
        #[serde(rename = "Params")]
        params: ConnParams,
    },
    #[serde(rename = "connbroadcast")]
    ConnBroadcast {
        #[serde(rename = "ChanId")]
        chan_id: String,
        #[serde(rename = "TopLevel")]
        top_level: i64,
        #[serde(rename = "Payloads")]
        payloads: Vec<Value>,
    },
    #[serde(rename = "broadcast")]
    Broadcast {
        #[serde(rename = "ChanId")]
        chan_id: String,
        #[serde(rename = "TopLevel")]
        top_level: i64,
        #[serde(rename = "Payloads")]
        payloads: Vec<Value>,
    },
    #[serde(rename = "notifications")]
    Notifications {
        #[serde(rename = "Notifications")]
        notifications: Vec<Notification>,
    },
    #[serde(rename = "ping")]
    Ping,
}
