//! Per-connection session loop.
//!
//! One loop owns one device connection end to end: handshake, then a
//! strictly serial conversation where the next exchange comes from the
//! broker's queue, the ping deadline, or a termination signal. Exchanges
//! never overlap; no second frame goes out before the current one is
//! acknowledged or the session dies.

mod tracker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use thiserror::Error;

use crate::broker::{AckAction, BrokerHandle, Exchange, Session};
use crate::protocol::{ClientMessage, ConnParams, DeviceConn, FrameError, ProtoConn, ServerMessage};
use crate::store::{ChannelId, PendingStore, StoreError};

pub use tracker::Tracker;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(std::io::Error),
    #[error("exchange timed out")]
    Timeout,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("session superseded by a newer registration")]
    Superseded,
    #[error("broker shut down")]
    BrokerShutdown,
    #[error("pending store failed: {0}")]
    Store(#[from] StoreError),
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        if err.is_timeout() {
            return SessionError::Timeout;
        }
        match err {
            FrameError::Io(err) => SessionError::Io(err),
            FrameError::Malformed(err) => SessionError::Protocol(format!("malformed frame: {err}")),
            err @ FrameError::FrameTooLarge { .. } => SessionError::Protocol(err.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Silence bound before the server probes with PING. Must exceed
    /// `exchange_timeout`.
    pub ping_interval: Duration,
    /// Deadline on every wire read and write.
    pub exchange_timeout: Duration,
    /// Capacity of the broker→session exchange queue.
    pub queue_size: usize,
}

impl SessionConfig {
    fn conn_params(&self) -> ConnParams {
        ConnParams {
            ping_interval_ms: self.ping_interval.as_millis() as u64,
            exchange_timeout_ms: self.exchange_timeout.as_millis() as u64,
        }
    }
}

/// Runs one device connection to completion. Never panics outward; the
/// terminal cause is logged through the tracker.
pub fn run_session<C: DeviceConn>(
    conn: C,
    store: Arc<dyn PendingStore>,
    broker: BrokerHandle,
    config: SessionConfig,
) {
    let track = Tracker::new();
    track.start(conn.peer_addr().ok());

    let mut proto = ProtoConn::new(conn, config.exchange_timeout);
    let cause = drive(&mut proto, store.as_ref(), &broker, &config, &track);
    track.end(&cause);
}

fn drive<C: DeviceConn>(
    proto: &mut ProtoConn<C>,
    store: &dyn PendingStore,
    broker: &BrokerHandle,
    config: &SessionConfig,
    track: &Tracker,
) -> SessionError {
    let (mut session, handle) = match handshake(proto, config, track) {
        Ok(pair) => pair,
        Err(cause) => return cause,
    };

    broker.register(handle.clone());
    track.registered(&session.device_id);

    let stop = broker.stop_signal();
    let cause = exchange_loop(proto, store, &mut session, &stop, config);
    broker.unregister(handle);
    cause
}

fn handshake<C: DeviceConn>(
    proto: &mut ProtoConn<C>,
    config: &SessionConfig,
    track: &Tracker,
) -> Result<(Session, crate::broker::SessionHandle), SessionError> {
    let (device_id, wire_levels, info) = match proto.read_message::<ClientMessage>() {
        Ok(ClientMessage::Connect {
            device_id,
            levels,
            info,
            cookie: _,
        }) => (device_id, levels, info),
        Ok(_) => {
            return Err(SessionError::Protocol(
                "expected CONNECT as first frame".to_string(),
            ));
        }
        Err(err) => return Err(err.into()),
    };
    if device_id.is_empty() {
        return Err(SessionError::Protocol("connect without device id".to_string()));
    }

    let mut levels = BTreeMap::new();
    for (raw, level) in wire_levels {
        let Some(chan) = ChannelId::from_wire(&raw) else {
            return Err(SessionError::Protocol(format!(
                "invalid channel id in levels: {raw:?}"
            )));
        };
        levels.insert(chan, level);
    }

    proto.write_message(&ServerMessage::ConnAck {
        params: config.conn_params(),
    })?;

    let text = |key: &str| {
        info.get(key)
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string()
    };
    Ok(Session::new(
        track.session_id(),
        device_id,
        text("model"),
        text("imagechannel"),
        levels,
        config.queue_size,
    ))
}

fn exchange_loop<C: DeviceConn>(
    proto: &mut ProtoConn<C>,
    store: &dyn PendingStore,
    session: &mut Session,
    stop: &Receiver<()>,
    config: &SessionConfig,
) -> SessionError {
    loop {
        // Re-armed every turn: any completed exchange counts as liveness.
        let ping_deadline = crossbeam::channel::after(config.ping_interval);
        let exchange = crossbeam::select! {
            recv(session.exchange_rx) -> msg => match msg {
                Ok(exchange) => exchange,
                Err(_) => return SessionError::BrokerShutdown,
            },
            recv(session.kill_rx) -> msg => match msg {
                Ok(()) => return SessionError::Superseded,
                Err(_) => return SessionError::BrokerShutdown,
            },
            recv(stop) -> _ => return SessionError::BrokerShutdown,
            recv(ping_deadline) -> _ => Exchange::Ping,
        };
        if let Err(cause) = run_exchange(proto, store, session, &exchange) {
            return cause;
        }
    }
}

fn run_exchange<C: DeviceConn>(
    proto: &mut ProtoConn<C>,
    store: &dyn PendingStore,
    session: &mut Session,
    exchange: &Exchange,
) -> Result<(), SessionError> {
    let Some(prepared) = exchange.prepare(session, store)? else {
        // Redundant wake-up; nothing crosses the wire.
        return Ok(());
    };

    proto.write_message(&prepared.message)?;
    let reply: ClientMessage = proto.read_message()?;

    match (prepared.on_ack, reply) {
        (AckAction::ExpectPong, ClientMessage::Pong) => Ok(()),
        (AckAction::SetLevel { chan, level }, ClientMessage::Ack { .. }) => {
            session.levels.insert(chan, level);
            Ok(())
        }
        (AckAction::DropAcked { chan }, ClientMessage::Ack { acked_msg_ids }) => {
            if !acked_msg_ids.is_empty() {
                store.drop_by_msg_id(&chan, &acked_msg_ids)?;
            }
            Ok(())
        }
        (_, reply) => Err(SessionError::Protocol(format!(
            "unexpected reply to exchange: {}",
            reply_label(&reply)
        ))),
    }
}

fn reply_label(msg: &ClientMessage) -> &'static str {
    match msg {
        ClientMessage::Connect { .. } => "connect",
        ClientMessage::Ack { .. } => "ack",
        ClientMessage::Pong => "pong",
    }
}
