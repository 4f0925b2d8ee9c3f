//! Shared wire-level fixtures: an in-process server and a protocol-speaking
//! test client.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use courier::broker::{Broker, BrokerConfig, BrokerHandle};
use courier::listener::{DeviceListener, SessionLimiter};
use courier::protocol::{ClientMessage, ConnParams, FrameError, ProtoConn, ServerMessage};
use courier::session::{SessionConfig, run_session};
use courier::store::{InMemoryStore, PendingStore};

pub const WIRE_TIMEOUT: Duration = Duration::from_secs(2);

pub fn quick_session_config() -> SessionConfig {
    SessionConfig {
        ping_interval: Duration::from_secs(30),
        exchange_timeout: WIRE_TIMEOUT,
        queue_size: 10,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<InMemoryStore>,
    pub broker: BrokerHandle,
    _owner: Broker,
}

pub fn start_server(session_config: SessionConfig) -> TestServer {
    courier::telemetry::init(2);

    let store = Arc::new(InMemoryStore::new());
    let dyn_store: Arc<dyn PendingStore> = store.clone();
    let owner = Broker::start(
        Arc::clone(&dyn_store),
        BrokerConfig {
            unicast_enqueue_timeout: session_config.exchange_timeout,
        },
    );
    let broker = owner.handle();

    let listener = DeviceListener::bind("127.0.0.1:0", None).expect("bind device listener");
    let addr = listener.local_addr().expect("listener addr");
    let limiter = SessionLimiter::new(16);
    let loop_broker = broker.clone();
    std::thread::spawn(move || {
        let _ = listener.accept_loop(&limiter, move |conn| {
            run_session(
                conn,
                Arc::clone(&dyn_store),
                loop_broker.clone(),
                session_config,
            );
        });
    });

    TestServer {
        addr,
        store,
        broker,
        _owner: owner,
    }
}

/// A device-side protocol endpoint for driving the real server.
pub struct TestClient {
    proto: ProtoConn<TcpStream>,
}

impl TestClient {
    /// Dials, performs the CONNECT/CONNACK handshake and returns the agreed
    /// timer parameters.
    pub fn connect(
        addr: SocketAddr,
        device_id: &str,
        levels: &[(&str, i64)],
        info: &[(&str, &str)],
    ) -> (TestClient, ConnParams) {
        let stream = TcpStream::connect(addr).expect("dial device listener");
        let mut proto = ProtoConn::new(stream, WIRE_TIMEOUT);

        let levels: BTreeMap<String, i64> = levels
            .iter()
            .map(|(chan, level)| (chan.to_string(), *level))
            .collect();
        let info = info
            .iter()
            .map(|(key, value)| (key.to_string(), json!(value)))
            .collect();
        proto
            .write_message(&ClientMessage::Connect {
                device_id: device_id.to_string(),
                levels,
                info,
                cookie: None,
            })
            .expect("send connect");

        let ServerMessage::ConnAck { params } = proto.read_message().expect("read connack") else {
            panic!("expected CONNACK");
        };
        (TestClient { proto }, params)
    }

    pub fn recv(&mut self) -> ServerMessage {
        self.proto.read_message().expect("read server message")
    }

    pub fn try_recv(&mut self) -> Result<ServerMessage, FrameError> {
        self.proto.read_message()
    }

    pub fn ack(&mut self) {
        self.send(&ClientMessage::Ack {
            acked_msg_ids: vec![],
        });
    }

    pub fn ack_msg_ids(&mut self, msg_ids: &[&str]) {
        self.send(&ClientMessage::Ack {
            acked_msg_ids: msg_ids.iter().map(|id| id.to_string()).collect(),
        });
    }

    pub fn pong(&mut self) {
        self.send(&ClientMessage::Pong);
    }

    pub fn send(&mut self, msg: &ClientMessage) {
        self.proto.write_message(msg).expect("send client message");
    }
}

/// Polls `cond` until it holds or the deadline passes.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WIRE_TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
