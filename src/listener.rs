//! Device listener: TCP (optionally TLS) accept loop and session admission.

use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded};
use thiserror::Error;

use crate::protocol::DeviceConn;

/// Back-off before retrying a temporary accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("no private key found in {0}")]
    MissingKey(String),
}

/// Counting gate on concurrent sessions. Acquiring blocks once
/// `max_sessions` permits are out, back-pressuring the accept loop; a
/// permit returns when its session thread ends.
#[derive(Clone)]
pub struct SessionLimiter {
    permits_tx: Sender<()>,
    permits_rx: Receiver<()>,
}

pub struct ConnPermit {
    permits_rx: Receiver<()>,
}

impl SessionLimiter {
    pub fn new(max_sessions: usize) -> Self {
        let (permits_tx, permits_rx) = bounded(max_sessions.max(1));
        Self {
            permits_tx,
            permits_rx,
        }
    }

    pub fn consume_conn(&self) -> ConnPermit {
        self.permits_tx
            .send(())
            .expect("limiter receiver owned by self");
        ConnPermit {
            permits_rx: self.permits_rx.clone(),
        }
    }
}

impl Drop for ConnPermit {
    fn drop(&mut self) {
        let _ = self.permits_rx.try_recv();
    }
}

/// Loads a rustls server config from PEM certificate chain and key files.
pub fn load_tls_config(cert: &Path, key: &Path) -> Result<Arc<rustls::ServerConfig>, ListenerError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key_der = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or_else(|| ListenerError::MissingKey(key.display().to_string()))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key_der)?;
    Ok(Arc::new(config))
}

/// Listens for device connections and spawns one session thread per accept.
pub struct DeviceListener {
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl DeviceListener {
    pub fn bind(addr: &str, tls: Option<Arc<rustls::ServerConfig>>) -> Result<Self, ListenerError> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            tls,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until a non-temporary error. Each accepted
    /// connection runs `session` on its own thread; a panicking session is
    /// contained there and logged, other sessions are unaffected.
    pub fn accept_loop<F>(&self, limiter: &SessionLimiter, session: F) -> Result<(), ListenerError>
    where
        F: Fn(Box<dyn DeviceConn>) + Clone + Send + 'static,
    {
        loop {
            let permit = limiter.consume_conn();
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(err) if is_temporary(&err) => {
                    tracing::error!("device listener: {err} -- retrying");
                    thread::sleep(ACCEPT_RETRY_DELAY);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let tls = self.tls.clone();
            let session = session.clone();
            let spawned = thread::Builder::new()
                .name("device-session".to_string())
                .spawn(move || {
                    let _permit = permit;
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        match wrap_stream(stream, tls) {
                            Ok(conn) => session(conn),
                            Err(err) => tracing::info!("device connection setup failed: {err}"),
                        }
                    }));
                    if let Err(panic) = outcome {
                        tracing::error!(
                            "terminating device connection on panic: {}",
                            panic_message(panic.as_ref())
                        );
                    }
                });
            if let Err(err) = spawned {
                tracing::error!("could not spawn session thread: {err}");
            }
        }
    }
}

fn wrap_stream(
    stream: TcpStream,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> Result<Box<dyn DeviceConn>, ListenerError> {
    match tls {
        None => Ok(Box::new(stream)),
        Some(config) => {
            let conn = rustls::ServerConnection::new(config)?;
            Ok(Box::new(rustls::StreamOwned::new(conn, stream)))
        }
    }
}

fn is_temporary(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
