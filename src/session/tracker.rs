//! Session lifecycle tracking.
//!
//! Exists so every component can log against one stable session identity.

use std::net::SocketAddr;

use crate::broker::SessionId;

use super::SessionError;

pub struct Tracker {
    session_id: SessionId,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            session_id: SessionId::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn start(&self, addr: Option<SocketAddr>) {
        match addr {
            Some(addr) => tracing::debug!(session = %self.session_id, "connected {addr}"),
            None => tracing::debug!(session = %self.session_id, "connected"),
        }
    }

    pub fn registered(&self, device_id: &str) {
        tracing::info!(session = %self.session_id, "registered {device_id}");
    }

    pub fn end(&self, cause: &SessionError) {
        tracing::debug!(session = %self.session_id, "ended with: {cause}");
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trackers_get_distinct_session_ids() {
        let a = Tracker::new();
        let b = Tracker::new();
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn lifecycle_logging_does_not_panic() {
        let track = Tracker::new();
        track.start(Some("127.0.0.1:9999".parse().unwrap()));
        track.start(None);
        track.registered("DEV-ID");
        track.end(&SessionError::Superseded);
    }
}
