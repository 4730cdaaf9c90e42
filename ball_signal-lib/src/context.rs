use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use crate::config::SessionConfig;
use crate::engine::PeerEngine;

/// Process-wide handles shared by every transport session: the engine,
/// session settings, and a broadcast channel used to fan out shutdown.
#[derive(Clone)]
pub struct Context {
    pub engine: Arc<dyn PeerEngine>,
    pub session: Arc<SessionConfig>,
    pub shutdown: broadcast::Sender<()>,
    next_session: Arc<AtomicU64>,
}

impl Context {
    pub fn new(engine: Arc<dyn PeerEngine>, session: SessionConfig) -> Self {
        let (shutdown, _rx) = broadcast::channel(1);
        Self {
            engine,
            session: Arc::new(session),
            shutdown,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::SeqCst)
    }

    /// Ask every live session to clean up. Returns how many were listening.
    pub fn trigger_shutdown(&self) -> usize {
        self.shutdown.send(()).unwrap_or(0)
    }
}
