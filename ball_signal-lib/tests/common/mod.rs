#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ball_signal_lib::config::SessionConfig;
use ball_signal_lib::engine::{
    ConnectionState, ConnectionStateHandler, EngineError, IceCandidate, IceConnectionState,
    IceGatheringState, IceStateHandler, PeerConnection, PeerEngine, SessionDescription, TrackHandler,
    TrackKind,
};
use ball_signal_lib::producer::ProducerConfig;
use ball_signal_lib::source::FrameSource;
use ball_signal_lib::transport::{StreamId, StreamIdAllocator, StreamTransport, TransportError};
use ball_signal_lib::{SignalingSession, StreamFrame};
use serde_json::Value;

pub const OFFER_SDP: &str = "v=0\r\no=- 1234567890 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

pub fn offer_json() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "type": "offer", "sdp": OFFER_SDP })).unwrap()
}

pub fn session_config() -> Arc<SessionConfig> {
    Arc::new(SessionConfig {
        ice_servers: vec!["stun:stun.example.org:3478".into()],
        ice_poll_interval: Duration::from_millis(5),
        producer: ProducerConfig {
            width: 64,
            height: 48,
            radius: 5.0,
            ..ProducerConfig::default()
        },
    })
}

pub struct MockConnection {
    pub id: u64,
    pub ice_servers: Vec<String>,
    pub gathering_complete: AtomicBool,
    pub closed: AtomicBool,
    pub fail_remote: bool,
    pub remote: Mutex<Option<SessionDescription>>,
    pub local: Mutex<Option<SessionDescription>>,
    pub track: Mutex<Option<Arc<FrameSource>>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    conn_handler: Mutex<Option<ConnectionStateHandler>>,
    ice_handler: Mutex<Option<IceStateHandler>>,
    track_handler: Mutex<Option<TrackHandler>>,
}

impl MockConnection {
    pub fn complete_gathering(&self) {
        self.gathering_complete.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn fire_connection_state(&self, state: ConnectionState) {
        let fut = self.conn_handler.lock().unwrap().as_ref().map(|h| h(state));
        if let Some(fut) = fut {
            fut.await;
        }
    }

    pub async fn fire_ice_state(&self, state: IceConnectionState) {
        let fut = self.ice_handler.lock().unwrap().as_ref().map(|h| h(state));
        if let Some(fut) = fut {
            fut.await;
        }
    }

    pub async fn fire_track(&self, kind: TrackKind) {
        let fut = self.track_handler.lock().unwrap().as_ref().map(|h| h(kind));
        if let Some(fut) = fut {
            fut.await;
        }
    }

    pub fn has_observers(&self) -> bool {
        self.conn_handler.lock().unwrap().is_some()
            && self.ice_handler.lock().unwrap().is_some()
            && self.track_handler.lock().unwrap().is_some()
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
        *self.conn_handler.lock().unwrap() = Some(handler);
    }

    fn on_ice_connection_state_change(&self, handler: IceStateHandler) {
        *self.ice_handler.lock().unwrap() = Some(handler);
    }

    fn on_track(&self, handler: TrackHandler) {
        *self.track_handler.lock().unwrap() = Some(handler);
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        if self.fail_remote {
            return Err(EngineError::Sdp("mock rejects every offer".into()));
        }
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn add_video_track(&self, source: Arc<FrameSource>) -> Result<(), EngineError> {
        *self.track.lock().unwrap() = Some(source);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if self.track.lock().unwrap().is_none() {
            return Err(EngineError::Sdp("answer requested before a track was attached".into()));
        }
        Ok(SessionDescription::answer(format!("v=0\r\ns=mock-{}\r\n", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let local = self.local.lock().unwrap().clone()?;
        if self.gathering_complete.load(Ordering::SeqCst) {
            Some(SessionDescription::answer(format!(
                "{}a=candidate:1 1 udp 2130706431 192.0.2.1 5000 typ host\r\n",
                local.sdp
            )))
        } else {
            Some(local)
        }
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        if self.gathering_complete.load(Ordering::SeqCst) {
            IceGatheringState::Complete
        } else {
            IceGatheringState::Gathering
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(EngineError::Candidate(candidate.candidate));
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockEngine {
    pub auto_complete_gathering: bool,
    pub fail_create: bool,
    pub fail_remote: bool,
    pub next_id: AtomicU64,
    pub created: AtomicUsize,
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockEngine {
    pub fn completing() -> Self {
        Self { auto_complete_gathering: true, ..Self::default() }
    }

    pub fn stalling() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.connections.lock().unwrap()[index])
    }
}

#[async_trait]
impl PeerEngine for MockEngine {
    async fn create_connection(&self, ice_servers: &[String]) -> Result<Arc<dyn PeerConnection>, EngineError> {
        if self.fail_create {
            return Err(EngineError::Create("mock engine is down".into()));
        }
        let conn = Arc::new(MockConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            ice_servers: ice_servers.to_vec(),
            gathering_complete: AtomicBool::new(self.auto_complete_gathering),
            closed: AtomicBool::new(false),
            fail_remote: self.fail_remote,
            remote: Mutex::new(None),
            local: Mutex::new(None),
            track: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            conn_handler: Mutex::new(None),
            ice_handler: Mutex::new(None),
            track_handler: Mutex::new(None),
        });
        self.connections.lock().unwrap().push(Arc::clone(&conn));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }
}

/// Records every outbound stream write.
#[derive(Default)]
pub struct MockTransport {
    ids: Mutex<StreamIdAllocator>,
    pub sent: Mutex<Vec<StreamFrame>>,
    pub closed: AtomicBool,
}

impl MockTransport {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Every finished outbound document, parsed.
    pub fn messages(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.fin)
            .map(|f| serde_json::from_slice(&f.payload).unwrap())
            .collect()
    }
}

impl StreamTransport for MockTransport {
    fn open_uni_stream(&self) -> Result<StreamId, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(self.ids.lock().unwrap().next_id())
    }

    fn send(&self, stream: StreamId, data: &[u8], fin: bool) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(StreamFrame::data(stream, data.to_vec(), fin));
        Ok(())
    }
}

pub fn session(engine: &Arc<MockEngine>, transport: &Arc<MockTransport>) -> SignalingSession {
    SignalingSession::new(
        1,
        Arc::clone(engine) as Arc<dyn PeerEngine>,
        Arc::clone(transport) as Arc<dyn StreamTransport>,
        session_config(),
    )
}

pub async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn wait_for_tasks(session: &SignalingSession, expected: usize) {
    for _ in 0..300 {
        if session.pending_tasks().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never settled at {} pending tasks", session.id(), expected);
}

pub async fn wait_for_idle(session: &SignalingSession) {
    wait_for_tasks(session, 0).await;
}
