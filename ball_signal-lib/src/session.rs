//! Per-client signaling state machine.
//!
//! A session is created per transport session. It reassembles inbound
//! streams into messages and handles each one on its own tracked task:
//! offers become answers (after full ICE gathering), coordinate reports
//! are scored against the ball's true position. Two locks guard it: the
//! session-state lock (streams, peer handle, task registry, phase) and the
//! video-pipeline lock (producer and its supervisory task).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::assembler::StreamAssembler;
use crate::config::SessionConfig;
use crate::context::Context;
use crate::engine::{
    ConnectionState, IceCandidate, IceConnectionState, IceGatheringState, PeerConnection, PeerEngine,
    SessionDescription, TrackKind,
};
use crate::error::{Result, SignalError};
use crate::message::{
    CoordinatesPayload, IceCandidatePayload, InboundMessage, OfferPayload, OutboundMessage, ScoreError,
};
use crate::producer::FrameProducer;
use crate::source::FrameSource;
use crate::transport::{StreamId, StreamTransport};

const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Negotiating,
    Connected,
    Closing,
    Closed,
}

struct SessionState {
    phase: SessionPhase,
    assembler: StreamAssembler,
    peer: Option<Arc<dyn PeerConnection>>,
    tasks: HashMap<u64, JoinHandle<()>>,
    next_task: u64,
}

#[derive(Default)]
struct VideoPipeline {
    task: Option<JoinHandle<()>>,
    producer: Option<Arc<FrameProducer>>,
    /// Id of the peer connection the producer was created for.
    owner: Option<u64>,
}

struct Inner {
    id: u64,
    label: String,
    config: Arc<SessionConfig>,
    engine: Arc<dyn PeerEngine>,
    transport: Arc<dyn StreamTransport>,
    negotiating: AtomicBool,
    state: Mutex<SessionState>,
    video: Mutex<VideoPipeline>,
}

/// Clears the negotiation flag when the negotiation ends, including when
/// its task is aborted mid-flight.
struct NegotiationGuard<'a>(&'a AtomicBool);

impl Drop for NegotiationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SignalingSession {
    inner: Arc<Inner>,
}

impl SignalingSession {
    pub fn new(
        id: u64,
        engine: Arc<dyn PeerEngine>,
        transport: Arc<dyn StreamTransport>,
        config: Arc<SessionConfig>,
    ) -> Self {
        let label = format!("session {}", id);
        info!("[{}] signaling session created", label);
        let state = SessionState {
            phase: SessionPhase::Idle,
            assembler: StreamAssembler::new(label.clone()),
            peer: None,
            tasks: HashMap::new(),
            next_task: 0,
        };
        Self {
            inner: Arc::new(Inner {
                id,
                label,
                config,
                engine,
                transport,
                negotiating: AtomicBool::new(false),
                state: Mutex::new(state),
                video: Mutex::new(VideoPipeline::default()),
            }),
        }
    }

    pub fn from_context(ctx: &Context, transport: Arc<dyn StreamTransport>) -> Self {
        Self::new(ctx.next_session_id(), Arc::clone(&ctx.engine), transport, Arc::clone(&ctx.session))
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.state.lock().await.phase
    }

    pub fn is_negotiating(&self) -> bool {
        self.inner.negotiating.load(Ordering::SeqCst)
    }

    pub async fn peer_connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.inner.state.lock().await.peer.clone()
    }

    pub async fn producer(&self) -> Option<Arc<FrameProducer>> {
        self.inner.video.lock().await.producer.clone()
    }

    pub async fn is_video_streaming(&self) -> bool {
        self.inner.video.lock().await.task.is_some()
    }

    pub async fn pending_tasks(&self) -> usize {
        self.inner.state.lock().await.tasks.len()
    }

    pub async fn open_streams(&self) -> usize {
        self.inner.state.lock().await.assembler.open_streams()
    }

    /// Feed one inbound chunk. A completed message is handled on its own
    /// tracked task.
    pub async fn on_message(&self, stream_id: StreamId, chunk: &[u8], is_final: bool) {
        let message = self.inner.state.lock().await.assembler.feed(stream_id, chunk, is_final);
        if let Some(message) = message {
            let session = self.clone();
            self.spawn_tracked(async move { session.handle_message(message).await })
                .await;
        }
    }

    pub async fn on_stream_reset(&self, stream_id: StreamId) {
        self.inner.state.lock().await.assembler.reset(stream_id);
    }

    pub async fn handle_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::Offer(offer) => {
                info!("[{}] processing SDP offer", self.inner.label);
                self.handle_offer(offer).await;
            }
            InboundMessage::Coordinates(coords) => self.handle_coordinates(coords).await,
            InboundMessage::IceCandidate(candidate) => self.handle_ice_candidate(candidate).await,
            InboundMessage::Unknown(kind) => {
                warn!("[{}] unknown message type: {}", self.inner.label, kind);
            }
        }
    }

    /// Run `fut` on a task recorded in the registry; the task removes itself
    /// when it finishes. Nothing is spawned while the session is closing.
    async fn spawn_tracked<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.inner.state.lock().await;
        if state.phase == SessionPhase::Closing {
            debug!("[{}] session closing, not spawning task", self.inner.label);
            return;
        }
        let task_id = state.next_task;
        state.next_task += 1;

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            fut.await;
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().await.tasks.remove(&task_id);
            }
        });
        // The task cannot remove itself before this insert: we hold the lock.
        state.tasks.insert(task_id, handle);
    }

    pub async fn handle_offer(&self, offer: OfferPayload) {
        let previous = {
            let mut state = self.inner.state.lock().await;
            if state.phase == SessionPhase::Closing {
                warn!("[{}] session closing, ignoring offer", self.inner.label);
                return;
            }
            if self.inner.negotiating.swap(true, Ordering::SeqCst) {
                warn!("[{}] negotiation already in progress, ignoring offer", self.inner.label);
                return;
            }
            state.phase = SessionPhase::Negotiating;
            state.peer.take()
        };
        let _guard = NegotiationGuard(&self.inner.negotiating);

        if let Some(previous) = previous {
            info!("[{}] new offer supersedes peer connection {}", self.inner.label, previous.id());
            if let Err(e) = previous.close().await {
                warn!("[{}] error closing previous peer connection: {}", self.inner.label, e);
            }
            self.stop_video_stream().await;
        }

        match self.negotiate(offer).await {
            Ok(()) => info!("[{}] SDP answer sent", self.inner.label),
            Err(e) => {
                error!("[{}] error handling SDP offer: {}", self.inner.label, e);
                self.abandon_negotiation().await;
            }
        }
    }

    async fn negotiate(&self, offer: OfferPayload) -> Result<()> {
        let sdp = match (offer.kind, offer.sdp) {
            (Some(_), Some(sdp)) => sdp,
            _ => {
                return Err(SignalError::InvalidOffer(
                    "offer must carry both type and sdp".into(),
                ));
            }
        };

        let pc = self
            .inner
            .engine
            .create_connection(&self.inner.config.ice_servers)
            .await?;
        debug!("[{}] created peer connection {}", self.inner.label, pc.id());
        self.inner.state.lock().await.peer = Some(Arc::clone(&pc));
        self.register_observers(&pc);

        pc.set_remote_description(SessionDescription::offer(sdp)).await?;
        info!("[{}] remote description set", self.inner.label);

        // The track has to exist before the answer is created, otherwise
        // the answer carries no media section to gather candidates for.
        let producer = self.attach_producer(pc.id()).await?;
        let source = Arc::new(FrameSource::new(self.inner.label.clone(), producer));
        pc.add_video_track(source).await?;
        info!("[{}] video track added to peer connection", self.inner.label);

        let answer = pc.create_answer().await?;
        pc.set_local_description(answer).await?;
        info!("[{}] local description set", self.inner.label);

        self.wait_for_ice_gathering(pc.as_ref()).await;

        let local = pc
            .local_description()
            .await
            .ok_or(SignalError::MissingLocalDescription)?;
        self.send_message(&OutboundMessage::Answer { sdp: local.sdp })?;
        Ok(())
    }

    /// Tear down whatever a failed negotiation left behind and return to
    /// `Idle` so the next offer starts clean.
    async fn abandon_negotiation(&self) {
        let peer = {
            let mut state = self.inner.state.lock().await;
            if state.phase == SessionPhase::Negotiating {
                state.phase = SessionPhase::Idle;
            }
            state.peer.take()
        };
        if let Some(pc) = peer {
            if let Err(e) = pc.close().await {
                warn!("[{}] error closing abandoned peer connection: {}", self.inner.label, e);
            }
        }
        self.stop_video_stream().await;
    }

    /// Polls until the engine has embedded every candidate in the local
    /// description. There is deliberately no deadline.
    async fn wait_for_ice_gathering(&self, pc: &dyn PeerConnection) {
        let interval = self.inner.config.ice_poll_interval;
        let mut polls: u64 = 0;
        loop {
            let state = pc.ice_gathering_state();
            if state == IceGatheringState::Complete {
                break;
            }
            polls += 1;
            if polls % 50 == 0 {
                debug!(
                    "[{}] still waiting for ICE gathering ({:?}, {} polls)",
                    self.inner.label, state, polls
                );
            }
            tokio::time::sleep(interval).await;
        }
        debug!("[{}] ICE gathering complete after {} polls", self.inner.label, polls);
    }

    fn register_observers(&self, pc: &Arc<dyn PeerConnection>) {
        let pc_id = pc.id();

        let weak = Arc::downgrade(&self.inner);
        pc.on_connection_state_change(Box::new(move |state: ConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = SignalingSession::upgrade(&weak) {
                    let handler = session.clone();
                    session
                        .spawn_tracked(async move { handler.on_connection_state(pc_id, state).await })
                        .await;
                }
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        pc.on_ice_connection_state_change(Box::new(move |state: IceConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = SignalingSession::upgrade(&weak) {
                    let handler = session.clone();
                    session
                        .spawn_tracked(async move { handler.on_ice_connection_state(pc_id, state).await })
                        .await;
                }
            })
        }));

        let label = self.inner.label.clone();
        pc.on_track(Box::new(move |kind: TrackKind| {
            let label = label.clone();
            Box::pin(async move {
                info!("[{}] received {} track", label, kind);
            })
        }));
    }

    async fn is_current_peer(&self, pc_id: u64) -> bool {
        self.inner
            .state
            .lock()
            .await
            .peer
            .as_ref()
            .is_some_and(|pc| pc.id() == pc_id)
    }

    async fn on_connection_state(&self, pc_id: u64, state: ConnectionState) {
        info!("[{}] connection state: {:?}", self.inner.label, state);
        if !self.is_current_peer(pc_id).await {
            debug!("[{}] ignoring state of superseded connection {}", self.inner.label, pc_id);
            return;
        }
        match state {
            ConnectionState::Connected => {
                info!("[{}] WebRTC connection established", self.inner.label);
                self.mark_connected().await;
                self.start_video_for(pc_id).await;
            }
            ConnectionState::Failed | ConnectionState::Closed => {
                info!("[{}] WebRTC connection closed", self.inner.label);
                self.stop_video_for(pc_id).await;
                let released = {
                    let mut state = self.inner.state.lock().await;
                    if state.peer.as_ref().is_some_and(|pc| pc.id() == pc_id) {
                        if state.phase != SessionPhase::Closing {
                            state.phase = SessionPhase::Closed;
                        }
                        state.peer.take()
                    } else {
                        None
                    }
                };
                if let Some(pc) = released {
                    if let Err(e) = pc.close().await {
                        warn!("[{}] error releasing peer connection: {}", self.inner.label, e);
                    }
                }
            }
            _ => {}
        }
    }

    async fn on_ice_connection_state(&self, pc_id: u64, state: IceConnectionState) {
        info!("[{}] ICE connection state: {:?}", self.inner.label, state);
        if !self.is_current_peer(pc_id).await {
            return;
        }
        match state {
            IceConnectionState::Connected => {
                info!("[{}] ICE connection established", self.inner.label);
                self.mark_connected().await;
                self.start_video_for(pc_id).await;
            }
            IceConnectionState::Failed | IceConnectionState::Closed => {
                info!("[{}] ICE connection failed/closed", self.inner.label);
                self.stop_video_for(pc_id).await;
            }
            _ => {}
        }
    }

    async fn mark_connected(&self) {
        let mut state = self.inner.state.lock().await;
        if matches!(state.phase, SessionPhase::Negotiating | SessionPhase::Idle) {
            state.phase = SessionPhase::Connected;
        }
    }

    pub async fn handle_coordinates(&self, coords: CoordinatesPayload) {
        let (Some(x), Some(y)) = (coords.x, coords.y) else {
            warn!("[{}] coordinates message missing x or y", self.inner.label);
            return;
        };

        let truth = self.producer().await.map(|p| p.position());
        let response = score_coordinates(x, y, truth);
        if let OutboundMessage::Error { error, .. } = &response {
            match (error, truth) {
                (ScoreError::Distance(d), Some((tx, ty))) => info!(
                    "[{}] client ({:.1}, {:.1}) vs true ({:.1}, {:.1}): error {:.3}px",
                    self.inner.label, x, y, tx, ty, d
                ),
                _ => info!(
                    "[{}] client ({:.1}, {:.1}) reported with no active producer",
                    self.inner.label, x, y
                ),
            }
        }

        if let Err(e) = self.send_message(&response) {
            error!("[{}] failed to send coordinate score: {}", self.inner.label, e);
        }
    }

    pub async fn handle_ice_candidate(&self, payload: IceCandidatePayload) {
        let Some(pc) = self.peer_connection().await else {
            warn!("[{}] no peer connection available for ICE candidate", self.inner.label);
            return;
        };
        debug!("[{}] received ICE candidate: {}", self.inner.label, payload.candidate);
        let candidate = IceCandidate {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
        };
        match pc.add_ice_candidate(candidate).await {
            Ok(()) => info!("[{}] ICE candidate added to peer connection", self.inner.label),
            Err(e) => error!("[{}] error adding ICE candidate: {}", self.inner.label, e),
        }
    }

    fn send_message(&self, message: &OutboundMessage) -> Result<()> {
        let bytes = message.to_bytes()?;
        let stream = self.inner.transport.open_uni_stream()?;
        self.inner.transport.send(stream, &bytes, true)?;
        debug!("[{}] sent {} bytes on stream {}", self.inner.label, bytes.len(), stream);
        Ok(())
    }

    /// Create the producer for connection `pc_id`, hand it to the video
    /// pipeline, and only then start its worker. A task aborted at any
    /// await in here never holds the last handle to a running producer.
    async fn attach_producer(&self, pc_id: u64) -> Result<Arc<FrameProducer>> {
        let producer = Arc::new(FrameProducer::new(
            self.inner.label.clone(),
            self.inner.config.producer.clone(),
        )?);
        self.install_producer(Arc::clone(&producer), pc_id).await;
        producer.start()?;
        Ok(producer)
    }

    async fn install_producer(&self, producer: Arc<FrameProducer>, pc_id: u64) {
        let replaced = {
            let mut video = self.inner.video.lock().await;
            video.owner = Some(pc_id);
            video.producer.replace(producer)
        };
        if let Some(old) = replaced {
            warn!("[{}] replacing a frame producer that was still attached", self.inner.label);
            stop_producer(old).await;
        }
    }

    /// Spawn the supervisory task. Frames reach the peer through pulls on
    /// the attached `FrameSource`; this task only keeps an eye on the
    /// producer until it is cancelled.
    pub async fn start_video_stream(&self) {
        let mut video = self.inner.video.lock().await;
        self.spawn_supervisor(&mut video);
    }

    pub async fn stop_video_stream(&self) {
        let mut video = self.inner.video.lock().await;
        self.teardown_video(&mut video).await;
    }

    /// Start video only if the pipeline still belongs to `pc_id`.
    async fn start_video_for(&self, pc_id: u64) {
        let mut video = self.inner.video.lock().await;
        if video.owner != Some(pc_id) {
            debug!("[{}] video pipeline not owned by connection {}, not starting", self.inner.label, pc_id);
            return;
        }
        self.spawn_supervisor(&mut video);
    }

    /// Stop video only if the pipeline still belongs to `pc_id`. The check
    /// runs under the video lock, so a late event from a superseded
    /// connection cannot tear down its successor's producer.
    async fn stop_video_for(&self, pc_id: u64) {
        let mut video = self.inner.video.lock().await;
        if video.owner != Some(pc_id) {
            debug!("[{}] video pipeline not owned by connection {}, not stopping", self.inner.label, pc_id);
            return;
        }
        self.teardown_video(&mut video).await;
    }

    fn spawn_supervisor(&self, video: &mut VideoPipeline) {
        if video.task.is_some() {
            debug!("[{}] video task already exists, skipping", self.inner.label);
            return;
        }
        let producer = video.producer.as_ref().map(Arc::downgrade);
        video.task = Some(tokio::spawn(supervise(self.inner.label.clone(), producer)));
        info!("[{}] video streaming started", self.inner.label);
    }

    async fn teardown_video(&self, video: &mut VideoPipeline) {
        if let Some(task) = video.task.take() {
            debug!("[{}] cancelling video task", self.inner.label);
            task.abort();
        }
        video.owner = None;
        if let Some(producer) = video.producer.take() {
            stop_producer(producer).await;
        }
        info!("[{}] video streaming stopped", self.inner.label);
    }

    /// Cancel every tracked task, close the peer connection and stop video.
    /// Safe to call repeatedly and while a negotiation is in flight; must
    /// not be called from inside a tracked task.
    pub async fn cleanup(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut state = self.inner.state.lock().await;
            state.phase = SessionPhase::Closing;
            state.assembler.clear();
            state.tasks.drain().map(|(_, handle)| handle).collect()
        };

        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("[{}] task failed during cleanup: {}", self.inner.label, e);
                }
            }
        }

        let peer = self.inner.state.lock().await.peer.take();
        if let Some(pc) = peer {
            if let Err(e) = pc.close().await {
                warn!("[{}] error closing peer connection: {}", self.inner.label, e);
            }
        }
        self.stop_video_stream().await;

        self.inner.state.lock().await.phase = SessionPhase::Closed;
        info!("[{}] session cleaned up", self.inner.label);
    }
}

/// Build the score reply for a client-reported ball position.
pub fn score_coordinates(x: f64, y: f64, truth: Option<(f64, f64)>) -> OutboundMessage {
    match truth {
        Some((true_x, true_y)) => {
            let dx = x - true_x;
            let dy = y - true_y;
            OutboundMessage::Error {
                error: ScoreError::Distance((dx * dx + dy * dy).sqrt()),
                client_x: x,
                client_y: y,
                true_x: Some(true_x),
                true_y: Some(true_y),
            }
        }
        None => OutboundMessage::Error {
            error: ScoreError::Unavailable,
            client_x: x,
            client_y: y,
            true_x: None,
            true_y: None,
        },
    }
}

async fn stop_producer(producer: Arc<FrameProducer>) {
    // `stop` joins an OS thread; keep that off the async workers.
    if let Err(e) = tokio::task::spawn_blocking(move || producer.stop()).await {
        error!("frame producer stop task failed: {}", e);
    }
}

async fn supervise(label: String, producer: Option<Weak<FrameProducer>>) {
    debug!("[{}] video supervisor running", label);
    let mut ticker = tokio::time::interval(SUPERVISOR_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Some(producer) = producer.as_ref().and_then(Weak::upgrade) {
            let stats = producer.get_stats();
            debug!(
                "[{}] producer: {} frames, buffer {}, ball at ({:.1}, {:.1})",
                label, stats.frames_generated, stats.buffer_depth, stats.position.0, stats.position.1
            );
        }
    }
}
