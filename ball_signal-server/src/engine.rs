// src/engine.rs

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ball_signal_lib::engine::{
    ConnectionState, ConnectionStateHandler, EngineError, IceCandidate, IceConnectionState,
    IceGatheringState, IceStateHandler, PeerConnection, PeerEngine, SdpType, SessionDescription,
    TrackHandler, TrackKind,
};
use ball_signal_lib::source::{FrameSource, VideoFrame};
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const GATHER_NEW: u8 = 0;
const GATHER_GATHERING: u8 = 1;
const GATHER_COMPLETE: u8 = 2;

/// Turns raw RGB frames into VP8 payloads for the outbound track.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &VideoFrame) -> Option<Bytes>;
}

/// `PeerEngine` backed by the `webrtc` crate.
pub struct WebRtcEngine {
    api: API,
    next_id: AtomicU64,
    encoder: Option<Arc<dyn FrameEncoder>>,
}

impl WebRtcEngine {
    pub fn new(encoder: Option<Arc<dyn FrameEncoder>>) -> Result<Self, webrtc::Error> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, next_id: AtomicU64::new(1), encoder })
    }

    pub fn has_encoder(&self) -> bool {
        self.encoder.is_some()
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_connection(&self, ice_servers: &[String]) -> Result<Arc<dyn PeerConnection>, EngineError> {
        let mut config = RTCConfiguration::default();
        if !ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }];
        }
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| EngineError::Create(e.to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let gathering = Arc::new(AtomicU8::new(GATHER_NEW));
        let flag = Arc::clone(&gathering);
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let value = match state {
                RTCIceGathererState::Gathering => GATHER_GATHERING,
                RTCIceGathererState::Complete => GATHER_COMPLETE,
                _ => GATHER_NEW,
            };
            flag.store(value, Ordering::SeqCst);
            Box::pin(async move {
                debug!("peer connection {} ICE gathering state: {:?}", id, state);
            })
        }));

        Ok(Arc::new(WebRtcConnection {
            id,
            pc: Arc::new(pc),
            gathering,
            encoder: self.encoder.clone(),
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

pub struct WebRtcConnection {
    id: u64,
    pc: Arc<RTCPeerConnection>,
    gathering: Arc<AtomicU8>,
    encoder: Option<Arc<dyn FrameEncoder>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl WebRtcConnection {
    fn track_pump(&self, handle: JoinHandle<()>) {
        match self.pumps.lock() {
            Ok(mut pumps) => pumps.push(handle),
            Err(_) => handle.abort(),
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn on_connection_state_change(&self, handler: ConnectionStateHandler) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                handler(map_connection_state(state))
            }));
    }

    fn on_ice_connection_state_change(&self, handler: IceStateHandler) {
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                handler(map_ice_state(state))
            }));
    }

    fn on_track(&self, handler: TrackHandler) {
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            handler(kind)
        }));
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let desc = to_rtc(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| EngineError::Sdp(e.to_string()))
    }

    async fn add_video_track(&self, source: Arc<FrameSource>) -> Result<(), EngineError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "ball".to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::Track(e.to_string()))?;

        // RTCP has to be drained for the interceptors to run.
        self.track_pump(tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        }));
        if self.encoder.is_none() {
            warn!("peer connection {}: VP8 track attached without an encoder, no video will be sent", self.id);
        }
        self.track_pump(tokio::spawn(pump_frames(self.id, track, source, self.encoder.clone())));
        info!("peer connection {}: VP8 track attached", self.id);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::Sdp(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let desc = to_rtc(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| EngineError::Sdp(e.to_string()))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc
            .local_description()
            .await
            .map(|d| match d.sdp_type {
                RTCSdpType::Offer => SessionDescription::offer(d.sdp),
                _ => SessionDescription::answer(d.sdp),
            })
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        match self.gathering.load(Ordering::SeqCst) {
            GATHER_COMPLETE => IceGatheringState::Complete,
            GATHER_GATHERING => IceGatheringState::Gathering,
            _ => IceGatheringState::New,
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| EngineError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), EngineError> {
        let pumps: Vec<JoinHandle<()>> = match self.pumps.lock() {
            Ok(mut pumps) => pumps.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for pump in pumps {
            pump.abort();
        }
        self.pc.close().await.map_err(|e| EngineError::Sdp(e.to_string()))
    }
}

/// Pull one frame per frame interval and hand it to the encoder. Without
/// an encoder the frames are pulled and discarded so the source clock
/// still advances. The interval follows the source's current rate.
async fn pump_frames(
    pc_id: u64,
    track: Arc<TrackLocalStaticSample>,
    source: Arc<FrameSource>,
    encoder: Option<Arc<dyn FrameEncoder>>,
) {
    let mut duration = source.frame_duration();
    let mut ticker = tokio::time::interval(duration);
    let mut written: u64 = 0;
    loop {
        ticker.tick().await;
        let current = source.frame_duration();
        if current != duration {
            debug!("peer connection {}: frame interval now {:?}", pc_id, current);
            duration = current;
            ticker = tokio::time::interval_at(tokio::time::Instant::now() + duration, duration);
        }
        let frame = source.recv();
        let Some(data) = encoder.as_ref().and_then(|e| e.encode(&frame)) else {
            continue;
        };
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            warn!("peer connection {}: write_sample failed: {}", pc_id, e);
            continue;
        }
        written += 1;
        if written % 300 == 0 {
            debug!("peer connection {}: {} samples written (pts {})", pc_id, written, frame.pts);
        }
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| EngineError::Sdp(e.to_string()))
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_map_onto_engine_enums() {
        assert_eq!(map_connection_state(RTCPeerConnectionState::Connected), ConnectionState::Connected);
        assert_eq!(map_connection_state(RTCPeerConnectionState::Unspecified), ConnectionState::New);
        assert_eq!(map_ice_state(RTCIceConnectionState::Completed), IceConnectionState::Completed);
        assert_eq!(map_ice_state(RTCIceConnectionState::Failed), IceConnectionState::Failed);
    }

    #[test]
    fn encoder_presence_is_reported() {
        struct Blank;
        impl FrameEncoder for Blank {
            fn encode(&self, _: &VideoFrame) -> Option<Bytes> {
                None
            }
        }

        assert!(!WebRtcEngine::new(None).unwrap().has_encoder());
        assert!(WebRtcEngine::new(Some(Arc::new(Blank))).unwrap().has_encoder());
    }

    #[tokio::test]
    async fn fresh_connection_has_not_gathered() {
        let engine = WebRtcEngine::new(None).unwrap();
        let first = engine.create_connection(&[]).await.unwrap();
        let second = engine.create_connection(&[]).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.ice_gathering_state(), IceGatheringState::New);
        assert!(first.local_description().await.is_none());
        first.close().await.unwrap();
        second.close().await.unwrap();
    }
}
