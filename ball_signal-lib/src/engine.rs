//! Peer-connection engine seam.
//!
//! The signaling session drives an engine through these traits and never
//! touches ICE, DTLS or codecs itself. State changes come back through
//! typed observer callbacks registered on each connection.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::source::FrameSource;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to create peer connection: {0}")]
    Create(String),

    #[error("session description rejected: {0}")]
    Sdp(String),

    #[error("failed to attach track: {0}")]
    Track(String),

    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    #[error("peer connection closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

pub type ConnectionStateHandler = Box<dyn Fn(ConnectionState) -> BoxFuture<'static, ()> + Send + Sync>;
pub type IceStateHandler = Box<dyn Fn(IceConnectionState) -> BoxFuture<'static, ()> + Send + Sync>;
pub type TrackHandler = Box<dyn Fn(TrackKind) -> BoxFuture<'static, ()> + Send + Sync>;

/// Creates peer connections.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_connection(&self, ice_servers: &[String]) -> Result<Arc<dyn PeerConnection>, EngineError>;
}

/// One negotiated peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Engine-unique id, used to tell a superseded handle from the current one.
    fn id(&self) -> u64;

    fn on_connection_state_change(&self, handler: ConnectionStateHandler);
    fn on_ice_connection_state_change(&self, handler: IceStateHandler);
    fn on_track(&self, handler: TrackHandler);

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Attach the outbound video track; the engine pulls frames from `source`.
    async fn add_video_track(&self, source: Arc<FrameSource>) -> Result<(), EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Local description including every candidate gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;

    fn ice_gathering_state(&self) -> IceGatheringState;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}
