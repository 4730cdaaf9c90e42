//! ball_signal-lib: signaling sessions, synthetic ball video, and the
//! engine/transport seams the server plugs into.

pub mod assembler;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod frame;
pub mod message;
pub mod producer;
pub mod session;
pub mod source;
pub mod transport;

// re-exports for ergonomic imports:
pub use assembler::StreamAssembler;
pub use config::{Config, SessionConfig};
pub use context::Context;
pub use engine::{PeerConnection, PeerEngine};
pub use error::SignalError;
pub use frame::Frame;
pub use message::{InboundMessage, OutboundMessage};
pub use producer::{FrameProducer, ProducerConfig, ProducerStats};
pub use session::{SessionPhase, SignalingSession};
pub use source::{FrameSource, VideoFrame};
pub use transport::{StreamFrame, StreamId, StreamTransport};
