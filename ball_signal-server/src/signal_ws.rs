use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use async_stream::stream;
use ball_signal_lib::transport::{StreamIdAllocator, TransportError};
use ball_signal_lib::{Context, SignalingSession, StreamFrame, StreamId, StreamTransport};
use futures_util::{StreamExt, future::select};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use warp::{Filter, Rejection, Reply, ws::{Message as WsMsg, WebSocket}};

/// Cloneable filter for the shared context
fn with_ctx(ctx: Context) -> impl Filter<Extract = (Context,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

/// Build the WebSocket route under `/connection`
pub fn ws_routes(ctx: Context) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    // allow CORS for WS handshake
    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "OPTIONS"])
        .allow_headers(vec!["sec-websocket-protocol", "origin", "upgrade"]);

    warp::path("connection")
        .and(warp::ws())
        .and(with_ctx(ctx))
        .map(|ws: warp::ws::Ws, ctx| ws.on_upgrade(move |socket| handle_ws(socket, ctx)))
        .with(cors)
}

/// One WebSocket carries one transport session. Each binary message is a
/// `StreamFrame`; outbound frames are queued here and flushed by the
/// socket's writer.
struct WsTransport {
    ids: Mutex<StreamIdAllocator>,
    tx: mpsc::UnboundedSender<StreamFrame>,
}

impl StreamTransport for WsTransport {
    fn open_uni_stream(&self) -> Result<StreamId, TransportError> {
        if self.tx.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut ids = self.ids.lock().map_err(|_| TransportError::Closed)?;
        Ok(ids.next_id())
    }

    fn send(&self, stream: StreamId, data: &[u8], fin: bool) -> Result<(), TransportError> {
        self.tx
            .send(StreamFrame::data(stream, data.to_vec(), fin))
            .map_err(|_| TransportError::Closed)
    }
}

async fn handle_ws(ws: WebSocket, ctx: Context) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<StreamFrame>();
    let transport = Arc::new(WsTransport {
        ids: Mutex::new(StreamIdAllocator::default()),
        tx: frame_tx,
    });
    let session = SignalingSession::from_context(&ctx, transport);
    let mut shutdown_rx = ctx.shutdown.subscribe();
    info!("WebSocket client connected (session {})", session.id());

    // Incoming from client → session
    let inbound = async {
        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("session {}: WebSocket error: {}", session.id(), e);
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            if !msg.is_binary() {
                debug!("session {}: ignoring non-binary WebSocket message", session.id());
                continue;
            }
            match StreamFrame::decode(msg.as_bytes()) {
                Ok(frame) if frame.reset => session.on_stream_reset(frame.stream_id).await,
                Ok(frame) => session.on_message(frame.stream_id, &frame.payload, frame.fin).await,
                Err(e) => warn!("session {}: dropping frame: {}", session.id(), e),
            }
        }
    };

    // Outgoing stream frames → client (BINARY frames)
    let outbound = stream! {
        while let Some(frame) = frame_rx.recv().await {
            yield Ok::<_, warp::Error>(WsMsg::binary(frame.encode()));
        }
    }
    .forward(ws_tx);

    let closed = async {
        select(Box::pin(inbound), Box::pin(outbound)).await;
    };
    let shutdown = async {
        let _ = shutdown_rx.recv().await;
        info!("session {}: shutdown requested", session.id());
    };

    // Run until the socket goes away or the server shuts down
    select(Box::pin(closed), Box::pin(shutdown)).await;
    session.cleanup().await;
    info!("WebSocket client disconnected (session {})", session.id());
}
