// src/main.rs

mod engine;
mod signal_ws;
use dotenv::dotenv;
use std::{error::Error, net::SocketAddr, sync::Arc};
use log::{info, warn, error};
use warp::Filter;
use ball_signal_lib::{
    Config,                   // BALL_SIGNAL_* settings
    Context,                  // engine + shutdown broadcast
};
use engine::WebRtcEngine;

/* RUST_LOG=ball_signal_lib=debug,ball_signal_server=info \
cargo run -p ball_signal-server */

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    // ──────── ① Load .env if there is one ────────
    dotenv().ok();

    // initialize logger and panic hook
    env_logger::init();
    std::panic::set_hook(Box::new(|info| {
        error!("Thread panic: {:?}", info);
    }));

    // ──────── ② Settings from BALL_SIGNAL_* ────────
    let config = Config::from_env().map_err(|e| format!("Invalid configuration: {}", e))?;
    let engine = WebRtcEngine::new(None).map_err(|e| format!("Failed to build WebRTC API: {}", e))?;
    if !engine.has_encoder() {
        warn!("No video encoder: clients connect and receive a track, but the ball is not visible");
    }
    let ctx = Context::new(Arc::new(engine), config.session.clone());

    // ──────── 1) Signaling WebSocket ────────
    let ws_addr = SocketAddr::new(config.host, config.ws_port);
    let ws_routes = signal_ws::ws_routes(ctx.clone());
    let mut ws_shutdown = ctx.shutdown.subscribe();
    let (_, ws_server) = warp::serve(ws_routes)
        .try_bind_with_graceful_shutdown(ws_addr, async move {
            let _ = ws_shutdown.recv().await;
        })
        .map_err(|e| format!("Failed to bind {}: {}", ws_addr, e))?;
    let ws_server = tokio::spawn(ws_server);

    // ──────── 2) HTTP (health + static) ────────
    let health       = warp::path!("health").map(|| "OK");
    let static_files = warp::path("static")
        .and(warp::fs::dir(config.static_dir.clone()))
        .with(warp::reply::with::header("cache-control", "no-cache, no-store"));
    let routes       = health.or(static_files);

    let http_addr = SocketAddr::new(config.host, config.http_port);
    let mut http_shutdown = ctx.shutdown.subscribe();
    let (_, http_server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(http_addr, async move {
            let _ = http_shutdown.recv().await;
        })
        .map_err(|e| format!("Failed to bind {}: {}", http_addr, e))?;

    info!("HTTP  : {} (health + static files from {})", http_addr, config.static_dir);
    info!("WS    : {}/connection", ws_addr);
    info!(
        "Video : {}x{} @ {} fps, ICE servers {:?}",
        config.session.producer.width,
        config.session.producer.height,
        config.session.producer.fps,
        config.session.ice_servers
    );

    // ──────── 3) Ctrl-C → every session cleans up ────────
    let shutdown_ctx = ctx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let listeners = shutdown_ctx.trigger_shutdown();
                info!("Shutdown requested, notified {} listeners", listeners);
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    http_server.await;
    if let Err(e) = ws_server.await {
        error!("WebSocket server task failed: {}", e);
    }
    info!("Server stopped");
    Ok(())
}
