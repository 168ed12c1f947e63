//! WebSocket server: accept loop, router task and per-session tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Starting the Node Manager link and a router task that hands every
//!    [`LinkEvent`] to the [`Gateway`].
//! 3. Accepting WebSocket clients and running two tasks per session:
//!    - **reader**: client text frames → [`Gateway::handle_client_text`];
//!    - **writer**: the session's outbound queue → WebSocket, each write
//!      bounded by the configured write timeout.
//! 4. Stopping when the shared `running` flag is cleared.
//!
//! When the writer ends first the reader is asked to stop rather than
//! aborted: a client frame already being forwarded runs to completion, so
//! an address claim is never left without its registration.
//!
//! # Slow consumers
//!
//! The writer also waits on the session's eviction signal.  When it fires
//! (queue overflow in the gateway, or a write that timed out here) the
//! writer makes one best-effort attempt to send a `SlowConsumer` error
//! frame, closes the socket, and the session is torn down.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use iop_core::SchemaRegistry;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::application::gateway::Gateway;
use crate::application::ports::NodeManagerPort;
use crate::application::sessions::{SessionHandle, SessionId};
use crate::domain::config::BridgeConfig;
use crate::domain::messages::{ErrorKind, ServerFrame};
use crate::infrastructure::node_manager::{spawn_link, LinkEvent, LinkHandle};

type BridgeGateway = Gateway<LinkHandle>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// How long shutdown waits for the link task to say goodbye.
const LINK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `config.ws_bind_addr` and serves clients until `running` is `false`.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(
    config: BridgeConfig,
    registry: Arc<SchemaRegistry>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.ws_bind_addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", config.ws_bind_addr))?;

    info!(
        "iop-json-bridge listening on ws://{} (Node Manager {}, JAUS id {})",
        config.ws_bind_addr, config.node_manager_addr, config.local_address
    );

    serve_listener(listener, config, registry, running).await
}

/// Serves clients on an already-bound listener.
///
/// Tests bind port 0 themselves and pass the listener in, so they know the
/// address before the server starts.
pub async fn serve_listener(
    listener: TcpListener,
    config: BridgeConfig,
    registry: Arc<SchemaRegistry>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let (link, mut events, link_task) = spawn_link(&config, Arc::clone(&running));
    let gateway = Arc::new(Gateway::new(
        registry,
        link,
        config.local_address,
        config.session_queue_capacity,
    ));

    let router_gateway = Arc::clone(&gateway);
    let router = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Frame(frame) => router_gateway.route_inbound(&frame),
                LinkEvent::State(state) => router_gateway.notify_link_state(state),
            }
        }
        debug!("router task finished");
    });

    let write_timeout = config.write_timeout;
    loop {
        if !running.load(Ordering::SeqCst) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move {
                    if let Err(e) = run_session(stream, peer_addr, gateway, write_timeout).await {
                        warn!("session from {peer_addr} ended with error: {e:#}");
                    }
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }

    // The link task watches `running` and exits on its own; the router ends
    // when the link drops its event sender.
    if timeout(LINK_SHUTDOWN_GRACE, link_task).await.is_err() {
        warn!("Node Manager link did not stop within {LINK_SHUTDOWN_GRACE:?}");
    }
    router.abort();
    Ok(())
}

// ── Per-session handling ──────────────────────────────────────────────────────

async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    gateway: Arc<BridgeGateway>,
    write_timeout: Duration,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake with {peer_addr} failed"))?;
    let (ws_tx, ws_rx) = ws_stream.split();

    let SessionHandle {
        id,
        outbox,
        evicted,
    } = gateway.open_session();
    info!("client {peer_addr} connected as session {id}");

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        outbox,
        evicted,
        Arc::clone(&gateway),
        id,
        write_timeout,
    ));

    let stop = Arc::new(Notify::new());
    let mut reader = tokio::spawn(read_loop(
        ws_rx,
        Arc::clone(&gateway),
        id,
        Arc::clone(&stop),
    ));

    tokio::select! {
        _ = &mut writer => {
            stop.notify_one();
            let _ = (&mut reader).await;
        }
        _ = &mut reader => writer.abort(),
    }

    gateway.close_session(id).await;
    info!("client {peer_addr} (session {id}) disconnected");
    Ok(())
}

/// Feeds client frames to the gateway until the stream ends or `stop` fires.
///
/// `stop` is only observed between frames.
async fn read_loop<S, P>(mut ws_rx: S, gateway: Arc<Gateway<P>>, id: SessionId, stop: Arc<Notify>)
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    P: NodeManagerPort,
{
    loop {
        let message = tokio::select! {
            _ = stop.notified() => break,
            next = ws_rx.next() => match next {
                Some(message) => message,
                None => break,
            },
        };
        match message {
            Ok(WsMessage::Text(text)) => gateway.handle_client_text(id, &text).await,
            Ok(WsMessage::Binary(_)) => gateway.handle_client_binary(id),
            Ok(WsMessage::Close(_)) => break,
            // tungstenite answers pings itself.
            Ok(_) => {}
            Err(e) => {
                debug!("session {id}: WebSocket read error: {e}");
                break;
            }
        }
    }
}

async fn write_loop(
    mut ws_tx: WsSink,
    mut outbox: tokio::sync::mpsc::Receiver<String>,
    evicted: Arc<Notify>,
    gateway: Arc<BridgeGateway>,
    id: SessionId,
    write_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;

            _ = evicted.notified() => {
                send_slow_consumer_notice(&mut ws_tx, write_timeout).await;
                break;
            }

            next = outbox.recv() => {
                let Some(text) = next else { break };
                match timeout(write_timeout, ws_tx.send(WsMessage::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("session {id}: WebSocket write failed: {e}");
                        break;
                    }
                    Err(_) => {
                        warn!("session {id}: write stalled for {write_timeout:?}");
                        gateway.sessions().evict(id);
                        send_slow_consumer_notice(&mut ws_tx, write_timeout).await;
                        break;
                    }
                }
            }
        }
    }
    let _ = timeout(write_timeout, ws_tx.close()).await;
}

async fn send_slow_consumer_notice(ws_tx: &mut WsSink, write_timeout: Duration) {
    let frame = ServerFrame::error(
        ErrorKind::SlowConsumer,
        "outbound queue overflowed; closing session",
        None,
    );
    if let Ok(text) = frame.to_text() {
        let _ = timeout(write_timeout, ws_tx.send(WsMessage::Text(text))).await;
    }
}
