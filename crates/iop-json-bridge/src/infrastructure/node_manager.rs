//! The single TCP connection to the JAUS Node Manager.
//!
//! One background task owns the socket, the frame buffer, the address
//! registrations and the connection state.  Everything else talks to it
//! through channels:
//!
//! ```text
//!   LinkHandle ──LinkCommand──▶ ┌───────────┐ ──bytes──▶ Node Manager
//!   (cloneable)                 │ link task │
//!   watch<LinkState> ◀───────── └───────────┘ ◀──bytes── Node Manager
//!                                     │
//!                                     └──LinkEvent──▶ router task ──▶ Gateway
//! ```
//!
//! # Connection lifecycle
//!
//! `Disconnected → Connecting → Connected`, and back to `Disconnected` on
//! EOF, any I/O error, a malformed frame, or shutdown.  Reconnect attempts
//! are spaced by an exponential [`Backoff`] that resets after a successful
//! connect.  On every (re)connect the task writes the transport version
//! byte, then a `connect` frame for the bridge's own address and for every
//! address sessions have registered.
//!
//! # For beginners: why a task instead of a shared `TcpStream`?
//!
//! Many sessions send concurrently, but bytes of two frames must never
//! interleave on the wire.  Funnelling every write through one task's
//! command queue serialises them without a lock held across `.await`.
//! Each queued data frame carries a oneshot that the task answers after the
//! write, so a frame caught by a disconnect is reported instead of lost.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use iop_core::protocol::transport::{encode_frame, TRANSPORT_VERSION};
use iop_core::{Frame, FrameBuffer, FrameKind, JausAddress, SequenceCounter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};

use crate::application::ports::{LinkError, NodeManagerPort};
use crate::domain::config::BridgeConfig;
use crate::domain::link::LinkState;

const COMMAND_QUEUE: usize = 1024;
const EVENT_QUEUE: usize = 1024;
const READ_CHUNK: usize = 4096;

/// How often blocking loops re-check the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Outcome of one queued data frame, reported back by the link task.
type SendAck = oneshot::Sender<Result<(), LinkError>>;

#[derive(Debug)]
pub enum LinkCommand {
    /// `done` resolves once the frame is on the socket, or with
    /// [`LinkError::Disconnected`] if the link dropped first.
    Send { frame: Frame, done: SendAck },
    Register(JausAddress),
    Release(JausAddress),
}

/// What the link reports upward.  The stream outlives reconnects.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(Frame),
    State(LinkState),
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap, cloneable front-end of the link task.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<LinkCommand>,
    state: watch::Receiver<LinkState>,
}

impl LinkHandle {
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    async fn submit(&self, command: LinkCommand) -> Result<(), LinkError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LinkError::Closed)
    }
}

#[async_trait]
impl NodeManagerPort for LinkHandle {
    async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if self.state() != LinkState::Connected {
            return Err(LinkError::Disconnected);
        }
        let (done, written) = oneshot::channel();
        self.submit(LinkCommand::Send { frame, done }).await?;
        // A dropped ack means the link task stopped with the frame queued.
        written.await.unwrap_or(Err(LinkError::Closed))
    }

    // Registrations are accepted while disconnected; the task replays them
    // on the next connect.
    async fn register_address(&self, address: JausAddress) -> Result<(), LinkError> {
        self.submit(LinkCommand::Register(address)).await
    }

    async fn release_address(&self, address: JausAddress) -> Result<(), LinkError> {
        self.submit(LinkCommand::Release(address)).await
    }
}

// ── Backoff ───────────────────────────────────────────────────────────────────

/// Exponential reconnect delay: `initial`, `2 × initial`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

// ── Link task ─────────────────────────────────────────────────────────────────

/// Starts the link task.
///
/// The task runs until `running` is cleared or every [`LinkHandle`] is
/// dropped.
pub fn spawn_link(
    config: &BridgeConfig,
    running: Arc<AtomicBool>,
) -> (LinkHandle, mpsc::Receiver<LinkEvent>, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

    let link = Link {
        address: config.node_manager_addr.clone(),
        local_address: config.local_address,
        connect_timeout: config.connect_timeout,
        backoff: Backoff::new(config.backoff_initial, config.backoff_max),
        running,
        commands: command_rx,
        events: event_tx,
        state: state_tx,
        registrations: BTreeMap::new(),
        sequence: SequenceCounter::new(),
    };
    let task = tokio::spawn(link.run());

    let handle = LinkHandle {
        commands: command_tx,
        state: state_rx,
    };
    (handle, event_rx, task)
}

/// Why a connection ended without an I/O error.
enum ConnectionEnd {
    Eof,
    Shutdown,
}

struct Link {
    address: String,
    local_address: JausAddress,
    connect_timeout: Duration,
    backoff: Backoff,
    running: Arc<AtomicBool>,
    commands: mpsc::Receiver<LinkCommand>,
    events: mpsc::Sender<LinkEvent>,
    state: watch::Sender<LinkState>,
    /// Session-registered addresses and how many sessions use each.
    registrations: BTreeMap<JausAddress, usize>,
    sequence: SequenceCounter,
}

impl Link {
    async fn run(mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.set_state(LinkState::Connecting).await;

            match self.connect().await {
                Ok(stream) => {
                    self.backoff.reset();
                    info!("connected to Node Manager at {}", self.address);
                    match self.serve(stream).await {
                        Ok(ConnectionEnd::Shutdown) => break,
                        Ok(ConnectionEnd::Eof) => warn!("Node Manager closed the connection"),
                        Err(e) => warn!("Node Manager connection lost: {e:#}"),
                    }
                }
                Err(e) => warn!("{e:#}"),
            }

            self.set_state(LinkState::Disconnected).await;
            let delay = self.backoff.next_delay();
            info!("reconnecting to Node Manager in {delay:?}");
            if !self.wait_offline(delay).await {
                break;
            }
        }

        self.set_state(LinkState::Disconnected).await;
        info!("Node Manager link stopped");
    }

    async fn connect(&self) -> anyhow::Result<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(self.address.as_str()))
            .await
            .map_err(|_| {
                anyhow!(
                    "connecting to Node Manager at {} timed out after {:?}",
                    self.address,
                    self.connect_timeout
                )
            })?
            .with_context(|| format!("failed to connect to Node Manager at {}", self.address))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {e}");
        }
        Ok(stream)
    }

    /// Runs one connection until it ends.
    async fn serve(&mut self, stream: TcpStream) -> anyhow::Result<ConnectionEnd> {
        let (mut reader, mut writer) = stream.into_split();

        writer
            .write_all(&[TRANSPORT_VERSION])
            .await
            .context("failed to send transport version")?;
        let mut announce = vec![self.local_address];
        announce.extend(self.registrations.keys().copied());
        for address in announce {
            self.write_frame(&mut writer, Frame::command(FrameKind::Connect, address))
                .await?;
        }
        self.set_state(LinkState::Connected).await;

        let mut buffer = FrameBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut tick = interval(SHUTDOWN_POLL);

        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let n = read.context("read from Node Manager failed")?;
                    if n == 0 {
                        return Ok(ConnectionEnd::Eof);
                    }
                    buffer.extend(&chunk[..n]);
                    while let Some(frame) = buffer
                        .next_frame()
                        .context("malformed frame from Node Manager")?
                    {
                        debug!(
                            "<- {:?} frame {} -> {} ({} payload bytes)",
                            frame.kind,
                            frame.source,
                            frame.destination,
                            frame.payload.len()
                        );
                        if self.events.send(LinkEvent::Frame(frame)).await.is_err() {
                            return Ok(ConnectionEnd::Shutdown);
                        }
                    }
                }

                command = self.commands.recv() => match command {
                    Some(command) => self.apply_online(command, &mut writer).await?,
                    None => return Ok(ConnectionEnd::Shutdown),
                },

                _ = tick.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        return Ok(ConnectionEnd::Shutdown);
                    }
                }
            }
        }
    }

    async fn apply_online(
        &mut self,
        command: LinkCommand,
        writer: &mut OwnedWriteHalf,
    ) -> anyhow::Result<()> {
        match command {
            LinkCommand::Send { frame, done } => {
                let written = self.write_frame(writer, frame).await;
                let _ = done.send(if written.is_ok() {
                    Ok(())
                } else {
                    Err(LinkError::Disconnected)
                });
                written
            }
            LinkCommand::Register(address) => {
                if self.register(address) {
                    self.write_frame(writer, Frame::command(FrameKind::Connect, address))
                        .await?;
                }
                Ok(())
            }
            LinkCommand::Release(address) => {
                if self.release(address) {
                    self.write_frame(writer, Frame::command(FrameKind::Cancel, address))
                        .await?;
                }
                Ok(())
            }
        }
    }

    fn apply_offline(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Send { frame, done } => {
                debug!(
                    "link down; dropping frame {:?} for {}",
                    frame.message_id(),
                    frame.destination
                );
                let _ = done.send(Err(LinkError::Disconnected));
            }
            LinkCommand::Register(address) => {
                self.register(address);
            }
            LinkCommand::Release(address) => {
                self.release(address);
            }
        }
    }

    /// Waits out a backoff delay while still absorbing commands.
    ///
    /// Returns `false` when the link should stop instead of reconnecting.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let pause = sleep(delay);
        tokio::pin!(pause);
        let mut tick = interval(SHUTDOWN_POLL);

        loop {
            tokio::select! {
                _ = &mut pause => return self.running.load(Ordering::SeqCst),
                command = self.commands.recv() => match command {
                    Some(command) => self.apply_offline(command),
                    None => return false,
                },
                _ = tick.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        return false;
                    }
                }
            }
        }
    }

    /// Returns `true` when `address` gained its first user.
    fn register(&mut self, address: JausAddress) -> bool {
        let users = self.registrations.entry(address).or_insert(0);
        *users += 1;
        *users == 1
    }

    /// Returns `true` when `address` lost its last user.
    fn release(&mut self, address: JausAddress) -> bool {
        match self.registrations.entry(address) {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => {
                debug!("release of unregistered address {address}");
                false
            }
        }
    }

    async fn write_frame(&self, writer: &mut OwnedWriteHalf, mut frame: Frame) -> anyhow::Result<()> {
        frame.sequence = self.sequence.next();
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("dropping outbound frame to {}: {e}", frame.destination);
                return Ok(());
            }
        };
        writer
            .write_all(&bytes)
            .await
            .context("write to Node Manager failed")?;
        debug!(
            "-> {:?} frame {} -> {} seq {}",
            frame.kind, frame.source, frame.destination, frame.sequence
        );
        Ok(())
    }

    async fn set_state(&self, state: LinkState) {
        if *self.state.borrow() == state {
            return;
        }
        self.state.send_replace(state);
        if self.events.send(LinkEvent::State(state)).await.is_err() {
            debug!("no listener for link state {state}");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_link() -> (Link, mpsc::Sender<LinkCommand>) {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (event_tx, _event_rx) = mpsc::channel(4);
        let (state_tx, _state_rx) = watch::channel(LinkState::Disconnected);
        let link = Link {
            address: "127.0.0.1:0".to_string(),
            local_address: JausAddress::new(1, 1, 1),
            connect_timeout: Duration::from_millis(50),
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40)),
            running: Arc::new(AtomicBool::new(true)),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            registrations: BTreeMap::new(),
            sequence: SequenceCounter::new(),
        };
        (link, command_tx)
    }

    #[test]
    fn test_backoff_doubles_up_to_max_and_resets() {
        // Arrange
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));

        // Act
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        backoff.reset();

        // Assert
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_max_below_initial_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_registrations_are_reference_counted() {
        let (mut link, _commands) = detached_link();
        let addr = JausAddress::new(9, 9, 9);

        assert!(link.register(addr));
        assert!(!link.register(addr));
        assert!(!link.release(addr));
        assert!(link.release(addr));
        assert!(!link.release(addr));
        assert!(link.registrations.is_empty());
    }

    #[test]
    fn test_offline_commands_update_registrations_only() {
        let (mut link, _commands) = detached_link();
        let addr = JausAddress::new(2, 2, 2);

        let (done, _written) = oneshot::channel();

        link.apply_offline(LinkCommand::Register(addr));
        link.apply_offline(LinkCommand::Send {
            frame: Frame::data(1, &[], addr, addr),
            done,
        });

        assert_eq!(link.registrations.get(&addr), Some(&1));
        assert_eq!(link.sequence.current(), 0);
    }

    #[tokio::test]
    async fn test_send_queued_before_link_drop_reports_disconnected() {
        // Arrange: the handle still sees Connected while the task has
        // already lost the socket.
        let (mut link, command_tx) = detached_link();
        let (_state_tx, state_rx) = watch::channel(LinkState::Connected);
        let handle = LinkHandle {
            commands: command_tx,
            state: state_rx,
        };
        let addr = JausAddress::new(4, 4, 4);
        let pending = tokio::spawn(async move { handle.send(Frame::data(1, &[], addr, addr)).await });

        // Act
        let command = link.commands.recv().await.unwrap();
        link.apply_offline(command);
        let sent = pending.await.unwrap();

        // Assert
        assert_eq!(sent, Err(LinkError::Disconnected));
    }

    #[tokio::test]
    async fn test_send_reports_closed_when_task_stops_with_frame_queued() {
        // Arrange
        let (link, command_tx) = detached_link();
        let (_state_tx, state_rx) = watch::channel(LinkState::Connected);
        let handle = LinkHandle {
            commands: command_tx,
            state: state_rx,
        };
        let addr = JausAddress::new(4, 4, 4);
        let pending = tokio::spawn(async move { handle.send(Frame::data(1, &[], addr, addr)).await });
        tokio::task::yield_now().await;

        // Act: the task goes away without answering.
        drop(link);
        let sent = pending.await.unwrap();

        // Assert
        assert_eq!(sent, Err(LinkError::Closed));
    }

    #[tokio::test]
    async fn test_handle_send_fails_while_disconnected() {
        // Arrange
        let (command_tx, mut command_rx) = mpsc::channel(4);
        let (_state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let handle = LinkHandle {
            commands: command_tx,
            state: state_rx,
        };
        let addr = JausAddress::new(3, 3, 3);

        // Act
        let sent = handle.send(Frame::data(1, &[], addr, addr)).await;
        let registered = handle.register_address(addr).await;

        // Assert – registrations are still queued for the next connect
        assert_eq!(sent, Err(LinkError::Disconnected));
        assert_eq!(registered, Ok(()));
        assert!(matches!(command_rx.try_recv(), Ok(LinkCommand::Register(a)) if a == addr));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_link() {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (_state_tx, state_rx) = watch::channel(LinkState::Connected);
        let handle = LinkHandle {
            commands: command_tx,
            state: state_rx,
        };
        drop(command_rx);

        let addr = JausAddress::new(3, 3, 3);
        assert_eq!(handle.send(Frame::data(1, &[], addr, addr)).await, Err(LinkError::Closed));
    }

    #[tokio::test]
    async fn test_wait_offline_stops_on_shutdown() {
        let (mut link, _commands) = detached_link();
        link.running.store(false, Ordering::SeqCst);

        assert!(!link.wait_offline(Duration::from_secs(30)).await);
    }
}
