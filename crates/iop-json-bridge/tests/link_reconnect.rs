//! The Node Manager link against a fake Node Manager over real TCP.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iop_core::{Frame, FrameKind, JausAddress};
use iop_json_bridge::application::NodeManagerPort;
use iop_json_bridge::domain::{BridgeConfig, LinkState};
use iop_json_bridge::infrastructure::{spawn_link, LinkEvent};
use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;

use support::{FakeNodeManager, WAIT};

const LOCAL: JausAddress = JausAddress::new(127, 100, 1);

fn config_for(node_manager: &FakeNodeManager) -> BridgeConfig {
    BridgeConfig {
        node_manager_addr: node_manager.address(),
        local_address: LOCAL,
        connect_timeout: Duration::from_millis(500),
        // Long enough that a test can observe the disconnected state before
        // the link has reconnected.
        backoff_initial: Duration::from_millis(200),
        backoff_max: Duration::from_millis(400),
        ..BridgeConfig::default()
    }
}

async fn wait_for_state(events: &mut Receiver<LinkEvent>, wanted: LinkState) {
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if event == LinkEvent::State(wanted) {
                return;
            }
        }
        panic!("event stream ended before {wanted}");
    })
    .await
    .unwrap_or_else(|_| panic!("link never reached {wanted}"));
}

async fn next_frame_event(events: &mut Receiver<LinkEvent>) -> Frame {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(LinkEvent::Frame(frame)) => return frame,
                Some(LinkEvent::State(_)) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("no frame event in time")
}

#[tokio::test]
async fn test_link_registers_sends_receives_and_reconnects() {
    // Arrange
    let node_manager = FakeNodeManager::bind().await;
    let running = Arc::new(AtomicBool::new(true));
    let (link, mut events, task) = spawn_link(&config_for(&node_manager), Arc::clone(&running));

    // ── First connection ──────────────────────────────────────────────────
    let mut peer = node_manager.accept().await;
    let hello = peer.next_frame().await;
    assert_eq!(hello.kind, FrameKind::Connect);
    assert_eq!(hello.source, LOCAL);
    wait_for_state(&mut events, LinkState::Connected).await;
    assert_eq!(link.state(), LinkState::Connected);

    // A session-owned address is announced once, however many users it has.
    let extra = JausAddress::new(127, 100, 7);
    link.register_address(extra).await.unwrap();
    link.register_address(extra).await.unwrap();
    let connect = peer.next_frame().await;
    assert_eq!((connect.kind, connect.source), (FrameKind::Connect, extra));

    // Outbound data frames carry increasing sequence numbers.
    let dst = JausAddress::new(127, 1, 5);
    link.send(Frame::data(0x2b00, &[1], LOCAL, dst)).await.unwrap();
    link.send(Frame::data(0x2b00, &[2], LOCAL, dst)).await.unwrap();
    let first = peer.next_frame().await;
    let second = peer.next_frame().await;
    assert_eq!(first.message_id(), Some(0x2b00));
    assert_eq!(first.body(), &[1]);
    assert_eq!(first.destination, dst);
    assert_eq!(second.sequence, first.sequence.wrapping_add(1));

    // Inbound frames surface as events, even several in one write.
    let mut burst = Vec::new();
    for speed in [10u8, 20] {
        burst.extend(
            iop_core::protocol::transport::encode_frame(&Frame::data(0x4402, &[speed, 0], dst, LOCAL))
                .unwrap(),
        );
    }
    peer.send_raw(&burst).await;
    assert_eq!(next_frame_event(&mut events).await.body(), &[10, 0]);
    assert_eq!(next_frame_event(&mut events).await.body(), &[20, 0]);

    // ── Node Manager goes away ────────────────────────────────────────────
    drop(peer);
    wait_for_state(&mut events, LinkState::Disconnected).await;
    assert_eq!(
        link.send(Frame::data(0x2b00, &[3], LOCAL, dst)).await,
        Err(iop_json_bridge::application::LinkError::Disconnected)
    );

    // ── Second connection: every registration is replayed ────────────────
    let mut peer = node_manager.accept().await;
    let replay = [peer.next_frame().await, peer.next_frame().await];
    assert!(replay.iter().all(|f| f.kind == FrameKind::Connect));
    assert_eq!(replay[0].source, LOCAL);
    assert_eq!(replay[1].source, extra);
    wait_for_state(&mut events, LinkState::Connected).await;

    // Only the last release withdraws the address.
    link.release_address(extra).await.unwrap();
    link.release_address(extra).await.unwrap();
    link.send(Frame::data(0x2b00, &[4], LOCAL, dst)).await.unwrap();
    let cancel = peer.next_frame().await;
    assert_eq!((cancel.kind, cancel.source), (FrameKind::Cancel, extra));
    assert_eq!(peer.next_frame().await.body(), &[4]);

    // ── Shutdown ──────────────────────────────────────────────────────────
    running.store(false, Ordering::SeqCst);
    timeout(WAIT, task)
        .await
        .expect("link task must stop after shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_malformed_frame_drops_the_connection() {
    // Arrange
    let node_manager = FakeNodeManager::bind().await;
    let running = Arc::new(AtomicBool::new(true));
    let (_link, mut events, _task) = spawn_link(&config_for(&node_manager), Arc::clone(&running));
    let mut peer = node_manager.accept().await;
    wait_for_state(&mut events, LinkState::Connected).await;

    // Act – header compression bits set: not resynchronisable
    peer.send_raw(&[0x40, 14, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).await;

    // Assert – the link drops and comes back on a fresh connection
    wait_for_state(&mut events, LinkState::Disconnected).await;
    let mut again = node_manager.accept().await;
    assert_eq!(again.next_frame().await.source, LOCAL);
    wait_for_state(&mut events, LinkState::Connected).await;

    running.store(false, Ordering::SeqCst);
}

#[tokio::test]
async fn test_unreachable_node_manager_keeps_retrying() {
    // Arrange – bind, note the address, then close the listener
    let address = {
        let node_manager = FakeNodeManager::bind().await;
        node_manager.address()
    };
    let config = BridgeConfig {
        node_manager_addr: address.clone(),
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(20),
        ..BridgeConfig::default()
    };
    let running = Arc::new(AtomicBool::new(true));
    let (link, mut events, task) = spawn_link(&config, Arc::clone(&running));

    // Act – two full connect attempts
    for _ in 0..2 {
        wait_for_state(&mut events, LinkState::Connecting).await;
        wait_for_state(&mut events, LinkState::Disconnected).await;
    }

    // Assert
    assert_ne!(link.state(), LinkState::Connected);
    running.store(false, Ordering::SeqCst);
    timeout(WAIT, task).await.expect("link task must stop").unwrap();
}
