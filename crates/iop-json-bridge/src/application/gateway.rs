//! Routing between client sessions and the Node Manager.
//!
//! The gateway owns the session set and translates in both directions.  It
//! has no sockets: the WebSocket side feeds it text and drains per-session
//! queues, the Node Manager side sits behind [`NodeManagerPort`].
//!
//! # Message flow
//!
//! ```text
//! client text ──handle_client_text──▶ translate ──▶ NodeManagerPort::send
//!                     │ (any failure)
//!                     ▼
//!              error frame to that session only
//!
//! Node Manager frame ──route_inbound──▶ translate ──▶ every subscribed session
//! link state change  ──notify_link_state──▶ every session
//! ```

use std::sync::{Arc, Mutex};

use iop_core::{Frame, FrameKind, JausAddress, MessageId, SchemaRegistry};
use tracing::{debug, error, info, warn};

use crate::application::ports::NodeManagerPort;
use crate::application::sessions::{SessionHandle, SessionId, SessionRegistry};
use crate::application::translator::{
    translate_client_message, translate_node_manager_frame, GatewayError,
};
use crate::domain::link::LinkState;
use crate::domain::messages::{ClientFrame, ClientMessage, ErrorKind, ServerFrame};

pub struct Gateway<P> {
    registry: Arc<SchemaRegistry>,
    sessions: SessionRegistry,
    port: P,
    local_address: JausAddress,
    link_state: Mutex<LinkState>,
}

impl<P: NodeManagerPort> Gateway<P> {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        port: P,
        local_address: JausAddress,
        queue_capacity: usize,
    ) -> Self {
        Self {
            registry,
            sessions: SessionRegistry::new(queue_capacity),
            port,
            local_address,
            link_state: Mutex::new(LinkState::Disconnected),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Last link state reported through [`notify_link_state`](Self::notify_link_state).
    pub fn link_state(&self) -> LinkState {
        *self.link_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new session.  Its first queued frame is the current link
    /// status, so a client knows at once whether sends can succeed.
    pub fn open_session(&self) -> SessionHandle {
        // Holding the state lock orders the greeting before any later
        // status broadcast.
        let state = self.link_state.lock().unwrap_or_else(|e| e.into_inner());
        let handle = self.sessions.register();
        self.send_to(handle.id, &ServerFrame::status(*state));
        drop(state);
        info!("session {} opened ({} active)", handle.id, self.sessions.len());
        handle
    }

    /// Removes a session and gives back every JAUS address it registered.
    pub async fn close_session(&self, id: SessionId) {
        let Some(addresses) = self.sessions.remove(id) else {
            return;
        };
        for address in addresses {
            if let Err(e) = self.port.release_address(address).await {
                debug!("session {id}: could not release {address}: {e}");
            }
        }
        info!("session {id} closed ({} active)", self.sessions.len());
    }

    /// Handles one text frame from a client.
    ///
    /// Every failure is answered with an error frame to this session only.
    pub async fn handle_client_text(&self, id: SessionId, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                let ref_id = e.ref_id;
                self.report(id, &GatewayError::from(e), ref_id);
                return;
            }
        };

        match frame {
            ClientFrame::Subscribe(filter) => {
                debug!("session {id}: subscribe {filter:?}");
                self.sessions.set_filter(id, filter.clone());
                self.send_to(id, &ServerFrame::Subscribed { subscribed: filter });
            }
            ClientFrame::Message(message) => {
                let ref_id = message.id;
                if let Err(e) = self.forward(id, &message).await {
                    self.report(id, &e, Some(ref_id));
                }
            }
        }
    }

    /// Binary WebSocket frames have no meaning in this protocol.
    pub fn handle_client_binary(&self, id: SessionId) {
        self.send_to(
            id,
            &ServerFrame::error(
                ErrorKind::MappingError,
                "binary frames are not supported; send JSON text frames",
                None,
            ),
        );
    }

    async fn forward(&self, id: SessionId, message: &ClientMessage) -> Result<(), GatewayError> {
        let frame = translate_client_message(&self.registry, message, self.local_address)?;

        if frame.source != self.local_address && self.sessions.claim_address(id, frame.source) {
            self.port.register_address(frame.source).await?;
        }

        debug!(
            "session {id}: message {:#06x} {} -> {} ({} bytes)",
            message.id,
            frame.source,
            frame.destination,
            frame.body().len()
        );
        self.port.send(frame).await?;
        Ok(())
    }

    /// Fans a frame from the Node Manager out to every interested session.
    ///
    /// There is no client to blame for a bad inbound frame, so failures are
    /// logged and the frame is dropped.
    pub fn route_inbound(&self, frame: &Frame) {
        match frame.kind {
            FrameKind::Data => {}
            FrameKind::Accept => {
                info!("Node Manager accepted {}", frame.source);
                return;
            }
            FrameKind::Cancel => {
                info!("Node Manager cancelled {}", frame.source);
                return;
            }
            FrameKind::Connect => {
                debug!("ignoring connect frame from {}", frame.source);
                return;
            }
        }

        let message_id: Option<MessageId> = frame.message_id();
        match translate_node_manager_frame(&self.registry, frame) {
            Ok(out) => match out.to_text() {
                Ok(text) => {
                    let delivered = self.sessions.broadcast(message_id, &text);
                    debug!(
                        "inbound {:#06x} from {} delivered to {delivered} session(s)",
                        message_id.unwrap_or_default(),
                        frame.source
                    );
                }
                Err(e) => error!("failed to serialise inbound frame: {e}"),
            },
            Err(e) => warn!(
                "dropping inbound frame {:#06x} from {}: {e}",
                message_id.unwrap_or_default(),
                frame.source
            ),
        }
    }

    /// Records the new link state and tells every session about it.
    pub fn notify_link_state(&self, state: LinkState) {
        let mut current = self.link_state.lock().unwrap_or_else(|e| e.into_inner());
        if *current == state {
            return;
        }
        *current = state;
        info!("Node Manager link {state}");
        match ServerFrame::status(state).to_text() {
            Ok(text) => {
                self.sessions.broadcast(None, &text);
            }
            Err(e) => error!("failed to serialise status frame: {e}"),
        }
    }

    fn report(&self, id: SessionId, err: &GatewayError, ref_id: Option<MessageId>) {
        debug!("session {id}: {err}");
        self.send_to(id, &ServerFrame::error(err.kind(), err.to_string(), ref_id));
    }

    fn send_to(&self, id: SessionId, frame: &ServerFrame) {
        match frame.to_text() {
            Ok(text) => {
                self.sessions.deliver(id, text);
            }
            Err(e) => error!("failed to serialise frame for session {id}: {e}"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{LinkError, MockNodeManagerPort};
    use mockall::predicate::eq;
    use serde_json::{json, Value as Json};

    const ARTIFACT: &str = r#"{
        "messages": [
            {"id": "2b00", "name": "QueryIdentification", "fields": [
                {"name": "queryType", "type": "u8"}
            ]},
            {"id": "4402", "name": "ReportSpeed", "fields": [
                {"name": "speed", "type": "u16"}
            ]}
        ]
    }"#;

    const LOCAL: JausAddress = JausAddress::new(127, 100, 1);

    fn gateway(port: MockNodeManagerPort) -> Gateway<MockNodeManagerPort> {
        let registry = Arc::new(SchemaRegistry::from_json_str(ARTIFACT).unwrap());
        Gateway::new(registry, port, LOCAL, 8)
    }

    fn next_json(handle: &mut SessionHandle) -> Json {
        serde_json::from_str(&handle.outbox.try_recv().unwrap()).unwrap()
    }

    /// Opens a session and discards its initial status frame.
    fn open(gw: &Gateway<MockNodeManagerPort>) -> SessionHandle {
        let mut handle = gw.open_session();
        assert_eq!(next_json(&mut handle), json!({"status": {"link": "disconnected"}}));
        handle
    }

    #[tokio::test]
    async fn test_valid_message_is_sent_without_reply() {
        // Arrange
        let mut port = MockNodeManagerPort::new();
        port.expect_send()
            .withf(|frame| frame.message_id() == Some(0x2b00) && frame.body() == [4u8] && frame.source == LOCAL)
            .times(1)
            .returning(|_| Ok(()));
        port.expect_register_address().never();
        let gw = gateway(port);
        let mut session = open(&gw);

        // Act
        gw.handle_client_text(session.id, r#"{"id":"2b00","fields":{"queryType":4}}"#).await;

        // Assert
        assert!(session.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_id_is_reported_to_sender() {
        let mut port = MockNodeManagerPort::new();
        port.expect_send().never();
        let gw = gateway(port);
        let mut session = open(&gw);

        gw.handle_client_text(session.id, r#"{"id":"0x1234","fields":{}}"#).await;

        let reply = next_json(&mut session);
        assert_eq!(reply["error"]["kind"], "SchemaNotFound");
        assert_eq!(reply["error"]["refId"], 0x1234);
    }

    #[tokio::test]
    async fn test_malformed_text_is_a_mapping_error() {
        let port = MockNodeManagerPort::new();
        let gw = gateway(port);
        let mut session = open(&gw);

        gw.handle_client_text(session.id, "{not json").await;

        let reply = next_json(&mut session);
        assert_eq!(reply["error"]["kind"], "MappingError");
        assert_eq!(reply["error"]["refId"], Json::Null);
    }

    #[tokio::test]
    async fn test_disconnected_link_is_reported() {
        let mut port = MockNodeManagerPort::new();
        port.expect_send().returning(|_| Err(LinkError::Disconnected));
        let gw = gateway(port);
        let mut session = open(&gw);

        gw.handle_client_text(session.id, r#"{"id":11008,"fields":{"queryType":1}}"#).await;

        let reply = next_json(&mut session);
        assert_eq!(reply["error"]["kind"], "LinkDisconnected");
        assert_eq!(reply["error"]["refId"], 0x2b00);
    }

    #[tokio::test]
    async fn test_foreign_source_is_registered_once_and_released_on_close() {
        // Arrange
        let other = JausAddress::new(127, 100, 9);
        let mut port = MockNodeManagerPort::new();
        port.expect_register_address()
            .with(eq(other))
            .times(1)
            .returning(|_| Ok(()));
        port.expect_send().times(2).returning(|_| Ok(()));
        port.expect_release_address()
            .with(eq(other))
            .times(1)
            .returning(|_| Ok(()));
        let gw = gateway(port);
        let session = open(&gw);
        let text = r#"{"id":"2b00","fields":{"queryType":1},"src":"127.100.9"}"#;

        // Act
        gw.handle_client_text(session.id, text).await;
        gw.handle_client_text(session.id, text).await;
        gw.close_session(session.id).await;

        // Assert – expectations are verified when the mock drops
        assert!(gw.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_is_acknowledged_and_filters_inbound() {
        // Arrange
        let gw = gateway(MockNodeManagerPort::new());
        let mut session = open(&gw);

        // Act
        gw.handle_client_text(session.id, r#"{"subscribe":["4402"]}"#).await;
        let ack = next_json(&mut session);
        let addr = JausAddress::new(1, 1, 1);
        gw.route_inbound(&Frame::data(0x2b00, &[1], addr, LOCAL));
        gw.route_inbound(&Frame::data(0x4402, &[0x10, 0x00], addr, LOCAL));

        // Assert
        assert_eq!(ack, json!({"subscribed": [0x4402]}));
        let delivered = next_json(&mut session);
        assert_eq!(delivered["id"], 0x4402);
        assert_eq!(delivered["fields"], json!({"speed": 16}));
        assert!(session.outbox.try_recv().is_err());
    }

    #[test]
    fn test_bad_inbound_frame_is_dropped() {
        let gw = gateway(MockNodeManagerPort::new());
        let mut session = open(&gw);
        let addr = JausAddress::new(1, 1, 1);

        gw.route_inbound(&Frame::data(0x4402, &[0x10], addr, LOCAL));
        gw.route_inbound(&Frame::data(0x7777, &[], addr, LOCAL));
        gw.route_inbound(&Frame::command(FrameKind::Accept, addr));

        assert!(session.outbox.try_recv().is_err());
    }

    #[test]
    fn test_link_state_changes_are_broadcast_once() {
        let gw = gateway(MockNodeManagerPort::new());
        let mut a = open(&gw);
        let mut b = open(&gw);

        gw.notify_link_state(LinkState::Connected);
        gw.notify_link_state(LinkState::Connected);

        for session in [&mut a, &mut b] {
            assert_eq!(next_json(session), json!({"status": {"link": "connected"}}));
            assert!(session.outbox.try_recv().is_err());
        }
        assert_eq!(gw.link_state(), LinkState::Connected);
    }

    #[test]
    fn test_binary_frame_is_rejected() {
        let gw = gateway(MockNodeManagerPort::new());
        let mut session = open(&gw);

        gw.handle_client_binary(session.id);

        assert_eq!(next_json(&mut session)["error"]["kind"], "MappingError");
    }
}
