//! A scriptable stand-in for a JAUS Node Manager, speaking real TCP.

#![allow(dead_code)]

use std::time::Duration;

use iop_core::protocol::transport::{encode_frame, TRANSPORT_VERSION};
use iop_core::{Frame, FrameBuffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct FakeNodeManager {
    pub listener: TcpListener,
}

impl FakeNodeManager {
    pub async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn address(&self) -> String {
        self.listener.local_addr().unwrap().to_string()
    }

    /// Waits for the bridge to connect and says hello back.
    pub async fn accept(&self) -> NodeManagerPeer {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("bridge did not connect in time")
            .unwrap();
        let mut peer = NodeManagerPeer {
            stream,
            buffer: FrameBuffer::new(),
        };
        peer.stream.write_all(&[TRANSPORT_VERSION]).await.unwrap();
        peer
    }
}

/// One accepted connection from the bridge.
pub struct NodeManagerPeer {
    stream: TcpStream,
    buffer: FrameBuffer,
}

impl NodeManagerPeer {
    pub async fn next_frame(&mut self) -> Frame {
        timeout(WAIT, async {
            loop {
                if let Some(frame) = self.buffer.next_frame().unwrap() {
                    return frame;
                }
                let mut chunk = [0u8; 1024];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "bridge closed the connection");
                self.buffer.extend(&chunk[..n]);
            }
        })
        .await
        .expect("no frame from the bridge in time")
    }

    pub async fn send(&mut self, frame: &Frame) {
        let bytes = encode_frame(frame).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}
