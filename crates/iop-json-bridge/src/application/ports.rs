//! The seam between routing logic and the Node Manager connection.
//!
//! The gateway only needs three things from the Node Manager side, so they
//! live behind a trait.  Production code passes a
//! [`LinkHandle`](crate::infrastructure::node_manager::LinkHandle); tests
//! pass a mock and never open a socket.

use async_trait::async_trait;
use iop_core::{Frame, JausAddress};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Node Manager link is not connected")]
    Disconnected,

    #[error("Node Manager link has shut down")]
    Closed,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeManagerPort: Send + Sync + 'static {
    /// Sends a data frame to the Node Manager.  Resolves once the frame is
    /// written, or with [`LinkError::Disconnected`] if the link drops while
    /// the frame is still queued.
    async fn send(&self, frame: Frame) -> Result<(), LinkError>;

    /// Takes one reference on `address`; the first reference announces it.
    async fn register_address(&self, address: JausAddress) -> Result<(), LinkError>;

    /// Drops one reference on `address`; the last reference withdraws it.
    async fn release_address(&self, address: JausAddress) -> Result<(), LinkError>;
}
