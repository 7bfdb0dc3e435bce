//! Synchronizes mesh membership with the node's proxy.
//!
//! The proxy terminates mesh traffic on behalf of every meshed workload on the node, so it must
//! learn about each workload (and receive a handle to its network namespace) when the workload
//! joins, and be told when it leaves. Updates are acknowledged: a join is only complete once the
//! proxy has confirmed it.
//!
//! The transport to the proxy is abstracted by [`Listener`] and [`Connection`]. When a proxy
//! connects, it is first sent a snapshot of every workload with a known namespace, followed by
//! [`Message::SnapshotSent`]; queued updates are delivered after that.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod server;

pub use self::server::ProxyServer;

use linkerd_node_agent_core::{CancellationToken, Netns, Uid, Workload};
use std::{sync::Arc, time::Duration};

/// Notifies the node's proxy of workloads joining and leaving the mesh.
#[async_trait::async_trait]
pub trait ProxySync: Send + Sync + 'static {
    /// Serves proxy connections until shutdown is signaled or the server is closed.
    async fn run(&self, shutdown: drain::Watch);

    /// Stops serving. Pending and future notifications fail with [`Error::Closed`].
    fn close(&self);

    /// Sends a workload to the proxy and waits for it to be acknowledged.
    async fn notify_joined(
        &self,
        cancel: &CancellationToken,
        workload: &Workload,
        netns: Arc<Netns>,
    ) -> Result<(), Error>;

    /// Tells the proxy that a workload has left the mesh and waits for acknowledgement.
    async fn notify_left(&self, cancel: &CancellationToken, uid: &Uid) -> Result<(), Error>;
}

/// Accepts connections from the proxy.
#[async_trait::async_trait]
pub trait Listener: Send + Sync + 'static {
    type Connection: Connection;

    /// Waits for the proxy to connect.
    ///
    /// This must be cancel-safe: a pending accept may be dropped in favor of other work.
    async fn accept(&self) -> anyhow::Result<Self::Connection>;
}

/// A connection to the proxy.
#[async_trait::async_trait]
pub trait Connection: Send + 'static {
    /// Sends a message and waits for the proxy's response. An `Err` indicates the connection is
    /// no longer usable.
    async fn send(&mut self, msg: &Message) -> anyhow::Result<Ack>;
}

#[derive(Debug)]
pub enum Message {
    /// A workload joined the mesh. During snapshot replay the workload's metadata is not known
    /// and only the UID and namespace are sent.
    Added {
        uid: Uid,
        netns: Arc<Netns>,
        workload: Option<Workload>,
    },

    /// A workload left the mesh.
    Removed { uid: Uid },

    /// All workloads known at connection time have been sent.
    SnapshotSent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no proxy is connected")]
    NotConnected,

    #[error("cancelled while waiting for the proxy")]
    Cancelled,

    #[error("timed out after {0:?} waiting for the proxy")]
    Timeout(Duration),

    #[error("proxy sync server is closed")]
    Closed,

    #[error("proxy rejected update: {0}")]
    Rejected(String),

    #[error("proxy connection failed: {0}")]
    Transport(#[source] anyhow::Error),
}
