use crate::{Ack, Connection, Error, Listener, Message, ProxySync};
use linkerd_node_agent_core::{CancellationToken, Netns, Uid, Workload};
use linkerd_node_agent_netns::SharedCache;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Duration},
};
use tracing::{debug, info, warn};

// Updates are processed one at a time and each waits for an ack, so a deep queue would only
// delay callers past their deadlines.
const REQUEST_QUEUE_SIZE: usize = 64;

const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Serves the node's proxy, delivering workload updates over the most recent connection.
pub struct ProxyServer<L> {
    listener: L,
    cache: SharedCache,
    ack_timeout: Duration,
    requests: mpsc::Sender<Request>,
    pending: Mutex<Option<mpsc::Receiver<Request>>>,
    connected: AtomicBool,
    closed: CancellationToken,
}

struct Request {
    msg: Message,
    ack: oneshot::Sender<Result<(), Error>>,
}

// === impl ProxyServer ===

impl<L: Listener> ProxyServer<L> {
    pub fn new(listener: L, cache: SharedCache, ack_timeout: Duration) -> Self {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        Self {
            listener,
            cache,
            ack_timeout,
            requests,
            pending: Mutex::new(Some(rx)),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn serve(&self, mut requests: mpsc::Receiver<Request>, shutdown: drain::Watch) {
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        let mut conn = None;
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!("Shutdown signaled");
                    break;
                }

                _ = self.closed.cancelled() => {
                    debug!("Closed");
                    break;
                }

                res = self.listener.accept() => match res {
                    Ok(mut new) => {
                        info!("Proxy connected");
                        match self.send_snapshot(&mut new).await {
                            Ok(n) => {
                                debug!(workloads = n, "Sent snapshot");
                                // The latest connection always replaces the prior one.
                                conn = Some(new);
                                self.connected.store(true, Ordering::Release);
                            }
                            Err(error) => warn!(%error, "Failed to send snapshot to proxy"),
                        }
                    }
                    Err(error) => {
                        warn!(%error, "Failed to accept proxy connection");
                        time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                req = requests.recv(), if conn.is_some() => {
                    let Some(Request { msg, ack }) = req else {
                        break;
                    };
                    let Some(c) = conn.as_mut() else {
                        let _ = ack.send(Err(Error::NotConnected));
                        continue;
                    };
                    let res = match self.exchange(c, &msg).await {
                        Ok(Ack::Ok) => Ok(()),
                        Ok(Ack::Rejected(reason)) => Err(Error::Rejected(reason)),
                        Err(error) => {
                            warn!(%error, "Proxy connection failed");
                            conn = None;
                            self.connected.store(false, Ordering::Release);
                            Err(error)
                        }
                    };
                    let _ = ack.send(res);

                    if conn.is_none() {
                        // Nothing queued can be delivered until the proxy reconnects.
                        while let Ok(Request { ack, .. }) = requests.try_recv() {
                            let _ = ack.send(Err(Error::NotConnected));
                        }
                    }
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        // Dropping `requests` fails anything still queued with `Closed`.
    }

    async fn send_snapshot(&self, conn: &mut L::Connection) -> Result<usize, Error> {
        let workloads = self.cache.resolved();
        let n = workloads.len();
        for (uid, netns) in workloads {
            let msg = Message::Added {
                uid: uid.clone(),
                netns,
                workload: None,
            };
            if let Ack::Rejected(reason) = self.exchange(conn, &msg).await? {
                warn!(%uid, %reason, "Proxy rejected workload from snapshot");
            }
        }
        if let Ack::Rejected(reason) = self.exchange(conn, &Message::SnapshotSent).await? {
            return Err(Error::Rejected(reason));
        }
        Ok(n)
    }

    /// Sends a single message and waits for its ack. A proxy that does not answer within the ack
    /// timeout is treated as disconnected.
    async fn exchange(&self, conn: &mut L::Connection, msg: &Message) -> Result<Ack, Error> {
        tokio::select! {
            res = time::timeout(self.ack_timeout, conn.send(msg)) => match res {
                Ok(Ok(ack)) => Ok(ack),
                Ok(Err(error)) => Err(Error::Transport(error)),
                Err(_) => Err(Error::Timeout(self.ack_timeout)),
            },
            _ = self.closed.cancelled() => Err(Error::Closed),
        }
    }

    async fn request(&self, cancel: &CancellationToken, msg: Message) -> Result<(), Error> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        let exchange = async {
            self.requests
                .send(Request { msg, ack: tx })
                .await
                .map_err(|_| Error::Closed)?;
            rx.await.map_err(|_| Error::Closed)?
        };

        tokio::select! {
            res = time::timeout(self.ack_timeout, exchange) => {
                res.unwrap_or_else(|_| Err(Error::Timeout(self.ack_timeout)))
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

#[async_trait::async_trait]
impl<L: Listener> ProxySync for ProxyServer<L> {
    async fn run(&self, shutdown: drain::Watch) {
        let requests = self.pending.lock().take();
        let Some(requests) = requests else {
            warn!("Proxy sync server is already running");
            return;
        };
        info!("Waiting for proxy to connect");
        self.serve(requests, shutdown).await;
        info!("Proxy sync server stopped");
    }

    fn close(&self) {
        self.closed.cancel();
    }

    async fn notify_joined(
        &self,
        cancel: &CancellationToken,
        workload: &Workload,
        netns: Arc<Netns>,
    ) -> Result<(), Error> {
        let msg = Message::Added {
            uid: workload.uid.clone(),
            netns,
            workload: Some(workload.clone()),
        };
        self.request(cancel, msg).await
    }

    async fn notify_left(&self, cancel: &CancellationToken, uid: &Uid) -> Result<(), Error> {
        self.request(cancel, Message::Removed { uid: uid.clone() })
            .await
    }
}

impl<L> std::fmt::Debug for ProxyServer<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("ack_timeout", &self.ack_timeout)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}
