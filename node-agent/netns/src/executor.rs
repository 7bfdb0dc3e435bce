use linkerd_node_agent_core::Netns;
use nix::sched::CloneFlags;
use parking_lot::Mutex;
use std::{
    io,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, trace, warn};

/// Switches the calling thread between network namespaces.
pub trait Setns: Send + Sync + 'static {
    /// A handle to the namespace a thread started in.
    type Saved: Send + 'static;

    /// Captures the calling thread's current namespace.
    fn save(&self) -> io::Result<Self::Saved>;

    /// Moves the calling thread into `netns`.
    fn enter(&self, netns: &Netns) -> io::Result<()>;

    /// Moves the calling thread back into a namespace captured by [`Setns::save`].
    fn restore(&self, saved: &Self::Saved) -> io::Result<()>;
}

/// Switches namespaces with `setns(2)`.
#[derive(Copy, Clone, Debug, Default)]
pub struct Linux(());

/// Runs operations inside network namespaces.
///
/// Each operation is dispatched to one of a fixed set of dedicated worker threads. A worker
/// enters the target namespace, runs the operation to completion, and restores its original
/// namespace before it accepts any other work, so operations never interleave on a thread and
/// the async runtime's threads never change namespace.
///
/// A worker that fails to restore its namespace is retired rather than reused. Callers waiting
/// on the pool are woken when a worker exits and replace it from their own thread, so work queued
/// behind a retired worker is still picked up.
pub struct NetnsExecutor<S: Setns = Linux> {
    setns: Arc<S>,
    size: usize,
    live: Arc<AtomicUsize>,
    exited: Arc<Notify>,
    spawning: Mutex<()>,
    next_id: AtomicUsize,
    jobs: mpsc::Sender<Job<S>>,
    queue: Arc<Mutex<mpsc::Receiver<Job<S>>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("failed to enter netns {inode}: {source}")]
    Enter {
        inode: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to restore worker netns: {0}")]
    Restore(#[source] io::Error),

    #[error("operation panicked in netns {inode}")]
    Panicked { inode: u64 },

    #[error("no netns workers are available")]
    Unavailable,
}

/// Runs on a worker with access to its namespace switcher and its saved home namespace. Returns
/// false if the worker could not be restored to its home namespace.
type Job<S> = Box<dyn FnOnce(&S, &<S as Setns>::Saved) -> bool + Send>;

const NETNS_SELF: &str = "/proc/thread-self/ns/net";

// === impl Linux ===

impl Setns for Linux {
    type Saved = Netns;

    fn save(&self) -> io::Result<Netns> {
        Netns::open(NETNS_SELF)
    }

    fn enter(&self, netns: &Netns) -> io::Result<()> {
        nix::sched::setns(netns, CloneFlags::CLONE_NEWNET).map_err(io::Error::from)
    }

    fn restore(&self, saved: &Netns) -> io::Result<()> {
        self.enter(saved)
    }
}

// === impl NetnsExecutor ===

impl NetnsExecutor<Linux> {
    pub fn linux(workers: NonZeroUsize) -> io::Result<Self> {
        Self::new(Linux::default(), workers)
    }
}

impl<S: Setns> NetnsExecutor<S> {
    /// Starts `workers` threads. Fails if none of them can capture their namespace.
    pub fn new(setns: S, workers: NonZeroUsize) -> io::Result<Self> {
        let (jobs, queue) = mpsc::channel();
        let executor = Self {
            setns: Arc::new(setns),
            size: workers.get(),
            live: Arc::new(AtomicUsize::new(0)),
            exited: Arc::new(Notify::new()),
            spawning: Mutex::new(()),
            next_id: AtomicUsize::new(0),
            jobs,
            queue: Arc::new(Mutex::new(queue)),
        };

        let mut last_error = None;
        for _ in 0..executor.size {
            if let Err(error) = executor.spawn_worker() {
                warn!(%error, "Failed to start netns worker");
                last_error = Some(error);
            }
        }
        match last_error {
            Some(error) if executor.workers() == 0 => Err(error),
            _ => Ok(executor),
        }
    }

    /// The number of workers currently able to accept work.
    pub fn workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Runs `op` with a worker thread switched into `netns`, returning the operation's own
    /// result unchanged.
    pub async fn run<F, T>(&self, netns: Arc<Netns>, op: F) -> Result<T, SwitchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        // Registered before the pool is checked so that no exit goes unnoticed.
        let exited = self.exited.notified();
        tokio::pin!(exited);
        exited.as_mut().enable();

        self.replenish();
        if self.workers() == 0 {
            return Err(SwitchError::Unavailable);
        }

        let (tx, mut rx) = oneshot::channel();
        let job: Job<S> = Box::new(move |setns: &S, home: &S::Saved| {
            let inode = netns.inode();
            trace!(inode, "Entering netns");
            if let Err(source) = setns.enter(&netns) {
                // The thread may have been partially switched, so it must still be restored.
                let restored = setns.restore(home).is_ok();
                let _ = tx.send(Err(SwitchError::Enter { inode, source }));
                return restored;
            }

            let res = panic::catch_unwind(AssertUnwindSafe(op));
            let restored = setns.restore(home);
            let healthy = restored.is_ok();
            let _ = tx.send(match (res, restored) {
                (_, Err(error)) => Err(SwitchError::Restore(error)),
                (Err(_), Ok(())) => Err(SwitchError::Panicked { inode }),
                (Ok(out), Ok(())) => Ok(out),
            });
            healthy
        });

        self.jobs
            .send(job)
            .map_err(|_| SwitchError::Unavailable)?;
        loop {
            tokio::select! {
                res = &mut rx => return res.map_err(|_| SwitchError::Unavailable)?,
                () = &mut exited => {
                    exited.set(self.exited.notified());
                    exited.as_mut().enable();
                    debug!("Netns worker exited; replenishing");
                    self.replenish();
                    if self.workers() == 0 {
                        return Err(SwitchError::Unavailable);
                    }
                }
            }
        }
    }

    /// Replaces retired workers. New threads inherit the calling thread's namespace, which is
    /// never a workload's, since callers are not netns workers.
    fn replenish(&self) {
        let _spawning = self.spawning.lock();
        while self.workers() < self.size {
            if let Err(error) = self.spawn_worker() {
                warn!(%error, "Failed to replace netns worker");
                return;
            }
        }
    }

    fn spawn_worker(&self) -> io::Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let setns = self.setns.clone();
        let queue = self.queue.clone();
        let live = self.live.clone();
        let exited = self.exited.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        // The worker counts as live from the moment it has captured its home namespace.
        thread::Builder::new()
            .name(format!("netns-{id}"))
            .spawn(move || {
                let home = match setns.save() {
                    Ok(home) => home,
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                        return;
                    }
                };
                let live = Live::acquire(live);
                let _ = ready_tx.send(Ok(()));
                drop(ready_tx);
                work(id, &*setns, &home, &queue);
                drop(live);
                exited.notify_waiters();
            })?;

        ready_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "netns worker exited early"))?
    }
}

impl<S: Setns> std::fmt::Debug for NetnsExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetnsExecutor")
            .field("size", &self.size)
            .field("workers", &self.workers())
            .finish()
    }
}

fn work<S: Setns>(id: usize, setns: &S, home: &S::Saved, queue: &Mutex<mpsc::Receiver<Job<S>>>) {
    debug!(worker = id, "Netns worker started");
    loop {
        // Only one idle worker waits on the queue at a time; the rest wait on the lock.
        let job = match queue.lock().recv() {
            Ok(job) => job,
            Err(_) => {
                debug!(worker = id, "Netns executor dropped");
                return;
            }
        };
        if !job(setns, home) {
            error!(worker = id, "Netns worker could not restore its namespace; retiring");
            return;
        }
    }
}

/// Counts a worker as live for as long as it is held.
struct Live(Arc<AtomicUsize>);

impl Live {
    fn acquire(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self(live)
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
