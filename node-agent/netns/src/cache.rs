use ahash::AHashMap as HashMap;
use linkerd_node_agent_core::{Netns, Uid};
use parking_lot::Mutex;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, trace};

pub type SharedCache = Arc<NetnsCache>;

/// Maps workload UIDs to their network namespace handles.
///
/// An entry without a handle is a placeholder for a workload that is known to be joining the mesh
/// but whose namespace has not been resolved yet. A UID that is absent from the cache is simply
/// not known; it is never an error on its own.
///
/// No I/O happens while the map is locked, so operations on distinct workloads never wait on one
/// another beyond a map update.
#[derive(Debug, Default)]
pub struct NetnsCache {
    entries: Mutex<HashMap<Uid, Option<Arc<Netns>>>>,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to open netns {}: {source}", path.display())]
pub struct OpenError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

// === impl NetnsCache ===

impl NetnsCache {
    pub fn shared() -> SharedCache {
        Arc::new(Self::default())
    }

    /// Records that a workload is in flight without overwriting any existing entry.
    pub fn ensure(&self, uid: &Uid) {
        self.entries.lock().entry(uid.clone()).or_insert(None);
    }

    /// Opens the namespace at `path` and stores it for `uid`.
    pub fn upsert(&self, uid: &Uid, path: &Path) -> Result<Arc<Netns>, OpenError> {
        let netns = Netns::open(path).map_err(|source| OpenError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.upsert_netns(uid.clone(), netns))
    }

    /// Stores an already-open namespace handle for `uid`, replacing any prior handle.
    ///
    /// If the prior handle refers to the same namespace it is kept and the new handle is closed
    /// instead, so that holders of the prior handle observe no change.
    pub fn upsert_netns(&self, uid: Uid, netns: Netns) -> Arc<Netns> {
        let (stored, replaced) = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(uid).or_insert(None);
            if let Some(prior) = entry.as_ref().filter(|p| p.inode() == netns.inode()) {
                (prior.clone(), Some(netns))
            } else {
                let netns = Arc::new(netns);
                let prior = entry.replace(netns.clone());
                (netns, prior.and_then(|p| Arc::try_unwrap(p).ok()))
            }
        };
        // Whichever handle was displaced is closed here, outside of the lock.
        if let Some(replaced) = replaced {
            trace!(inode = replaced.inode(), "Closing displaced netns handle");
        }
        stored
    }

    /// Puts a previously taken handle back, unless the workload has since been given a new one.
    pub fn reinsert(&self, uid: Uid, netns: Arc<Netns>) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(uid).or_insert(None);
        if entry.is_none() {
            *entry = Some(netns);
        }
    }

    /// Returns the workload's namespace, if it has been resolved.
    pub fn get(&self, uid: &Uid) -> Option<Arc<Netns>> {
        self.entries.lock().get(uid).cloned().flatten()
    }

    /// Removes the workload's entry, transferring its handle to the caller.
    ///
    /// `None` means that there was no entry or that it was still a placeholder.
    pub fn take(&self, uid: &Uid) -> Option<Arc<Netns>> {
        let netns = self.entries.lock().remove(uid).flatten();
        debug!(%uid, found = netns.is_some(), "Took netns");
        netns
    }

    /// Returns true if the workload has an entry, resolved or not.
    pub fn contains(&self, uid: &Uid) -> bool {
        self.entries.lock().contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Returns all resolved entries, ordered by UID.
    pub fn resolved(&self) -> Vec<(Uid, Arc<Netns>)> {
        let mut resolved = self
            .entries
            .lock()
            .iter()
            .filter_map(|(uid, netns)| Some((uid.clone(), netns.clone()?)))
            .collect::<Vec<_>>();
        resolved.sort_by(|(a, _), (b, _)| a.cmp(b));
        resolved
    }
}
