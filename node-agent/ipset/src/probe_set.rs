use crate::{IpSet, Protocol};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use linkerd_node_agent_core::{Errors, Uid, Workload};
use std::net::IpAddr;
use tracing::{debug, error, warn};

/// Tracks the IPs of meshed workloads in a host [`IpSet`] so that host-originated probes can be
/// exempted from redirection.
#[derive(Debug)]
pub struct HostProbeSet<S> {
    set: S,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to add {ip} to {set}: {source}")]
    Add {
        set: String,
        ip: IpAddr,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to remove {ip} from {set}: {source}")]
    Remove {
        set: String,
        ip: IpAddr,
        #[source]
        source: anyhow::Error,
    },

    #[error("{ip} in {set} belongs to {owner}, not {uid}")]
    Conflict {
        set: String,
        ip: IpAddr,
        owner: String,
        uid: Uid,
    },

    #[error("failed to list {set}: {source}")]
    List {
        set: String,
        #[source]
        source: anyhow::Error,
    },
}

// === impl HostProbeSet ===

impl<S: IpSet> HostProbeSet<S> {
    pub fn new(set: S) -> Self {
        Self { set }
    }

    pub fn name(&self) -> &str {
        self.set.name()
    }

    /// Adds an entry for each IP, tagged with the owner's UID.
    ///
    /// Entries are never replaced: if an IP is already present (for this owner or any other),
    /// adding it fails and the existing entry is left in place. A stale entry for a reused IP
    /// would otherwise misroute the new owner's probes. IPs that were added successfully are
    /// kept even if others fail.
    pub fn add_entries(
        &self,
        owner: &Uid,
        ips: &[IpAddr],
        protocol: Protocol,
    ) -> Result<(), Errors<Error>> {
        let mut errors = Errors::new();
        for &ip in ips {
            debug!(%owner, %ip, set = %self.name(), "Adding probe entry");
            if let Err(source) = self.set.add_ip(ip, protocol, owner.as_str(), false) {
                error!(%owner, %ip, set = %self.name(), error = %source, "Failed to add probe entry");
                errors.push(Error::Add {
                    set: self.name().to_string(),
                    ip,
                    source,
                });
            }
        }
        errors.into_result()
    }

    /// Removes the entries for each of the workload's current IPs.
    pub fn remove_entries(&self, workload: &Workload) -> Result<(), Error> {
        for &ip in &workload.ips {
            self.remove_ip(ip)?;
            debug!(uid = %workload.uid, %ip, set = %self.name(), "Removed probe entry");
        }
        Ok(())
    }

    /// Removes every entry whose IP is not expected.
    pub fn reconcile(&self, expected: &HashSet<IpAddr>) -> Result<(), Errors<Error>> {
        let actual = self.list()?;

        let mut errors = Errors::new();
        for ip in actual.into_iter().filter(|ip| !expected.contains(ip)) {
            match self.remove_ip(ip) {
                Ok(()) => debug!(%ip, set = %self.name(), "Removed stale probe entry"),
                Err(error) => errors.push(error),
            }
        }
        errors.into_result()
    }

    /// Brings the set in line with exactly the given workloads' IPs: stale entries are removed
    /// and any missing entries are added.
    ///
    /// An IP that is already present for the same workload is left alone. An IP that is present
    /// for another owner is kept and reported as a [`Error::Conflict`].
    pub fn sync(&self, workloads: &[Workload], protocol: Protocol) -> Result<(), Errors<Error>> {
        let mut expected = HashSet::new();
        for workload in workloads {
            if workload.ips.is_empty() {
                warn!(uid = %workload.uid, workload = %workload, "Workload has no IPs; skipping probe set sync");
            }
            expected.extend(workload.ips.iter().copied());
        }

        let mut errors = Errors::new();
        if let Err(e) = self.reconcile(&expected) {
            errors.extend(e);
        }

        let owners = match self.owners() {
            Ok(owners) => owners,
            Err(e) => {
                errors.push(e);
                return errors.into_result();
            }
        };
        for workload in workloads {
            let mut missing = Vec::new();
            for &ip in &workload.ips {
                match owners.get(&ip) {
                    None => missing.push(ip),
                    Some(owner) if owner == workload.uid.as_str() => {}
                    Some(owner) => {
                        warn!(uid = %workload.uid, %ip, %owner, set = %self.name(), "Probe entry belongs to another workload");
                        errors.push(Error::Conflict {
                            set: self.name().to_string(),
                            ip,
                            owner: owner.clone(),
                            uid: workload.uid.clone(),
                        });
                    }
                }
            }
            if let Err(e) = self.add_entries(&workload.uid, &missing, protocol) {
                errors.extend(e);
            }
        }
        errors.into_result()
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.set.flush()
    }

    pub fn destroy(&self) -> anyhow::Result<()> {
        self.set.destroy()
    }

    fn list(&self) -> Result<HashSet<IpAddr>, Error> {
        let ips = self.set.list_entries_by_ip().map_err(|source| {
            warn!(set = %self.name(), error = %source, "Unable to list probe set");
            Error::List {
                set: self.name().to_string(),
                source,
            }
        })?;
        Ok(ips.into_iter().collect())
    }

    /// Maps each entry's IP to the UID it is tagged with.
    fn owners(&self) -> Result<HashMap<IpAddr, String>, Error> {
        let entries = self.set.list_entries().map_err(|source| {
            warn!(set = %self.name(), error = %source, "Unable to list probe set");
            Error::List {
                set: self.name().to_string(),
                source,
            }
        })?;
        Ok(entries.into_iter().collect())
    }

    fn remove_ip(&self, ip: IpAddr) -> Result<(), Error> {
        self.set
            .clear_entries_with_ip(ip)
            .map_err(|source| Error::Remove {
                set: self.name().to_string(),
                ip,
                source,
            })
    }
}
