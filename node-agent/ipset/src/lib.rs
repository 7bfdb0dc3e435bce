//! The host-side probe set.
//!
//! Kubelet health probes originate from the host namespace. The node's firewall rules consult a
//! host-level IP set to recognize probe traffic destined for meshed workloads, so every meshed
//! workload's IPs must be present in the set, tagged with the workload's UID, for as long as the
//! workload is in the mesh.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod memory;
mod probe_set;

pub use self::{
    memory::{Entry, MemoryIpSet},
    probe_set::{Error, HostProbeSet},
};

use std::{fmt, net::IpAddr, sync::Arc};

/// An L4 protocol, as recorded in set entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A host-level set of IP entries.
pub trait IpSet: Send + Sync + 'static {
    /// The name of the set on the host.
    fn name(&self) -> &str;

    /// Adds an entry for `ip`, tagged with `comment`.
    ///
    /// Unless `replace` is set, adding an IP that is already present fails.
    fn add_ip(
        &self,
        ip: IpAddr,
        protocol: Protocol,
        comment: &str,
        replace: bool,
    ) -> anyhow::Result<()>;

    /// Removes all entries for `ip`. Removing an absent IP is not an error.
    fn clear_entries_with_ip(&self, ip: IpAddr) -> anyhow::Result<()>;

    /// Lists the IPs of all entries.
    fn list_entries_by_ip(&self) -> anyhow::Result<Vec<IpAddr>>;

    /// Lists the IP and comment of all entries.
    fn list_entries(&self) -> anyhow::Result<Vec<(IpAddr, String)>>;

    /// Removes every entry.
    fn flush(&self) -> anyhow::Result<()>;

    /// Removes the set from the host.
    fn destroy(&self) -> anyhow::Result<()>;
}

// === impl Protocol ===

impl Protocol {
    /// The IANA protocol number.
    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

// === impl IpSet ===

impl<S: IpSet> IpSet for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn add_ip(
        &self,
        ip: IpAddr,
        protocol: Protocol,
        comment: &str,
        replace: bool,
    ) -> anyhow::Result<()> {
        (**self).add_ip(ip, protocol, comment, replace)
    }

    fn clear_entries_with_ip(&self, ip: IpAddr) -> anyhow::Result<()> {
        (**self).clear_entries_with_ip(ip)
    }

    fn list_entries_by_ip(&self) -> anyhow::Result<Vec<IpAddr>> {
        (**self).list_entries_by_ip()
    }

    fn list_entries(&self) -> anyhow::Result<Vec<(IpAddr, String)>> {
        (**self).list_entries()
    }

    fn flush(&self) -> anyhow::Result<()> {
        (**self).flush()
    }

    fn destroy(&self) -> anyhow::Result<()> {
        (**self).destroy()
    }
}
