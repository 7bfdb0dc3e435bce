//! Linkerd node agent core types
//!
//! The node agent admits workloads into (and evicts them from) the mesh data plane on a single
//! node. This crate holds the types shared by all of its components along with the interfaces of
//! the collaborators the agent drives but does not own:
//!
//! - A [`RuleInstaller`] writes the redirect rules that route a workload's traffic through the
//!   local proxy. It is only ever invoked from a thread that has been moved into the workload's
//!   network namespace.
//! - A [`NetnsFinder`] resolves namespace handles for workloads that the agent has not been told
//!   about directly, e.g. after a restart or when a running workload is opted into the mesh.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod errors;
mod netns;
mod workload;

pub use self::{
    errors::Errors,
    netns::Netns,
    workload::{Uid, Workload},
};
pub use tokio_util::sync::CancellationToken;

use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr},
};

/// Parameters for the redirect rules installed in each workload's namespace.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RedirectParams {
    /// The address the host uses to source-NAT kubelet probes, so that the in-namespace rules can
    /// exempt them from redirection.
    pub host_probe_snat_v4: Ipv4Addr,
    pub host_probe_snat_v6: Ipv6Addr,
}

/// Installs and removes the traffic redirection rules.
pub trait RuleInstaller: Send + Sync + 'static {
    /// Installs redirect rules in the calling thread's current network namespace.
    fn install_redirect(&self, params: &RedirectParams) -> anyhow::Result<()>;

    /// Removes redirect rules from the calling thread's current network namespace.
    fn remove_redirect(&self) -> anyhow::Result<()>;

    /// Removes the node-wide rules installed in the host namespace.
    fn remove_host_rules(&self) -> anyhow::Result<()>;
}

/// Discovers the namespaces of running workloads.
///
/// Discovery is best-effort: workloads whose namespace cannot be found are omitted from the
/// result rather than failing the whole lookup.
#[async_trait::async_trait]
pub trait NetnsFinder: Send + Sync + 'static {
    async fn find_netns(
        &self,
        workloads: &HashMap<Uid, Workload>,
    ) -> anyhow::Result<HashMap<Uid, Netns>>;
}
