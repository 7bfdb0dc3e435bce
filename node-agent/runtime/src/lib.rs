//! Linkerd node agent runtime
//!
//! Wires the node agent's components into an [`Orchestrator`] that admits workloads into the
//! mesh and evicts them from it. The owning controller drives the orchestrator: it calls
//! [`Orchestrator::add_to_mesh`] when a workload is selected, [`Orchestrator::remove_from_mesh`]
//! when a running workload opts out, [`Orchestrator::delete_from_mesh`] once a workload has
//! terminated, and [`Orchestrator::construct_initial_snapshot`] once at startup.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use linkerd_node_agent_core as core;
pub use linkerd_node_agent_ipset as ipset;
pub use linkerd_node_agent_netns as netns;
pub use linkerd_node_agent_proxy as proxy;

mod args;
mod error;
mod metrics;
mod orchestrator;


pub use self::{
    args::{parse_timeout, Args, Config},
    error::Error,
    metrics::Metrics,
    orchestrator::{Collaborators, Orchestrator},
};
