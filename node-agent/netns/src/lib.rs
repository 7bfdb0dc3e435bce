//! Network namespace bookkeeping for the node agent.
//!
//! - [`NetnsCache`] maps each workload to the handle of its network namespace.
//! - [`NetnsExecutor`] runs operations inside a workload's namespace on a pool of dedicated
//!   threads. Namespace membership is a property of an OS thread, so these operations must never
//!   run on (or leak into) the async runtime's worker threads.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod executor;

pub use self::{
    cache::{NetnsCache, OpenError, SharedCache},
    executor::{Linux, NetnsExecutor, Setns, SwitchError},
};
