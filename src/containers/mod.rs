//! Fleet-wide container index
//!
//! Every container the control plane knows about, across all nodes, lives
//! in this registry. Entries are created from daemon listings, daemon
//! events or create requests, written through to the KV store, and
//! repaired by a periodic reconciliation sweep per endpoint.

mod naming;
mod registry;

pub use naming::{pick_unique_name, unique_container_name};
pub use registry::{ContainerBase, ContainerRegistration, ContainerRegistry};
