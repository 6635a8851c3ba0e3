//! Network emulation toolkit for the hop benchmark harness.
//!
//! Provides Linux network namespace management, `tc netem` shaping, the
//! impairment profile catalog and the router topology the sweep runs on.

pub mod impairment;
pub mod namespace;
pub mod profile;
pub mod topology;

#[cfg(test)]
pub(crate) mod test_util;

pub use impairment::LinkShaping;
pub use profile::{CatalogError, ImpairmentProfile, ProfileCatalog};
pub use topology::{Node, Topology, TopologyConfig};
