pub mod controller;
pub mod nexus;

pub use controller::ClusterController;
pub use nexus::{LocalNexus, Nexus, NodeInfo, RaftRole};
