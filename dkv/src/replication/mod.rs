pub mod puller;
pub mod registry;

pub use puller::{Puller, PullerConfig, SlaveProgress, SlaveStatusSource};
pub use registry::{Replica, ReplicaRegistry};
