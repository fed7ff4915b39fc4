pub mod controller;
pub mod identity;
pub mod metrics;
pub mod mounter;
pub mod node;
pub mod server;

pub use controller::CsiController;
pub use identity::IdentityService;
pub use metrics::CsiMetrics;
pub use mounter::{Mounter, SystemMounter};
pub use node::{CsiNode, TOPOLOGY_KEY};

// Re-export generated proto types
pub mod proto {
    tonic::include_proto!("csi.v1");
}
