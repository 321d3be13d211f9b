//! Configuration vocabulary shared between the HyperPod provisioning crates.

mod groups;
mod types;

pub use groups::*;
pub use types::*;
