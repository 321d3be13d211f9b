//! Declarative worker-group and user entries as they appear in the config file.
//!
//! Entries are only shape-checked here. Range checks (zero counts, thread
//! values, instance type syntax) happen in the topology builder, which warns
//! and falls back to the field default.

use serde::{Deserialize, Serialize};

/// One element of the `worker_groups` array.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerGroupSpec {
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default = "default_instance_count")]
    pub instance_count: u32,
    #[serde(default = "default_volume_size_gb", alias = "volume_size")]
    pub volume_size_gb: u32,
    #[serde(default = "default_threads_per_core")]
    pub threads_per_core: u8,
    /// Training plan (capacity reservation) ARN or name to bind the group to.
    #[serde(default, alias = "capacity_reservation")]
    pub training_plan: Option<String>,
    /// Slurm partition label; defaults to the instance type.
    #[serde(default)]
    pub partition_name: Option<String>,
}

/// One element of the `users` array.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSpec {
    pub username: String,
    #[serde(default)]
    pub uid: Option<u32>,
    /// Home directory; defaults to `<shared_dir>/<username>`.
    #[serde(default)]
    pub home: Option<String>,
}

/// Default worker instance count.
#[must_use]
pub fn default_instance_count() -> u32 {
    1
}

/// Default EBS volume size for every group, in GB.
#[must_use]
pub fn default_volume_size_gb() -> u32 {
    500
}

/// Workers run with hyperthreading off unless asked otherwise.
#[must_use]
pub fn default_threads_per_core() -> u8 {
    1
}

/// First uid handed out to generated users.
pub const FIRST_USER_UID: u32 = 2001;
