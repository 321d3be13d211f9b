#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

//! HyperPod Provisioning Harness
//!
//! Resolves the target environment, plans a cluster topology, writes the
//! cluster and node-provisioning descriptors, submits the cluster and waits
//! for it to come into service.

pub mod cloud;
pub mod config;
pub mod descriptor;
pub mod environment;
pub mod pipeline;
pub mod poller;
pub mod reservation;
pub mod source;
pub mod state;
pub mod test_utils;
pub mod topology;
pub mod users;

pub use cloud::{AwsCli, CloudControl};
pub use config::ConfigDocument;
pub use descriptor::Descriptors;
pub use environment::Environment;
pub use pipeline::{OrchestrationPipeline, PipelineOptions, PipelineReport};
pub use poller::{PollOutcome, PollSpec};
pub use source::{ConfigSource, StdinPrompter};
pub use state::{PipelineState, Stage, StageOutcome};
pub use topology::{Topology, TopologyBuilder};
