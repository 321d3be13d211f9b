//! Shared test utilities: a scripted cloud, a sleeper that never sleeps, and
//! canned environments.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    time::Duration,
};

pub use crate::source::ScriptedPrompter;
use crate::{
    cloud::{CloudControl, CloudError},
    environment::{DEFAULT_STACK_NAME, Environment, SharedFsBinding},
    poller::Sleeper,
    reservation::CapacityReservationBinding,
};

pub const CALLER_ARN: &str = "arn:aws:iam::111122223333:user/operator";
pub const EXECUTION_ROLE: &str = "arn:aws:iam::111122223333:role/hyperpod-exec";
pub const COORDINATION_ROLE: &str = "arn:aws:iam::111:role/slurm-exec";

/// Counts sleeps instead of sleeping.
#[derive(Debug, Default)]
pub struct NoSleep {
    sleeps: Cell<usize>,
}

impl NoSleep {
    #[must_use]
    pub fn count(&self) -> usize {
        self.sleeps.get()
    }
}

impl Sleeper for NoSleep {
    fn sleep(&self, _duration: Duration) {
        self.sleeps.set(self.sleeps.get() + 1);
    }
}

/// In-memory [`CloudControl`] with scripted responses.
///
/// Every call is recorded as `"<operation> <subject>"`. Operations registered
/// with [`FakeCloud::fail`] return a command error carrying the given stderr.
#[derive(Debug, Default)]
pub struct FakeCloud {
    configured_region: RefCell<Option<String>>,
    stacks: RefCell<HashMap<String, HashMap<String, String>>>,
    templates: RefCell<HashMap<String, HashMap<String, String>>>,
    stack_statuses: RefCell<VecDeque<String>>,
    plans: RefCell<HashMap<String, CapacityReservationBinding>>,
    quotas: RefCell<HashMap<String, u32>>,
    cluster_statuses: RefCell<VecDeque<String>>,
    failures: RefCell<HashMap<String, String>>,
    calls: RefCell<Vec<String>>,
    submitted: RefCell<Option<serde_json::Value>>,
    uploads: RefCell<Vec<(PathBuf, String)>>,
}

fn outputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

impl FakeCloud {
    /// A cloud with the default infrastructure stack in place.
    #[must_use]
    pub fn with_default_stack() -> Self {
        let cloud = Self::default();
        cloud.add_stack(DEFAULT_STACK_NAME, Self::infrastructure_outputs());
        cloud
    }

    #[must_use]
    pub fn infrastructure_outputs() -> HashMap<String, String> {
        outputs(&[
            ("OutputSageMakerIAMRoleArn", EXECUTION_ROLE),
            ("OutputS3BucketName", "hyperpod-bucket"),
            ("OutputPrivateSubnetId", "subnet-0123"),
            ("OutputSecurityGroupId", "sg-0123"),
            ("OutputVpcId", "vpc-0123"),
            ("OutputPrivateSubnetAvailabilityZone", "us-east-1a"),
            (
                "OutputFSxLustreFilesystemDNSname",
                "fs-0123.fsx.us-east-1.amazonaws.com",
            ),
            ("OutputFSxLustreFilesystemMountname", "abcdefgh"),
        ])
    }

    #[must_use]
    pub fn coordination_outputs() -> HashMap<String, String> {
        outputs(&[
            (
                "SlurmDBEndpointAddress",
                "slurmdb.cluster-abc.us-east-1.rds.amazonaws.com",
            ),
            (
                "SlurmDBSecretArn",
                "arn:aws:secretsmanager:us-east-1:111:secret:slurmdb",
            ),
            ("SlurmExecutionRoleArn", COORDINATION_ROLE),
            (
                "SlurmFailOverSNSTopicArn",
                "arn:aws:sns:us-east-1:111:slurm-failover",
            ),
        ])
    }

    pub fn set_configured_region(&self, region: &str) {
        *self.configured_region.borrow_mut() = Some(region.to_string());
    }

    pub fn add_stack(&self, name: &str, outputs: HashMap<String, String>) {
        self.stacks.borrow_mut().insert(name.to_string(), outputs);
    }

    /// Register outputs for a stack that appears once `create_stack` is called.
    pub fn add_stack_template(&self, name: &str, outputs: HashMap<String, String>) {
        self.templates.borrow_mut().insert(name.to_string(), outputs);
    }

    /// Statuses returned by successive `stack_status` calls; the last one repeats.
    pub fn script_stack_statuses<I: IntoIterator<Item = &'static str>>(&self, statuses: I) {
        *self.stack_statuses.borrow_mut() = statuses.into_iter().map(String::from).collect();
    }

    pub fn add_training_plan(&self, name: &str, available: u32, instance_type: &str, zone: &str) {
        self.plans.borrow_mut().insert(
            name.to_string(),
            CapacityReservationBinding {
                reservation_id: format!("arn:aws:sagemaker:us-east-1:111:training-plan/{name}"),
                total_capacity: available.max(8),
                available_capacity: available,
                bound_instance_type: instance_type.to_string(),
                availability_zone: zone.to_string(),
            },
        );
    }

    pub fn set_quota(&self, instance_type: &str, quota: u32) {
        self.quotas
            .borrow_mut()
            .insert(instance_type.to_string(), quota);
    }

    /// Statuses returned by successive `cluster_status` calls; the last one repeats.
    pub fn script_cluster_statuses<I: IntoIterator<Item = &'static str>>(&self, statuses: I) {
        *self.cluster_statuses.borrow_mut() = statuses.into_iter().map(String::from).collect();
    }

    /// Make `operation` fail with `stderr`.
    pub fn fail(&self, operation: &str, stderr: &str) {
        self.failures
            .borrow_mut()
            .insert(operation.to_string(), stderr.to_string());
    }

    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    #[must_use]
    pub fn called(&self, operation: &str) -> bool {
        self.calls
            .borrow()
            .iter()
            .any(|c| c.split_whitespace().next() == Some(operation))
    }

    /// The last cluster descriptor passed to `create_cluster`.
    #[must_use]
    pub fn submitted_descriptor(&self) -> Option<serde_json::Value> {
        self.submitted.borrow().clone()
    }

    /// `(local path, destination uri)` for every sync and put.
    #[must_use]
    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.borrow().clone()
    }

    fn record(&self, operation: &str, subject: &str) -> Result<(), CloudError> {
        self.calls
            .borrow_mut()
            .push(format!("{operation} {subject}"));
        match self.failures.borrow().get(operation) {
            Some(stderr) => Err(CloudError::Command {
                command: format!("aws {operation}"),
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }

    fn next_status(queue: &RefCell<VecDeque<String>>) -> Option<String> {
        let mut queue = queue.borrow_mut();
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

fn not_found(what: &str) -> CloudError {
    CloudError::Command {
        command: "aws".to_string(),
        stderr: format!("{what} does not exist"),
    }
}

impl CloudControl for FakeCloud {
    fn caller_identity(&self) -> Result<String, CloudError> {
        self.record("caller_identity", "")?;
        Ok(CALLER_ARN.to_string())
    }

    fn configured_region(&self) -> Result<Option<String>, CloudError> {
        self.record("configured_region", "")?;
        Ok(self.configured_region.borrow().clone())
    }

    fn stack_outputs(
        &self,
        _region: &str,
        stack: &str,
    ) -> Result<HashMap<String, String>, CloudError> {
        self.record("stack_outputs", stack)?;
        self.stacks
            .borrow()
            .get(stack)
            .cloned()
            .ok_or_else(|| not_found(&format!("Stack with id {stack}")))
    }

    fn stack_status(&self, _region: &str, stack: &str) -> Result<String, CloudError> {
        self.record("stack_status", stack)?;
        if !self.stacks.borrow().contains_key(stack) {
            return Err(not_found(&format!("Stack with id {stack}")));
        }
        Ok(Self::next_status(&self.stack_statuses).unwrap_or_else(|| "CREATE_COMPLETE".to_string()))
    }

    fn create_stack(
        &self,
        _region: &str,
        stack: &str,
        _template_url: &str,
        _parameters: &[(String, String)],
    ) -> Result<String, CloudError> {
        self.record("create_stack", stack)?;
        let outputs = self
            .templates
            .borrow_mut()
            .remove(stack)
            .ok_or_else(|| CloudError::Command {
                command: "aws cloudformation create-stack".to_string(),
                stderr: "TemplateURL must be a supported URL".to_string(),
            })?;
        self.stacks.borrow_mut().insert(stack.to_string(), outputs);
        Ok(format!("arn:aws:cloudformation:us-east-1:111:stack/{stack}/1"))
    }

    fn sync_directory(&self, local: &Path, uri: &str) -> Result<(), CloudError> {
        self.record("sync_directory", uri)?;
        self.uploads
            .borrow_mut()
            .push((local.to_path_buf(), uri.to_string()));
        Ok(())
    }

    fn put_object(&self, local: &Path, uri: &str) -> Result<(), CloudError> {
        self.record("put_object", uri)?;
        self.uploads
            .borrow_mut()
            .push((local.to_path_buf(), uri.to_string()));
        Ok(())
    }

    fn describe_training_plan(
        &self,
        _region: &str,
        plan: &str,
    ) -> Result<CapacityReservationBinding, CloudError> {
        self.record("describe_training_plan", plan)?;
        self.plans
            .borrow()
            .get(plan)
            .cloned()
            .ok_or_else(|| not_found(&format!("Training plan {plan}")))
    }

    fn instance_quota(&self, _region: &str, instance_type: &str) -> Result<Option<u32>, CloudError> {
        self.record("instance_quota", instance_type)?;
        Ok(self.quotas.borrow().get(instance_type).copied())
    }

    fn create_cluster(&self, _region: &str, descriptor: &Path) -> Result<String, CloudError> {
        self.record("create_cluster", &descriptor.display().to_string())?;
        let content = std::fs::read_to_string(descriptor).map_err(|e| {
            CloudError::Spawn(format!("read {}", descriptor.display()), e)
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| CloudError::Response {
                command: "create_cluster".to_string(),
                reason: e.to_string(),
            })?;
        let name = value["ClusterName"].as_str().unwrap_or_default().to_string();
        *self.submitted.borrow_mut() = Some(value);
        Ok(format!("arn:aws:sagemaker:us-east-1:111:cluster/{name}"))
    }

    fn cluster_status(&self, _region: &str, cluster: &str) -> Result<String, CloudError> {
        self.record("cluster_status", cluster)?;
        if let Some(status) = Self::next_status(&self.cluster_statuses) {
            return Ok(status);
        }
        if self.submitted.borrow().is_some() {
            Ok("InService".to_string())
        } else {
            Err(not_found(&format!("Cluster {cluster}")))
        }
    }

    fn delete_cluster(&self, _region: &str, cluster: &str) -> Result<(), CloudError> {
        self.record("delete_cluster", cluster)
    }
}

/// Environment matching [`FakeCloud::infrastructure_outputs`].
#[must_use]
pub fn sample_environment() -> Environment {
    Environment {
        region: "us-east-1".to_string(),
        stack_name: DEFAULT_STACK_NAME.to_string(),
        execution_role_arn: EXECUTION_ROLE.to_string(),
        bucket: "hyperpod-bucket".to_string(),
        subnet_id: "subnet-0123".to_string(),
        security_group_id: "sg-0123".to_string(),
        vpc_id: Some("vpc-0123".to_string()),
        availability_zone: Some("us-east-1a".to_string()),
        shared_fs: SharedFsBinding {
            dns_name: Some("fs-0123.fsx.us-east-1.amazonaws.com".to_string()),
            mount_name: Some("abcdefgh".to_string()),
            openzfs_dns_name: None,
        },
    }
}
