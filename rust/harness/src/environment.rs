//! Region and infrastructure stack resolution.
//!
//! The cluster runs inside infrastructure created by a separate CloudFormation
//! stack. Its outputs seed the defaults; every field can be overridden by a
//! config key.

use std::collections::HashMap;

use serde::Serialize;

use crate::{
    cloud::CloudControl,
    source::{ConfigSource, Prompter},
};

pub const FALLBACK_REGION: &str = "us-east-1";
pub const DEFAULT_STACK_NAME: &str = "sagemaker-hyperpod";

/// (config key, stack output key, prompt)
const EXECUTION_ROLE: (&str, &str, &str) = (
    "execution_role",
    "OutputSageMakerIAMRoleArn",
    "Execution role ARN",
);
const BUCKET: (&str, &str, &str) = ("s3_bucket", "OutputS3BucketName", "Lifecycle asset bucket");
const SUBNET: (&str, &str, &str) = ("subnet_id", "OutputPrivateSubnetId", "Private subnet id");
const SECURITY_GROUP: (&str, &str, &str) = (
    "security_group_id",
    "OutputSecurityGroupId",
    "Security group id",
);
const VPC: (&str, &str, &str) = ("vpc_id", "OutputVpcId", "VPC id");
const AVAILABILITY_ZONE: (&str, &str, &str) = (
    "availability_zone",
    "OutputPrivateSubnetAvailabilityZone",
    "Availability zone of the private subnet",
);
const FSX_DNS: (&str, &str, &str) = (
    "fsx_dns_name",
    "OutputFSxLustreFilesystemDNSname",
    "FSx for Lustre DNS name",
);
const FSX_MOUNT: (&str, &str, &str) = (
    "fsx_mountname",
    "OutputFSxLustreFilesystemMountname",
    "FSx for Lustre mount name",
);
const FSX_OPENZFS_DNS: (&str, &str, &str) = (
    "fsx_openzfs_dns_name",
    "OutputFSxOpenZFSFilesystemDNSname",
    "FSx for OpenZFS DNS name",
);

/// Shared filesystem mounted on every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SharedFsBinding {
    pub dns_name: Option<String>,
    pub mount_name: Option<String>,
    /// Optional OpenZFS home-directory filesystem.
    pub openzfs_dns_name: Option<String>,
}

impl SharedFsBinding {
    /// Lustre is only mounted when both halves are known.
    #[must_use]
    pub fn has_lustre(&self) -> bool {
        self.dns_name.is_some() && self.mount_name.is_some()
    }
}

/// Resolved infrastructure for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub region: String,
    pub stack_name: String,
    pub execution_role_arn: String,
    pub bucket: String,
    pub subnet_id: String,
    pub security_group_id: String,
    pub vpc_id: Option<String>,
    pub availability_zone: Option<String>,
    pub shared_fs: SharedFsBinding,
}

impl Environment {
    /// `s3://<bucket>/src`, where lifecycle assets are staged.
    #[must_use]
    pub fn lifecycle_uri(&self) -> String {
        format!("s3://{}/src", self.bucket)
    }

    /// Resolve every field from config overrides, falling back to stack outputs.
    pub fn resolve<P: Prompter>(
        source: &mut ConfigSource<P>,
        cloud: &dyn CloudControl,
        region: &str,
    ) -> Result<Self, EnvironmentError> {
        let stack_name = source
            .resolve("stack_name", DEFAULT_STACK_NAME, "Infrastructure stack name")
            .value;

        let outputs = match cloud.stack_outputs(region, &stack_name) {
            Ok(outputs) => {
                tracing::info!("Read {} outputs from stack {stack_name}", outputs.len());
                outputs
            }
            Err(e) => {
                tracing::warn!("Could not read stack {stack_name}: {e}");
                HashMap::new()
            }
        };

        let mut required = |field: (&str, &str, &str)| -> Result<String, EnvironmentError> {
            let (key, output, prompt) = field;
            let default = outputs.get(output).map_or("", String::as_str);
            let value = source.resolve(key, default, prompt).value;
            if value.is_empty() {
                return Err(EnvironmentError::Missing {
                    key: key.to_string(),
                    output: output.to_string(),
                    stack: stack_name.clone(),
                });
            }
            Ok(value)
        };

        let execution_role_arn = required(EXECUTION_ROLE)?;
        let bucket = required(BUCKET)?;
        let subnet_id = required(SUBNET)?;
        let security_group_id = required(SECURITY_GROUP)?;

        let mut optional = |field: (&str, &str, &str)| -> Option<String> {
            let (key, output, prompt) = field;
            let default = outputs.get(output).map_or("", String::as_str);
            let value = source.resolve(key, default, prompt).value;
            (!value.is_empty()).then_some(value)
        };

        let environment = Self {
            region: region.to_string(),
            stack_name: stack_name.clone(),
            execution_role_arn,
            bucket,
            subnet_id,
            security_group_id,
            vpc_id: optional(VPC),
            availability_zone: optional(AVAILABILITY_ZONE),
            shared_fs: SharedFsBinding {
                dns_name: optional(FSX_DNS),
                mount_name: optional(FSX_MOUNT),
                openzfs_dns_name: optional(FSX_OPENZFS_DNS),
            },
        };

        if !environment.shared_fs.has_lustre() {
            tracing::warn!("No FSx for Lustre filesystem configured; nodes will not mount /fsx");
        }

        Ok(environment)
    }
}

/// Resolve the target region: config, then the CLI profile, then `us-east-1`.
pub fn resolve_region<P: Prompter>(
    source: &mut ConfigSource<P>,
    cloud: &dyn CloudControl,
) -> String {
    let configured = match cloud.configured_region() {
        Ok(region) => region,
        Err(e) => {
            tracing::warn!("Could not read the CLI region: {e}");
            None
        }
    };
    let default = configured.as_deref().unwrap_or(FALLBACK_REGION);
    source.resolve("aws_region", default, "AWS region").value
}

/// Errors resolving the environment.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("{key} is not set and stack {stack} has no {output} output")]
    Missing {
        key: String,
        output: String,
        stack: String,
    },
}
