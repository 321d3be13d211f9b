//! Cloud control through the `aws` CLI.
//!
//! The CLI is assumed to be installed and authenticated. Every call blocks until
//! the CLI exits; failures carry the CLI's stderr so callers can branch on it.

use std::{collections::HashMap, path::Path, process::Command, time::Duration};

use serde_json::Value;

use crate::reservation::CapacityReservationBinding;

const RETRY_BASE_MS: u64 = 1_000;
const RETRY_MAX_MS: u64 = 8_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Everything the provisioning pipeline asks of the cloud.
pub trait CloudControl {
    /// ARN of the authenticated principal.
    fn caller_identity(&self) -> Result<String, CloudError>;
    /// Region configured for the CLI profile, if any.
    fn configured_region(&self) -> Result<Option<String>, CloudError>;
    fn stack_outputs(&self, region: &str, stack: &str)
    -> Result<HashMap<String, String>, CloudError>;
    fn stack_status(&self, region: &str, stack: &str) -> Result<String, CloudError>;
    /// Create a stack from a template URL, returning the stack id.
    fn create_stack(
        &self,
        region: &str,
        stack: &str,
        template_url: &str,
        parameters: &[(String, String)],
    ) -> Result<String, CloudError>;
    fn sync_directory(&self, local: &Path, uri: &str) -> Result<(), CloudError>;
    fn put_object(&self, local: &Path, uri: &str) -> Result<(), CloudError>;
    fn describe_training_plan(
        &self,
        region: &str,
        plan: &str,
    ) -> Result<CapacityReservationBinding, CloudError>;
    /// Cluster-usage quota for an instance type, if the account has one listed.
    fn instance_quota(&self, region: &str, instance_type: &str) -> Result<Option<u32>, CloudError>;
    /// Submit a cluster descriptor, returning the cluster ARN.
    fn create_cluster(&self, region: &str, descriptor: &Path) -> Result<String, CloudError>;
    fn cluster_status(&self, region: &str, cluster: &str) -> Result<String, CloudError>;
    fn delete_cluster(&self, region: &str, cluster: &str) -> Result<(), CloudError>;
}

/// `CloudControl` backed by the `aws` CLI.
pub struct AwsCli {
    binary: String,
    max_attempts: u32,
}

impl Default for AwsCli {
    fn default() -> Self {
        Self::new("aws")
    }
}

impl AwsCli {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Check if the CLI is installed.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        Command::new("which")
            .arg(&self.binary)
            .output()
            .is_ok_and(|o| o.status.success())
    }

    /// The manual equivalent of [`CloudControl::create_cluster`].
    #[must_use]
    pub fn create_cluster_command(region: &str, descriptor: &Path) -> String {
        format!(
            "aws sagemaker create-cluster --cli-input-json file://{} --region {region}",
            descriptor.display()
        )
    }

    fn run(&self, args: &[&str]) -> Result<String, CloudError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        tracing::debug!("Running: {command}");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| CloudError::Spawn(command.clone(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(CloudError::Command { command, stderr });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a read-only call, retrying throttled attempts with backoff.
    fn run_idempotent(&self, args: &[&str]) -> Result<String, CloudError> {
        let mut attempt = 1;
        loop {
            match self.run(args) {
                Err(e) if e.is_throttling() && attempt < self.max_attempts => {
                    let delay = retry_backoff(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        ?delay,
                        "Throttled, will retry: {e}"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn run_json(&self, args: &[&str], idempotent: bool) -> Result<Value, CloudError> {
        let mut full: Vec<&str> = args.to_vec();
        full.extend(["--output", "json"]);
        let stdout = if idempotent {
            self.run_idempotent(&full)?
        } else {
            self.run(&full)?
        };
        serde_json::from_str(&stdout).map_err(|e| CloudError::Response {
            command: args.join(" "),
            reason: e.to_string(),
        })
    }
}

impl CloudControl for AwsCli {
    fn caller_identity(&self) -> Result<String, CloudError> {
        let v = self.run_json(&["sts", "get-caller-identity"], true)?;
        string_field(&v, "Arn", "sts get-caller-identity")
    }

    fn configured_region(&self) -> Result<Option<String>, CloudError> {
        // `configure get` exits 1 when the key is unset
        match self.run(&["configure", "get", "region"]) {
            Ok(out) => {
                let region = out.trim();
                Ok((!region.is_empty()).then(|| region.to_string()))
            }
            Err(CloudError::Command { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stack_outputs(
        &self,
        region: &str,
        stack: &str,
    ) -> Result<HashMap<String, String>, CloudError> {
        let v = self.run_json(
            &[
                "cloudformation",
                "describe-stacks",
                "--stack-name",
                stack,
                "--region",
                region,
            ],
            true,
        )?;
        parse_stack_outputs(&v)
    }

    fn stack_status(&self, region: &str, stack: &str) -> Result<String, CloudError> {
        let v = self.run_json(
            &[
                "cloudformation",
                "describe-stacks",
                "--stack-name",
                stack,
                "--region",
                region,
            ],
            true,
        )?;
        let first = v
            .get("Stacks")
            .and_then(|s| s.get(0))
            .ok_or_else(|| CloudError::Response {
                command: "cloudformation describe-stacks".to_string(),
                reason: format!("no stack named {stack}"),
            })?;
        string_field(first, "StackStatus", "cloudformation describe-stacks")
    }

    fn create_stack(
        &self,
        region: &str,
        stack: &str,
        template_url: &str,
        parameters: &[(String, String)],
    ) -> Result<String, CloudError> {
        let params: Vec<String> = parameters
            .iter()
            .map(|(k, v)| format!("ParameterKey={k},ParameterValue={v}"))
            .collect();
        let mut args = vec![
            "cloudformation",
            "create-stack",
            "--stack-name",
            stack,
            "--template-url",
            template_url,
            "--capabilities",
            "CAPABILITY_NAMED_IAM",
            "--region",
            region,
        ];
        if !params.is_empty() {
            args.push("--parameters");
            args.extend(params.iter().map(String::as_str));
        }
        let v = self.run_json(&args, false)?;
        string_field(&v, "StackId", "cloudformation create-stack")
    }

    fn sync_directory(&self, local: &Path, uri: &str) -> Result<(), CloudError> {
        let local = local.display().to_string();
        self.run(&["s3", "sync", &local, uri, "--only-show-errors"])?;
        Ok(())
    }

    fn put_object(&self, local: &Path, uri: &str) -> Result<(), CloudError> {
        let local = local.display().to_string();
        self.run(&["s3", "cp", &local, uri, "--only-show-errors"])?;
        Ok(())
    }

    fn describe_training_plan(
        &self,
        region: &str,
        plan: &str,
    ) -> Result<CapacityReservationBinding, CloudError> {
        let name = plan.rsplit('/').next().unwrap_or(plan);
        let v = self.run_json(
            &[
                "sagemaker",
                "describe-training-plan",
                "--training-plan-name",
                name,
                "--region",
                region,
            ],
            true,
        )?;
        parse_training_plan(&v)
    }

    fn instance_quota(&self, region: &str, instance_type: &str) -> Result<Option<u32>, CloudError> {
        let v = self.run_json(
            &[
                "service-quotas",
                "list-service-quotas",
                "--service-code",
                "sagemaker",
                "--region",
                region,
            ],
            true,
        )?;
        Ok(parse_cluster_quota(&v, instance_type))
    }

    fn create_cluster(&self, region: &str, descriptor: &Path) -> Result<String, CloudError> {
        let input = format!("file://{}", descriptor.display());
        let v = self.run_json(
            &[
                "sagemaker",
                "create-cluster",
                "--cli-input-json",
                &input,
                "--region",
                region,
            ],
            false,
        )?;
        string_field(&v, "ClusterArn", "sagemaker create-cluster")
    }

    fn cluster_status(&self, region: &str, cluster: &str) -> Result<String, CloudError> {
        let v = self.run_json(
            &[
                "sagemaker",
                "describe-cluster",
                "--cluster-name",
                cluster,
                "--region",
                region,
            ],
            true,
        )?;
        string_field(&v, "ClusterStatus", "sagemaker describe-cluster")
    }

    fn delete_cluster(&self, region: &str, cluster: &str) -> Result<(), CloudError> {
        self.run(&[
            "sagemaker",
            "delete-cluster",
            "--cluster-name",
            cluster,
            "--region",
            region,
        ])?;
        Ok(())
    }
}

/// Delay before retry number `attempt` (1-based): 1s, 2s, 4s, capped at 8s.
pub(crate) fn retry_backoff(attempt: u32) -> Duration {
    let delay_ms = RETRY_BASE_MS.saturating_mul(2u64.pow(attempt.saturating_sub(1).min(16)));
    Duration::from_millis(delay_ms.min(RETRY_MAX_MS))
}

fn string_field(v: &Value, key: &str, command: &str) -> Result<String, CloudError> {
    v.get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| CloudError::Response {
            command: command.to_string(),
            reason: format!("missing {key}"),
        })
}

fn parse_stack_outputs(v: &Value) -> Result<HashMap<String, String>, CloudError> {
    let stack = v
        .get("Stacks")
        .and_then(|s| s.get(0))
        .ok_or_else(|| CloudError::Response {
            command: "cloudformation describe-stacks".to_string(),
            reason: "no stacks in response".to_string(),
        })?;

    Ok(stack
        .get("Outputs")
        .and_then(Value::as_array)
        .map(|outputs| {
            outputs
                .iter()
                .filter_map(|o| {
                    Some((
                        o.get("OutputKey")?.as_str()?.to_string(),
                        o.get("OutputValue")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default())
}

fn parse_training_plan(v: &Value) -> Result<CapacityReservationBinding, CloudError> {
    const COMMAND: &str = "sagemaker describe-training-plan";
    let count = |key: &str| -> Result<u32, CloudError> {
        v.get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| CloudError::Response {
                command: COMMAND.to_string(),
                reason: format!("missing {key}"),
            })
    };
    let summary = v
        .get("ReservedCapacitySummaries")
        .and_then(|s| s.get(0))
        .ok_or_else(|| CloudError::Response {
            command: COMMAND.to_string(),
            reason: "no reserved capacity in plan".to_string(),
        })?;

    Ok(CapacityReservationBinding {
        reservation_id: string_field(v, "TrainingPlanArn", COMMAND)?,
        total_capacity: count("TotalInstanceCount")?,
        available_capacity: count("AvailableInstanceCount")?,
        bound_instance_type: string_field(summary, "InstanceType", COMMAND)?,
        availability_zone: string_field(summary, "AvailabilityZone", COMMAND)?,
    })
}

fn parse_cluster_quota(v: &Value, instance_type: &str) -> Option<u32> {
    let wanted = format!("{instance_type} for cluster usage");
    v.get("Quotas")?
        .as_array()?
        .iter()
        .find(|q| q.get("QuotaName").and_then(Value::as_str) == Some(wanted.as_str()))
        .and_then(|q| q.get("Value")?.as_f64())
        .map(|value| value as u32)
}

/// Errors returned by cloud calls.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("failed to run {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("unexpected response from {command}: {reason}")]
    Response { command: String, reason: String },
}

impl CloudError {
    fn stderr(&self) -> &str {
        match self {
            Self::Command { stderr, .. } => stderr,
            _ => "",
        }
    }

    /// The service rejected the call for rate limiting.
    #[must_use]
    pub fn is_throttling(&self) -> bool {
        let stderr = self.stderr();
        ["Throttling", "Rate exceeded", "RequestLimitExceeded", "TooManyRequests"]
            .iter()
            .any(|marker| stderr.contains(marker))
    }

    /// The resource being created is already there.
    #[must_use]
    pub fn already_exists(&self) -> bool {
        let stderr = self.stderr().to_lowercase();
        stderr.contains("already exists") || stderr.contains("resourceinuse")
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr().to_lowercase();
        stderr.contains("does not exist") || stderr.contains("not found")
    }
}
