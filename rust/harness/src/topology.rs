//! Cluster topology: which instance groups to create and how they are wired.
//!
//! The builder resolves every group through [`ConfigSource`], so the same code
//! path serves a fully declarative config file, an automated run on defaults,
//! and an operator answering prompts.

use std::collections::HashSet;

use hyperpod_config::{
    InstanceRole, InstanceType, ThreadsPerCore, WorkerGroupSpec, default_instance_count,
    default_threads_per_core, default_volume_size_gb,
};
use serde::Serialize;

use crate::{
    cloud::CloudControl,
    config::ConfigError,
    environment::Environment,
    poller::{PollSpec, Sleeper, poll_until_ready},
    reservation::{CapacityReservationBinding, MismatchAction},
    source::{ConfigSource, Prompter},
};

pub const DEFAULT_CLUSTER_NAME: &str = "ml-cluster";
pub const DEFAULT_CONTROLLER_NAME: &str = "controller-machine";
pub const DEFAULT_LOGIN_NAME: &str = "login-group";
pub const DEFAULT_LOGIN_TYPE: &str = "ml.m5.4xlarge";
pub const DEFAULT_SLURM_DB_USER: &str = "admin";
pub const DEFAULT_SLURM_SHARED_DIR: &str = "/fsx/slurm";

/// Service limit on instance groups per cluster.
const MAX_WORKER_GROUPS: usize = 20;

/// Flat keys that define a worker group, as opposed to per-group decisions
/// (`partition_name`, `reservation_<kind>_action`) that apply to either form.
const FLAT_WORKER_FIELDS: [&str; 5] = [
    "instance_type",
    "instance_count",
    "volume_size",
    "threads_per_core",
    "training_plan",
];

/// Coordination stack output keys.
const OUTPUT_DB_ENDPOINT: &str = "SlurmDBEndpointAddress";
const OUTPUT_DB_SECRET: &str = "SlurmDBSecretArn";
const OUTPUT_EXECUTION_ROLE: &str = "SlurmExecutionRoleArn";
const OUTPUT_TOPIC: &str = "SlurmFailOverSNSTopicArn";

/// One group of identically configured instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceGroup {
    pub name: String,
    pub role: InstanceRole,
    pub instance_type: InstanceType,
    pub instance_count: u32,
    pub volume_size_gb: u32,
    pub threads_per_core: ThreadsPerCore,
    pub execution_identity: String,
    pub lifecycle_asset_uri: String,
    #[serde(skip)]
    pub capacity_reservation: Option<CapacityReservationBinding>,
    /// Slurm partition for worker groups. Defaults to the instance type.
    pub partition_name: Option<String>,
}

impl InstanceGroup {
    /// Partition label used in provisioning parameters.
    #[must_use]
    pub fn partition(&self) -> &str {
        self.partition_name
            .as_deref()
            .unwrap_or_else(|| self.instance_type.as_str())
    }
}

/// VPC placement shared by every group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkBinding {
    pub security_group_ids: Vec<String>,
    pub subnet_ids: Vec<String>,
    pub availability_zone: Option<String>,
}

/// Database-backed companion stack enabling two controllers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinationStack {
    pub stack_name: String,
    pub database_endpoint: String,
    pub secret_arn: String,
    pub database_user: String,
    pub shared_directory: String,
    pub topic_arn: String,
    pub execution_role_arn: String,
}

/// The planned cluster. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub cluster_name: String,
    pub groups: Vec<InstanceGroup>,
    pub network: NetworkBinding,
    pub coordination: Option<CoordinationStack>,
}

impl Topology {
    /// The controller group. The builder always creates exactly one.
    #[must_use]
    pub fn controller(&self) -> Option<&InstanceGroup> {
        self.groups
            .iter()
            .find(|g| g.role == InstanceRole::Controller)
    }

    #[must_use]
    pub fn login(&self) -> Option<&InstanceGroup> {
        self.groups.iter().find(|g| g.role == InstanceRole::Login)
    }

    pub fn workers(&self) -> impl Iterator<Item = &InstanceGroup> {
        self.groups.iter().filter(|g| g.role == InstanceRole::Worker)
    }

    /// Number of controller nodes (2 in multi-controller mode).
    #[must_use]
    pub fn controller_nodes(&self) -> u32 {
        self.groups
            .iter()
            .filter(|g| g.role == InstanceRole::Controller)
            .map(|g| g.instance_count)
            .sum()
    }

    #[must_use]
    pub fn is_multi_controller(&self) -> bool {
        self.coordination.is_some()
    }

    /// Total instances of each type, for quota checks.
    #[must_use]
    pub fn instances_by_type(&self) -> Vec<(String, u32)> {
        let mut totals: Vec<(String, u32)> = Vec::new();
        for group in &self.groups {
            let ty = group.instance_type.as_str();
            match totals.iter_mut().find(|(t, _)| t == ty) {
                Some((_, n)) => *n += group.instance_count,
                None => totals.push((ty.to_string(), group.instance_count)),
            }
        }
        totals
    }
}

/// Cloud context the builder needs.
pub struct BuildInputs<'a> {
    pub cloud: &'a dyn CloudControl,
    pub environment: &'a Environment,
    /// Used while waiting for a freshly created coordination stack.
    pub stack_poll: PollSpec,
    pub sleeper: &'a dyn Sleeper,
}

/// Builds a [`Topology`] from config values and cloud lookups.
pub struct TopologyBuilder<'s, 'a, P: Prompter> {
    source: &'s mut ConfigSource<P>,
    inputs: &'s BuildInputs<'a>,
}

impl<'s, 'a, P: Prompter> TopologyBuilder<'s, 'a, P> {
    /// Resolve and validate the full topology.
    pub fn build(
        source: &'s mut ConfigSource<P>,
        inputs: &'s BuildInputs<'a>,
    ) -> Result<Topology, TopologyError> {
        let mut builder = Self { source, inputs };

        let cluster_name = builder.cluster_name();
        let (controller, coordination) = builder.controller()?;
        let mut groups = vec![controller];
        groups.extend(builder.login());

        let workers = builder.workers()?;
        if workers.is_empty() {
            tracing::warn!("No worker groups defined; the cluster will only run a controller");
        }
        groups.extend(workers);
        ensure_unique_names(&mut groups);

        let env = inputs.environment;
        let topology = Topology {
            cluster_name,
            groups,
            network: NetworkBinding {
                security_group_ids: vec![env.security_group_id.clone()],
                subnet_ids: vec![env.subnet_id.clone()],
                availability_zone: env.availability_zone.clone(),
            },
            coordination,
        };

        tracing::info!(
            "Planned {} with {} groups ({} controller nodes)",
            topology.cluster_name,
            topology.groups.len(),
            topology.controller_nodes()
        );
        Ok(topology)
    }

    fn cluster_name(&mut self) -> String {
        let name = self
            .source
            .resolve("cluster_name", DEFAULT_CLUSTER_NAME, "Cluster name")
            .value;
        if is_valid_cluster_name(&name) {
            name
        } else {
            tracing::warn!("Invalid cluster name '{name}', using {DEFAULT_CLUSTER_NAME}");
            DEFAULT_CLUSTER_NAME.to_string()
        }
    }

    fn group(
        &self,
        name: String,
        role: InstanceRole,
        instance_type: InstanceType,
        instance_count: u32,
        volume_size_gb: u32,
    ) -> InstanceGroup {
        let env = self.inputs.environment;
        InstanceGroup {
            name,
            role,
            instance_type,
            instance_count,
            volume_size_gb,
            threads_per_core: ThreadsPerCore::default(),
            execution_identity: env.execution_role_arn.clone(),
            lifecycle_asset_uri: env.lifecycle_uri(),
            capacity_reservation: None,
            partition_name: None,
        }
    }

    fn controller(&mut self) -> Result<(InstanceGroup, Option<CoordinationStack>), TopologyError> {
        let name = self
            .source
            .resolve(
                "controller_name",
                DEFAULT_CONTROLLER_NAME,
                "Controller group name",
            )
            .value;
        let raw_type = self
            .source
            .resolve("controller_type", "", "Controller instance type")
            .value;
        let instance_type: InstanceType =
            raw_type
                .parse()
                .map_err(|reason| TopologyError::ControllerType {
                    value: raw_type.clone(),
                    reason,
                })?;
        let volume = self.volume("controller_volume_size", "Controller volume size (GB)");

        let coordination = if self.source.resolve_bool(
            "multi_headnode",
            false,
            "Run two controllers backed by a shared database",
        ) {
            match self.coordination_stack() {
                Ok(stack) => Some(stack),
                Err(e) => {
                    tracing::warn!("Coordination stack unavailable: {e}");
                    if self.source.resolve_bool(
                        "fallback_single_headnode",
                        true,
                        "Fall back to a single controller",
                    ) {
                        tracing::warn!("Falling back to a single controller");
                        None
                    } else {
                        return Err(e);
                    }
                }
            }
        } else {
            None
        };

        let mut group = self.group(name, InstanceRole::Controller, instance_type, 1, volume);
        if let Some(stack) = &coordination {
            group.instance_count = 2;
            group.execution_identity.clone_from(&stack.execution_role_arn);
        }
        Ok((group, coordination))
    }

    fn coordination_stack(&mut self) -> Result<CoordinationStack, TopologyError> {
        let env = self.inputs.environment;
        let cloud = self.inputs.cloud;
        let stack_name = self
            .source
            .resolve(
                "multi_headnode_stack_name",
                &format!("{}-multi-headnode", env.stack_name),
                "Coordination stack name",
            )
            .value;

        let outputs = match cloud.stack_outputs(&env.region, &stack_name) {
            Ok(outputs) => outputs,
            Err(e) if e.is_not_found() => {
                self.create_coordination_stack(&stack_name)?;
                cloud
                    .stack_outputs(&env.region, &stack_name)
                    .map_err(|e| TopologyError::Coordination(e.to_string()))?
            }
            Err(e) => return Err(TopologyError::Coordination(e.to_string())),
        };

        let output = |key: &str| -> Result<String, TopologyError> {
            outputs
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| {
                    TopologyError::Coordination(format!("stack {stack_name} has no {key} output"))
                })
        };

        let database_endpoint = output(OUTPUT_DB_ENDPOINT)?;
        let secret_arn = output(OUTPUT_DB_SECRET)?;
        let execution_role_arn = output(OUTPUT_EXECUTION_ROLE)?;
        let topic_arn = output(OUTPUT_TOPIC)?;

        let database_user = self
            .source
            .resolve(
                "slurm_database_user",
                DEFAULT_SLURM_DB_USER,
                "Slurm accounting database user",
            )
            .value;
        let shared_directory = self
            .source
            .resolve(
                "slurm_shared_directory",
                DEFAULT_SLURM_SHARED_DIR,
                "Shared Slurm state directory",
            )
            .value;

        Ok(CoordinationStack {
            stack_name,
            database_endpoint,
            secret_arn,
            database_user,
            shared_directory,
            topic_arn,
            execution_role_arn,
        })
    }

    fn create_coordination_stack(&mut self, stack_name: &str) -> Result<(), TopologyError> {
        let env = self.inputs.environment;
        let cloud = self.inputs.cloud;
        let template_url = self
            .source
            .resolve(
                "multi_headnode_template_url",
                "",
                "Coordination stack template URL",
            )
            .value;
        if template_url.is_empty() {
            return Err(TopologyError::Coordination(format!(
                "stack {stack_name} does not exist and no multi_headnode_template_url is set"
            )));
        }

        let mut parameters = vec![
            ("SubnetId".to_string(), env.subnet_id.clone()),
            ("SecurityGroupId".to_string(), env.security_group_id.clone()),
        ];
        if let Some(vpc) = &env.vpc_id {
            parameters.push(("VpcId".to_string(), vpc.clone()));
        }

        tracing::info!("Creating coordination stack {stack_name}");
        cloud
            .create_stack(&env.region, stack_name, &template_url, &parameters)
            .map_err(|e| TopologyError::Coordination(e.to_string()))?;

        let outcome = poll_until_ready(
            stack_name,
            &self.inputs.stack_poll,
            self.inputs.sleeper,
            || cloud.stack_status(&env.region, stack_name),
        );
        if outcome.is_ready() {
            Ok(())
        } else {
            Err(TopologyError::Coordination(format!(
                "stack {stack_name} {outcome}"
            )))
        }
    }

    fn login(&mut self) -> Option<InstanceGroup> {
        if !self
            .source
            .resolve_bool("add_login_group", false, "Add a login group")
        {
            return None;
        }

        let name = self
            .source
            .resolve("login_group_name", DEFAULT_LOGIN_NAME, "Login group name")
            .value;
        let default_type: InstanceType = self.parsed_default(DEFAULT_LOGIN_TYPE)?;
        let instance_type =
            self.source
                .resolve_parsed("login_type", default_type, "Login instance type");
        let volume = self.volume("login_volume_size", "Login volume size (GB)");

        Some(self.group(name, InstanceRole::Login, instance_type, 1, volume))
    }

    fn parsed_default(&self, value: &str) -> Option<InstanceType> {
        match value.parse() {
            Ok(ty) => Some(ty),
            Err(e) => {
                tracing::error!("Built-in instance type {value} is invalid: {e}");
                None
            }
        }
    }

    fn volume(&mut self, key: &str, prompt: &str) -> u32 {
        let default = default_volume_size_gb();
        let size = self.source.resolve_parsed(key, default, prompt);
        if size == 0 {
            tracing::warn!("{key}: volume size must be positive, using {default}");
            default
        } else {
            size
        }
    }

    fn workers(&mut self) -> Result<Vec<InstanceGroup>, TopologyError> {
        let declared = match self.source.document() {
            Some(doc) => {
                let flat: Vec<String> = doc
                    .keys()
                    .filter(|k| is_flat_worker_key(k))
                    .map(String::from)
                    .collect();
                let declared = doc.worker_groups()?;
                if declared.is_some() && !flat.is_empty() {
                    return Err(TopologyError::AmbiguousWorkerGroups { keys: flat });
                }
                declared
            }
            None => None,
        };

        let specs: Vec<(usize, WorkerGroupSpec)> = match declared {
            Some(specs) => {
                for k in MAX_WORKER_GROUPS + 1..=specs.len() {
                    tracing::warn!(
                        "Ignoring worker group {k}: a cluster takes at most {MAX_WORKER_GROUPS} worker groups"
                    );
                }
                specs
                    .into_iter()
                    .take(MAX_WORKER_GROUPS)
                    .enumerate()
                    .map(|(i, spec)| (i + 1, spec))
                    .collect()
            }
            None => self.flat_worker_specs(),
        };

        let mut groups = Vec::new();
        for (k, spec) in specs {
            if let Some(group) = self.worker(k, groups.len() + 1, spec) {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    /// Worker groups from `worker_group_<k>_*` keys or prompts.
    fn flat_worker_specs(&mut self) -> Vec<(usize, WorkerGroupSpec)> {
        let mut specs = Vec::new();
        let interactive = !self.source.mode().is_automated();

        for k in 1..=MAX_WORKER_GROUPS {
            let type_key = format!("worker_group_{k}_instance_type");
            let declared = self.source.document().is_some_and(|d| d.get(&type_key).is_some());
            if !declared
                && !self.source.resolve_bool(
                    &format!("add_worker_group_{k}"),
                    interactive && k == 1,
                    &format!("Add worker group {k}"),
                )
            {
                break;
            }

            let instance_type = self
                .source
                .resolve(&type_key, "", &format!("Worker group {k} instance type"))
                .value;
            let instance_count = self.source.resolve_parsed(
                &format!("worker_group_{k}_instance_count"),
                default_instance_count(),
                &format!("Worker group {k} instance count"),
            );
            let volume_size_gb = self.source.resolve_parsed(
                &format!("worker_group_{k}_volume_size"),
                default_volume_size_gb(),
                &format!("Worker group {k} volume size (GB)"),
            );
            let threads_per_core = self.source.resolve_parsed(
                &format!("worker_group_{k}_threads_per_core"),
                default_threads_per_core(),
                &format!("Worker group {k} threads per core"),
            );
            let training_plan = self
                .source
                .resolve(
                    &format!("worker_group_{k}_training_plan"),
                    "",
                    &format!("Worker group {k} training plan (blank for none)"),
                )
                .value;

            specs.push((
                k,
                WorkerGroupSpec {
                    instance_type: Some(instance_type),
                    instance_count,
                    volume_size_gb,
                    threads_per_core,
                    training_plan: (!training_plan.is_empty()).then_some(training_plan),
                    partition_name: None,
                },
            ));
        }
        specs
    }

    /// Validate one worker entry. `k` keys config lookups, `index` names the group.
    fn worker(&mut self, k: usize, index: usize, spec: WorkerGroupSpec) -> Option<InstanceGroup> {
        let raw_type = spec.instance_type.unwrap_or_default();
        let instance_type: InstanceType = match raw_type.parse() {
            Ok(ty) => ty,
            Err(e) => {
                tracing::warn!("Skipping worker group {k}: {e}");
                return None;
            }
        };

        let instance_count = if spec.instance_count == 0 {
            tracing::warn!(
                "Worker group {k}: instance count must be at least 1, using {}",
                default_instance_count()
            );
            default_instance_count()
        } else {
            spec.instance_count
        };
        let volume_size_gb = if spec.volume_size_gb == 0 {
            tracing::warn!(
                "Worker group {k}: volume size must be positive, using {}",
                default_volume_size_gb()
            );
            default_volume_size_gb()
        } else {
            spec.volume_size_gb
        };
        let threads_per_core = ThreadsPerCore::try_from(spec.threads_per_core).unwrap_or_else(|e| {
            tracing::warn!("Worker group {k}: {e}, using 1");
            ThreadsPerCore::default()
        });

        let mut group = self.group(
            format!("worker-group-{index}"),
            InstanceRole::Worker,
            instance_type,
            instance_count,
            volume_size_gb,
        );
        group.threads_per_core = threads_per_core;

        if let Some(plan) = spec.training_plan.filter(|p| !p.trim().is_empty()) {
            self.bind_reservation(k, &mut group, plan.trim());
        }

        let partition = match spec.partition_name {
            Some(p) if !p.trim().is_empty() => p.trim().to_string(),
            _ => self
                .source
                .resolve(
                    &format!("worker_group_{k}_partition_name"),
                    group.instance_type.as_str(),
                    &format!("Worker group {k} partition name"),
                )
                .value,
        };
        group.partition_name = Some(partition);

        Some(group)
    }

    fn bind_reservation(&mut self, k: usize, group: &mut InstanceGroup, plan: &str) {
        let env = self.inputs.environment;
        let binding = match self.inputs.cloud.describe_training_plan(&env.region, plan) {
            Ok(binding) => binding,
            Err(e) => {
                tracing::warn!("Worker group {k}: dropping training plan {plan}: {e}");
                return;
            }
        };

        let source = &mut *self.source;
        let reconciled = binding.reconcile(
            group.instance_count,
            group.instance_type.as_str(),
            env.availability_zone.as_deref(),
            |mismatch| {
                source.resolve_parsed(
                    &format!("worker_group_{k}_reservation_{}_action", mismatch.kind()),
                    MismatchAction::Correct,
                    &format!("Worker group {k}: {mismatch}. Action (correct/keep/drop)"),
                )
            },
        );

        group.instance_count = reconciled.instance_count;
        if reconciled.instance_type != group.instance_type.as_str() {
            match reconciled.instance_type.parse() {
                Ok(ty) => group.instance_type = ty,
                Err(e) => tracing::warn!("Worker group {k}: reserved type is unusable: {e}"),
            }
        }
        for mismatch in &reconciled.overridden {
            tracing::warn!("Worker group {k}: proceeding despite {mismatch}");
        }
        group.capacity_reservation = reconciled.binding;
    }
}

/// Rename controller or login groups whose name is already taken. Worker
/// groups keep their `worker-group-<n>` names.
fn ensure_unique_names(groups: &mut [InstanceGroup]) {
    let mut taken: HashSet<String> = groups
        .iter()
        .filter(|g| g.role == InstanceRole::Worker)
        .map(|g| g.name.clone())
        .collect();

    for group in groups.iter_mut().filter(|g| g.role != InstanceRole::Worker) {
        if taken.insert(group.name.clone()) {
            continue;
        }
        let base = format!("{}-{}", group.name, group.role);
        let mut candidate = base.clone();
        let mut n = 2;
        while taken.contains(&candidate) {
            candidate = format!("{base}-{n}");
            n += 1;
        }
        tracing::warn!(
            "Instance group name {} is already in use, naming the {} group {candidate}",
            group.name,
            group.role
        );
        taken.insert(candidate.clone());
        group.name = candidate;
    }
}

/// HyperPod cluster names: alphanumeric and hyphens, starting alphanumeric, at most 63.
fn is_valid_cluster_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// `worker_group_<digits>_<field>` for a group-defining field.
fn is_flat_worker_key(key: &str) -> bool {
    key.strip_prefix("worker_group_")
        .and_then(|rest| rest.split_once('_'))
        .is_some_and(|(k, field)| {
            !k.is_empty()
                && k.chars().all(|c| c.is_ascii_digit())
                && FLAT_WORKER_FIELDS.contains(&field)
        })
}

/// Errors building the topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("controller instance type '{value}' is invalid: {reason}")]
    ControllerType { value: String, reason: String },
    #[error(
        "worker groups are declared both as a worker_groups array and as flat keys ({})",
        .keys.join(", ")
    )]
    AmbiguousWorkerGroups { keys: Vec<String> },
    #[error("coordination stack: {0}")]
    Coordination(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TopologyError {
    /// Only controller sizing and an ambiguous worker declaration end the run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ControllerType { .. } | Self::AmbiguousWorkerGroups { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hyperpod_config::RunMode;
    use test_case::test_case;

    use super::*;
    use crate::{
        config::ConfigDocument,
        source::ScriptedPrompter,
        test_utils::{FakeCloud, NoSleep, sample_environment},
    };

    fn automated(toml: &str) -> ConfigSource<ScriptedPrompter> {
        ConfigSource::new(
            Some(ConfigDocument::from_toml_str(toml).unwrap()),
            RunMode::Automated,
            ScriptedPrompter::default(),
        )
    }

    fn build(
        source: &mut ConfigSource<ScriptedPrompter>,
        cloud: &FakeCloud,
    ) -> Result<Topology, TopologyError> {
        let env = sample_environment();
        let sleeper = NoSleep::default();
        let inputs = BuildInputs {
            cloud,
            environment: &env,
            stack_poll: PollSpec::stack(Duration::from_secs(1), Duration::from_secs(5)),
            sleeper: &sleeper,
        };
        TopologyBuilder::build(source, &inputs)
    }

    #[test]
    fn test_single_controller_with_declared_workers() {
        let mut source = automated(
            r#"
controller_type = "ml.m5.12xlarge"
[[worker_groups]]
instance_type = "ml.g5.xlarge"
instance_count = 2
[[worker_groups]]
instance_type = "ml.p5.48xlarge"
[[worker_groups]]
instance_type = "ml.trn1.32xlarge"
partition_name = "trainium"
"#,
        );
        let topology = build(&mut source, &FakeCloud::default()).unwrap();

        let names: Vec<_> = topology.workers().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["worker-group-1", "worker-group-2", "worker-group-3"]);
        assert_eq!(topology.controller_nodes(), 1);
        assert!(topology.login().is_none());
        assert_eq!(topology.groups[1].instance_count, 2);
        assert_eq!(topology.groups[1].partition(), "ml.g5.xlarge");
        assert_eq!(topology.groups[3].partition(), "trainium");
        assert_eq!(topology.cluster_name, DEFAULT_CLUSTER_NAME);
    }

    #[test_case("" ; "missing")]
    #[test_case("controller_type = \"large\"" ; "malformed")]
    fn test_controller_type_is_fatal(toml: &str) {
        let err = build(&mut automated(toml), &FakeCloud::default()).unwrap_err();
        assert!(matches!(err, TopologyError::ControllerType { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_ambiguous_worker_definitions() {
        let mut source = automated(
            r#"
controller_type = "ml.m5.12xlarge"
worker_group_1_instance_type = "ml.g5.xlarge"
[[worker_groups]]
instance_type = "ml.g5.xlarge"
"#,
        );
        let err = build(&mut source, &FakeCloud::default()).unwrap_err();
        assert!(matches!(err, TopologyError::AmbiguousWorkerGroups { ref keys } if keys.len() == 1));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_flat_worker_keys() {
        let mut source = automated(
            r#"
controller_type = "ml.m5.12xlarge"
worker_group_1_instance_type = "ml.g5.xlarge"
worker_group_1_instance_count = 4
worker_group_2_instance_type = "ml.g5.12xlarge"
worker_group_2_threads_per_core = 2
worker_group_2_partition_name = "big"
"#,
        );
        let topology = build(&mut source, &FakeCloud::default()).unwrap();
        let workers: Vec<_> = topology.workers().collect();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].instance_count, 4);
        assert_eq!(workers[1].threads_per_core, ThreadsPerCore::Two);
        assert_eq!(workers[1].partition(), "big");
    }

    #[test]
    fn test_invalid_worker_fields_recovered() {
        let mut source = automated(
            r#"
controller_type = "ml.m5.12xlarge"
[[worker_groups]]
instance_type = "ml.g5.xlarge"
instance_count = 0
volume_size_gb = 0
threads_per_core = 4
[[worker_groups]]
instance_type = "not an instance"
[[worker_groups]]
instance_type = "ml.g5.2xlarge"
"#,
        );
        let topology = build(&mut source, &FakeCloud::default()).unwrap();
        let workers: Vec<_> = topology.workers().collect();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].instance_count, 1);
        assert_eq!(workers[0].volume_size_gb, 500);
        assert_eq!(workers[0].threads_per_core, ThreadsPerCore::One);
        // Names stay contiguous after a skipped entry
        assert_eq!(workers[1].name, "worker-group-2");
    }

    #[test]
    fn test_unparseable_worker_numbers_recovered() {
        let mut source = automated(
            r#"
controller_type = "ml.m5.12xlarge"
[[worker_groups]]
instance_type = "ml.g5.xlarge"
instance_count = -1
threads_per_core = 300
[[worker_groups]]
instance_type = "ml.g5.xlarge"
instance_count = "2"
"#,
        );
        let topology = build(&mut source, &FakeCloud::default()).unwrap();
        let workers: Vec<_> = topology.workers().collect();
        assert_eq!(workers[0].instance_count, 1);
        assert_eq!(workers[0].threads_per_core, ThreadsPerCore::One);
        assert_eq!(workers[1].instance_count, 2);
    }

    #[test]
    fn test_config_errors_are_recoverable() {
        assert!(!TopologyError::Config(ConfigError::NotATable).is_fatal());
    }

    #[test]
    fn test_worker_groups_beyond_limit_ignored() {
        let mut toml = String::from("controller_type = \"ml.m5.12xlarge\"\n");
        for _ in 0..=MAX_WORKER_GROUPS {
            toml.push_str("[[worker_groups]]\ninstance_type = \"ml.g5.xlarge\"\n");
        }
        let topology = build(&mut automated(&toml), &FakeCloud::default()).unwrap();
        let workers: Vec<_> = topology.workers().collect();
        assert_eq!(workers.len(), MAX_WORKER_GROUPS);
        assert_eq!(workers[MAX_WORKER_GROUPS - 1].name, "worker-group-20");
    }

    #[test]
    fn test_clashing_group_names_renamed() {
        let topology = build(
            &mut automated(
                r#"
controller_type = "ml.m5.12xlarge"
controller_name = "dup"
add_login_group = "yes"
login_group_name = "dup"
"#,
            ),
            &FakeCloud::default(),
        )
        .unwrap();
        assert_eq!(topology.controller().unwrap().name, "dup");
        assert_eq!(topology.login().unwrap().name, "dup-login");

        let topology = build(
            &mut automated(
                r#"
controller_type = "ml.m5.12xlarge"
controller_name = "worker-group-1"
[[worker_groups]]
instance_type = "ml.g5.xlarge"
"#,
            ),
            &FakeCloud::default(),
        )
        .unwrap();
        assert_eq!(
            topology.controller().unwrap().name,
            "worker-group-1-controller"
        );
        assert_eq!(topology.workers().next().unwrap().name, "worker-group-1");
    }

    #[test]
    fn test_zero_workers_is_valid() {
        let topology =
            build(&mut automated("controller_type = \"ml.m5.12xlarge\""), &FakeCloud::default())
                .unwrap();
        assert_eq!(topology.workers().count(), 0);
        assert_eq!(topology.groups.len(), 1);
    }

    #[test]
    fn test_login_group() {
        let topology = build(
            &mut automated("controller_type = \"ml.m5.12xlarge\"\nadd_login_group = \"yes\""),
            &FakeCloud::default(),
        )
        .unwrap();
        let login = topology.login().unwrap();
        assert_eq!(login.name, DEFAULT_LOGIN_NAME);
        assert_eq!(login.instance_type.as_str(), DEFAULT_LOGIN_TYPE);
        assert_eq!(login.instance_count, 1);
    }

    #[test]
    fn test_multi_controller_shares_coordination_role() {
        let cloud = FakeCloud::default();
        cloud.add_stack("sagemaker-hyperpod-multi-headnode", FakeCloud::coordination_outputs());
        let topology = build(
            &mut automated("controller_type = \"ml.m5.12xlarge\"\nmulti_headnode = \"yes\""),
            &cloud,
        )
        .unwrap();

        let controller = topology.controller().unwrap();
        assert_eq!(topology.controller_nodes(), 2);
        assert_eq!(controller.execution_identity, "arn:aws:iam::111:role/slurm-exec");
        let stack = topology.coordination.as_ref().unwrap();
        assert_eq!(stack.database_user, DEFAULT_SLURM_DB_USER);
        assert_eq!(stack.shared_directory, DEFAULT_SLURM_SHARED_DIR);
    }

    #[test]
    fn test_coordination_stack_created_from_template() {
        let cloud = FakeCloud::default();
        cloud.add_stack_template(
            "sagemaker-hyperpod-multi-headnode",
            FakeCloud::coordination_outputs(),
        );
        let topology = build(
            &mut automated(
                r#"
controller_type = "ml.m5.12xlarge"
multi_headnode = "yes"
multi_headnode_template_url = "https://example.com/multi-headnode.yaml"
"#,
            ),
            &cloud,
        )
        .unwrap();
        assert!(topology.is_multi_controller());
        assert!(cloud.called("create_stack"));
    }

    #[test]
    fn test_rolled_back_coordination_stack_is_reported() {
        let cloud = FakeCloud::default();
        cloud.add_stack_template(
            "sagemaker-hyperpod-multi-headnode",
            FakeCloud::coordination_outputs(),
        );
        cloud.script_stack_statuses(["CREATE_IN_PROGRESS", "ROLLBACK_COMPLETE"]);
        let err = build(
            &mut automated(
                r#"
controller_type = "ml.m5.12xlarge"
multi_headnode = "yes"
multi_headnode_template_url = "https://example.com/multi-headnode.yaml"
fallback_single_headnode = "no"
"#,
            ),
            &cloud,
        )
        .unwrap_err();
        assert!(matches!(&err, TopologyError::Coordination(reason) if reason.contains("ROLLBACK_COMPLETE")));
    }

    #[test]
    fn test_unresolvable_coordination_falls_back() {
        let topology = build(
            &mut automated("controller_type = \"ml.m5.12xlarge\"\nmulti_headnode = \"yes\""),
            &FakeCloud::default(),
        )
        .unwrap();
        assert_eq!(topology.controller_nodes(), 1);
        assert!(topology.coordination.is_none());
    }

    #[test]
    fn test_unresolvable_coordination_without_fallback() {
        let err = build(
            &mut automated(
                "controller_type = \"ml.m5.12xlarge\"\nmulti_headnode = \"yes\"\nfallback_single_headnode = \"no\"",
            ),
            &FakeCloud::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::Coordination(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_reservation_count_corrected_by_default() {
        let cloud = FakeCloud::default();
        cloud.add_training_plan("plan-a", 4, "ml.p5.48xlarge", "us-east-1a");
        let mut source = automated(
            r#"
controller_type = "ml.m5.12xlarge"
[[worker_groups]]
instance_type = "ml.p5.48xlarge"
instance_count = 6
training_plan = "plan-a"
"#,
        );
        let topology = build(&mut source, &cloud).unwrap();
        let worker = topology.workers().next().unwrap();
        assert_eq!(worker.instance_count, 4);
        assert!(worker.capacity_reservation.is_some());
    }

    #[test]
    fn test_reservation_mismatch_kept_by_operator() {
        let cloud = FakeCloud::default();
        cloud.add_training_plan("plan-a", 4, "ml.p5.48xlarge", "us-east-1a");
        let mut source = automated(
            r#"
controller_type = "ml.m5.12xlarge"
worker_group_1_reservation_count_action = "keep"
[[worker_groups]]
instance_type = "ml.p5.48xlarge"
instance_count = 6
training_plan = "plan-a"
"#,
        );
        let topology = build(&mut source, &cloud).unwrap();
        let worker = topology.workers().next().unwrap();
        assert_eq!(worker.instance_count, 6);
        assert!(worker.capacity_reservation.is_some());
    }

    #[test]
    fn test_each_reservation_mismatch_is_asked() {
        let cloud = FakeCloud::default();
        cloud.add_training_plan("plan-a", 2, "ml.p5.48xlarge", "us-east-1a");
        let mut source = ConfigSource::new(
            Some(
                ConfigDocument::from_toml_str(
                    r#"
cluster_name = "ml-cluster"
controller_name = "controller-machine"
controller_type = "ml.m5.12xlarge"
controller_volume_size = 500
multi_headnode = "no"
add_login_group = "no"
worker_group_1_partition_name = "gpu"
[[worker_groups]]
instance_type = "ml.g5.xlarge"
instance_count = 6
training_plan = "plan-a"
"#,
                )
                .unwrap(),
            ),
            RunMode::Interactive,
            ScriptedPrompter::new(["keep", "correct"]),
        );
        let topology = build(&mut source, &cloud).unwrap();

        let asked = source.prompter().asked();
        assert_eq!(asked.len(), 2);
        assert!(asked[0].contains("requested 6 instances"));
        assert!(asked[1].contains("ml.p5.48xlarge"));
        let worker = topology.workers().next().unwrap();
        assert_eq!(worker.instance_count, 6);
        assert_eq!(worker.instance_type.as_str(), "ml.p5.48xlarge");
        assert!(worker.capacity_reservation.is_some());
    }

    #[test]
    fn test_reservation_in_other_zone_is_dropped() {
        let cloud = FakeCloud::default();
        cloud.add_training_plan("plan-b", 4, "ml.p5.48xlarge", "us-east-1f");
        let mut source = automated(
            r#"
controller_type = "ml.m5.12xlarge"
[[worker_groups]]
instance_type = "ml.p5.48xlarge"
training_plan = "plan-b"
"#,
        );
        let topology = build(&mut source, &cloud).unwrap();
        assert!(topology.workers().next().unwrap().capacity_reservation.is_none());
    }

    #[test]
    fn test_unknown_reservation_is_dropped() {
        let mut source = automated(
            r#"
controller_type = "ml.m5.12xlarge"
[[worker_groups]]
instance_type = "ml.p5.48xlarge"
training_plan = "missing-plan"
"#,
        );
        let topology = build(&mut source, &FakeCloud::default()).unwrap();
        assert!(topology.workers().next().unwrap().capacity_reservation.is_none());
    }

    #[test]
    fn test_interactive_prompts_for_workers() {
        let mut source = ConfigSource::new(
            Some(ConfigDocument::from_toml_str("controller_type = \"ml.m5.12xlarge\"").unwrap()),
            RunMode::Interactive,
            ScriptedPrompter::new([
                "",             // cluster name
                "",             // controller name
                "",             // controller volume
                "no",           // multi_headnode
                "no",           // login group
                "yes",          // add worker group 1
                "ml.g5.xlarge", // type
                "3",            // count
                "",             // volume
                "",             // threads
                "",             // training plan
                "no",           // add worker group 2
                "",             // partition
            ]),
        );
        let topology = build(&mut source, &FakeCloud::default()).unwrap();
        let workers: Vec<_> = topology.workers().collect();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].instance_count, 3);
        assert_eq!(workers[0].partition(), "ml.g5.xlarge");
    }

    #[test]
    fn test_instances_by_type() {
        let topology = build(
            &mut automated(
                r#"
controller_type = "ml.g5.xlarge"
[[worker_groups]]
instance_type = "ml.g5.xlarge"
instance_count = 3
"#,
            ),
            &FakeCloud::default(),
        )
        .unwrap();
        assert_eq!(topology.instances_by_type(), vec![("ml.g5.xlarge".to_string(), 4)]);
    }

    #[test_case("worker_group_1_instance_type", true)]
    #[test_case("worker_group_12_volume_size", true)]
    #[test_case("worker_group_1_reservation_count_action", false)]
    #[test_case("worker_groups", false)]
    #[test_case("worker_group_x_instance_type", false)]
    fn test_flat_worker_key_detection(key: &str, expected: bool) {
        assert_eq!(is_flat_worker_key(key), expected);
    }

    #[test_case("ml-cluster", true)]
    #[test_case("-bad", false)]
    #[test_case("has space", false)]
    fn test_cluster_name_validation(name: &str, expected: bool) {
        assert_eq!(is_valid_cluster_name(name), expected);
    }
}
