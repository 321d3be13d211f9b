//! The provisioning pipeline.
//!
//! Stages run strictly in order. A failing stage is either fatal (the run
//! stops), or recovered according to the run mode: automated runs log and
//! carry on, interactive runs ask the operator whether to continue.

use std::path::PathBuf;

use hyperpod_config::WorkloadManager;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    cloud::{AwsCli, CloudControl, CloudError},
    config::{ConfigDocument, ConfigError, USERS_KEY},
    descriptor::{self, DescriptorError, DescriptorPaths, Descriptors, PROVISIONING_DESCRIPTOR_FILE},
    environment::{Environment, EnvironmentError, resolve_region},
    poller::{PollOutcome, PollSpec, Sleeper, poll_until_ready},
    source::{ConfigSource, Prompter},
    state::{PipelineState, Stage, StageOutcome, StateError},
    topology::{BuildInputs, Topology, TopologyBuilder, TopologyError},
    users::{self, DEFAULT_HOME_ROOT, USERS_FILE, UsersError},
};

pub const DEFAULT_LIFECYCLE_DIR: &str = "LifecycleScripts/base-config";

const CONTINUE: &str = "continue";
const ABORT: &str = "abort";

/// Knobs fixed for the whole run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Where descriptors and the users file are written.
    pub output_dir: PathBuf,
    /// Overrides the `lifecycle_dir` config key.
    pub lifecycle_dir: Option<PathBuf>,
    pub cluster_poll: PollSpec,
    pub stack_poll: PollSpec,
    pub workload_manager: WorkloadManager,
    /// Stop after validation without touching the cloud.
    pub dry_run: bool,
    pub show_progress: bool,
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub state: PipelineState,
    pub caller_identity: Option<String>,
    pub region: Option<String>,
    pub environment: Option<Environment>,
    pub topology: Option<Topology>,
    pub descriptors: Option<DescriptorPaths>,
    pub cluster_arn: Option<String>,
    /// Equivalent CLI command, set when cluster creation failed.
    pub manual_command: Option<String>,
    pub readiness: Option<PollOutcome>,
    pub users_file: Option<PathBuf>,
}

impl PipelineReport {
    fn finish(mut self, state: PipelineState) -> Self {
        self.state = state;
        self
    }

    /// No stage ended fatally.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state.fatal().is_none()
    }
}

/// Drives every stage against one cloud.
pub struct OrchestrationPipeline<'a, P: Prompter> {
    source: ConfigSource<P>,
    cloud: &'a dyn CloudControl,
    sleeper: &'a dyn Sleeper,
    options: PipelineOptions,
    manual_command: Option<String>,
    readiness: Option<PollOutcome>,
}

impl<'a, P: Prompter> OrchestrationPipeline<'a, P> {
    #[must_use]
    pub fn new(
        source: ConfigSource<P>,
        cloud: &'a dyn CloudControl,
        sleeper: &'a dyn Sleeper,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            cloud,
            sleeper,
            options,
            manual_command: None,
            readiness: None,
        }
    }

    /// Run every stage. Only an illegal stage transition is returned as an error;
    /// stage failures are recorded in the report.
    pub fn run(mut self) -> Result<PipelineReport, PipelineError> {
        let mut report = PipelineReport::default();
        let state = PipelineState::new();

        let (state, identity) = self.step(state, Stage::Prerequisites, |p| {
            Ok(p.cloud.caller_identity()?)
        })?;
        report.caller_identity = identity;
        if state.is_halted() {
            return Ok(report.finish(state));
        }

        let (state, region) = self.step(state, Stage::RegionResolution, |p| {
            Ok(resolve_region(&mut p.source, p.cloud))
        })?;
        let Some(region) = region else {
            return Ok(report.finish(state));
        };
        report.region = Some(region.clone());

        let (state, environment) = self.step(state, Stage::EnvironmentResolution, |p| {
            Ok(Environment::resolve(&mut p.source, p.cloud, &region)?)
        })?;
        report.environment.clone_from(&environment);
        if state.is_halted() {
            return Ok(report.finish(state));
        }

        let state = if self.options.dry_run {
            tracing::info!("Dry run: skipping lifecycle asset staging");
            state
        } else {
            let (state, _) = self.step(state, Stage::LifecycleAssetStaging, |p| {
                p.stage_assets(require(environment.as_ref(), "environment")?)
            })?;
            state
        };
        if state.is_halted() {
            return Ok(report.finish(state));
        }

        let (state, built) = self.step(state, Stage::TopologyBuild, |p| {
            p.build(require(environment.as_ref(), "environment")?)
        })?;
        if state.is_halted() {
            return Ok(report.finish(state));
        }

        let (state, _) = self.step(state, Stage::DescriptorValidation, |p| {
            let (topology, descriptors, paths) = require(built.as_ref(), "topology")?;
            p.validate(
                require(environment.as_ref(), "environment")?,
                topology,
                descriptors,
                paths,
            )
        })?;
        let Some((topology, _, paths)) = built else {
            return Ok(report.finish(state));
        };
        let cluster_name = topology.cluster_name.clone();
        report.topology = Some(topology);
        report.descriptors = Some(paths.clone());
        if state.is_halted() || self.options.dry_run {
            return Ok(report.finish(state));
        }

        let (state, arn) = self.step(state, Stage::ClusterCreationRequest, |p| {
            p.create_cluster(&region, &paths)
        })?;
        report.cluster_arn = arn.flatten();
        report.manual_command = self.manual_command.take();
        if state.is_halted() {
            return Ok(report.finish(state));
        }

        let (state, _) = self.step(state, Stage::ReadinessPolling, |p| {
            p.await_ready(&region, &cluster_name)
        })?;
        report.readiness = self.readiness.take();
        if state.outcome(Stage::ReadinessPolling) != &StageOutcome::Succeeded {
            return Ok(report.finish(state));
        }

        let Some(environment) = environment else {
            return Ok(report.finish(state));
        };
        if !self.wants_users() {
            return Ok(report.finish(state));
        }
        let (state, users_file) = self.step(state, Stage::UserProvisioning, |p| {
            p.provision_users(&environment)
        })?;
        report.users_file = users_file;

        Ok(report.finish(state))
    }

    /// Run one stage and record its outcome.
    fn step<T, F>(
        &mut self,
        state: PipelineState,
        stage: Stage,
        f: F,
    ) -> Result<(PipelineState, Option<T>), PipelineError>
    where
        F: FnOnce(&mut Self) -> Result<T, PipelineError>,
    {
        let state = state.start(stage)?;
        tracing::info!("==> {stage}");

        let (outcome, value) = match f(self) {
            Ok(value) => (StageOutcome::Succeeded, Some(value)),
            Err(e) => (self.recover(stage, &e), None),
        };
        Ok((state.record(stage, outcome)?, value))
    }

    /// Decide what a stage failure means for the rest of the run.
    fn recover(&mut self, stage: Stage, error: &PipelineError) -> StageOutcome {
        let reason = error.to_string();
        tracing::error!("{stage} failed: {reason}");

        if error.is_fatal() {
            return StageOutcome::FailedFatal(reason);
        }
        let automated = self.source.mode().is_automated();
        if automated && stage == Stage::ClusterCreationRequest {
            return StageOutcome::FailedFatal(reason);
        }

        let choice = self.source.resolve_choice(
            &format!("on_failure_{}", stage.key()),
            &[CONTINUE, ABORT],
            CONTINUE,
            &format!("{stage} failed. Continue or abort"),
        );
        if choice == ABORT {
            tracing::error!("Aborting after {stage}");
            StageOutcome::FailedFatal(reason)
        } else {
            tracing::warn!("Continuing after failed {stage}");
            StageOutcome::FailedRecovered(reason)
        }
    }

    fn lifecycle_dir(&mut self) -> PathBuf {
        if let Some(dir) = &self.options.lifecycle_dir {
            return dir.clone();
        }
        PathBuf::from(
            self.source
                .resolve(
                    "lifecycle_dir",
                    DEFAULT_LIFECYCLE_DIR,
                    "Local lifecycle script directory",
                )
                .value,
        )
    }

    fn stage_assets(&mut self, environment: &Environment) -> Result<(), PipelineError> {
        let dir = self.lifecycle_dir();
        if !dir.is_dir() {
            return Err(PipelineError::LifecycleDir(dir));
        }
        let uri = environment.lifecycle_uri();
        tracing::info!("Uploading {} to {uri}", dir.display());
        self.cloud.sync_directory(&dir, &uri)?;
        Ok(())
    }

    fn build(
        &mut self,
        environment: &Environment,
    ) -> Result<(Topology, Descriptors, DescriptorPaths), PipelineError> {
        let inputs = BuildInputs {
            cloud: self.cloud,
            environment,
            stack_poll: self.options.stack_poll.clone(),
            sleeper: self.sleeper,
        };
        let topology = TopologyBuilder::build(&mut self.source, &inputs)?;
        let descriptors = descriptor::write(
            &topology,
            &environment.shared_fs,
            self.options.workload_manager,
        )?;
        let paths = descriptors.write_to_dir(&self.options.output_dir)?;
        Ok((topology, descriptors, paths))
    }

    fn validate(
        &mut self,
        environment: &Environment,
        topology: &Topology,
        descriptors: &Descriptors,
        paths: &DescriptorPaths,
    ) -> Result<(), PipelineError> {
        descriptors.validate()?;
        self.check_quotas(&environment.region, topology);

        if self.options.dry_run {
            tracing::info!("Dry run: not uploading {PROVISIONING_DESCRIPTOR_FILE}");
            return Ok(());
        }
        let uri = format!(
            "{}/{PROVISIONING_DESCRIPTOR_FILE}",
            environment.lifecycle_uri()
        );
        self.cloud.put_object(&paths.provisioning, &uri)?;
        Ok(())
    }

    /// Warn when the plan exceeds the account's cluster quota. Never fails.
    fn check_quotas(&self, region: &str, topology: &Topology) {
        for (instance_type, count) in topology.instances_by_type() {
            match self.cloud.instance_quota(region, &instance_type) {
                Ok(Some(quota)) if count > quota => tracing::warn!(
                    "Plan needs {count} x {instance_type} but the account quota is {quota}"
                ),
                Ok(Some(_)) => {}
                Ok(None) => tracing::debug!("No cluster quota listed for {instance_type}"),
                Err(e) => tracing::warn!("Could not check quota for {instance_type}: {e}"),
            }
        }
    }

    fn create_cluster(
        &mut self,
        region: &str,
        paths: &DescriptorPaths,
    ) -> Result<Option<String>, PipelineError> {
        match self.cloud.create_cluster(region, &paths.cluster) {
            Ok(arn) => {
                tracing::info!("Cluster creation requested: {arn}");
                Ok(Some(arn))
            }
            Err(e) if e.already_exists() => {
                tracing::warn!("Cluster already exists, continuing");
                Ok(None)
            }
            Err(e) => {
                let command = AwsCli::create_cluster_command(region, &paths.cluster);
                tracing::warn!("Create the cluster manually with:\n  {command}");
                self.manual_command = Some(command);
                Err(e.into())
            }
        }
    }

    fn await_ready(&mut self, region: &str, cluster: &str) -> Result<(), PipelineError> {
        let outcome = wait_for_cluster(
            self.cloud,
            region,
            cluster,
            &self.options.cluster_poll,
            self.sleeper,
            self.options.show_progress,
        );
        self.readiness = Some(outcome.clone());
        if outcome.is_ready() {
            Ok(())
        } else {
            Err(PipelineError::NotReady {
                cluster: cluster.to_string(),
                outcome,
            })
        }
    }

    fn wants_users(&mut self) -> bool {
        let declared = self
            .source
            .document()
            .is_some_and(|d| d.contains(USERS_KEY) || d.contains("usernames"));
        self.source
            .resolve_bool("create_users", declared, "Create shared users on the cluster")
    }

    fn provision_users(&mut self, environment: &Environment) -> Result<PathBuf, PipelineError> {
        let declared = self
            .source
            .document()
            .map(ConfigDocument::users)
            .transpose()?
            .flatten();
        let specs = match declared {
            Some(specs) => specs,
            _ => users::parse_usernames(
                &self
                    .source
                    .resolve("usernames", "", "Usernames (comma separated)")
                    .value,
            ),
        };
        if specs.is_empty() {
            return Err(PipelineError::NoUsers);
        }

        let planned = users::plan_users(&specs, DEFAULT_HOME_ROOT)?;
        let path = users::write_users_file(&self.options.output_dir, &planned)?;
        let uri = format!("{}/{USERS_FILE}", environment.lifecycle_uri());
        self.cloud.put_object(&path, &uri)?;
        Ok(path)
    }
}

fn require<'v, T>(value: Option<&'v T>, what: &'static str) -> Result<&'v T, PipelineError> {
    value.ok_or(PipelineError::Blocked(what))
}

/// Poll a cluster until it is in service, with a spinner when `show_progress` is set.
pub fn wait_for_cluster(
    cloud: &dyn CloudControl,
    region: &str,
    cluster: &str,
    spec: &PollSpec,
    sleeper: &dyn Sleeper,
    show_progress: bool,
) -> PollOutcome {
    let pb = if show_progress {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::hidden()
    };
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb.set_message(format!("{cluster}: waiting"));

    let outcome = poll_until_ready(cluster, spec, sleeper, || {
        let status = cloud.cluster_status(region, cluster);
        match &status {
            Ok(state) => pb.set_message(format!("{cluster}: {state}")),
            Err(e) => pb.set_message(format!("{cluster}: {e}")),
        }
        status
    });

    pb.finish_with_message(format!("{cluster}: {outcome}"));
    outcome
}

/// Errors that can occur while running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),
    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("users error: {0}")]
    Users(#[from] UsersError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("lifecycle directory {} does not exist", .0.display())]
    LifecycleDir(PathBuf),
    #[error("{0} is unavailable because an earlier stage failed")]
    Blocked(&'static str),
    #[error("cluster {cluster} {outcome}")]
    NotReady {
        cluster: String,
        outcome: PollOutcome,
    },
    #[error("no users to provision")]
    NoUsers,
}

impl PipelineError {
    /// Failures no operator decision can recover from.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Topology(e) => e.is_fatal(),
            Self::Descriptor(e) => matches!(e, DescriptorError::Bijection { .. }),
            Self::State(_) | Self::Blocked(_) | Self::NotReady { .. } => true,
            Self::Cloud(_)
            | Self::Environment(_)
            | Self::Users(_)
            | Self::Config(_)
            | Self::LifecycleDir(_)
            | Self::NoUsers => false,
        }
    }
}
