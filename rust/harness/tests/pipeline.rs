//! End-to-end pipeline runs against a scripted cloud.
//!
//! These tests verify that the pipeline:
//! 1. Produces consistent descriptors for single and multi controller plans
//! 2. Leaves the cloud untouched on a dry run
//! 3. Treats creation and readiness failures according to the run mode
//! 4. Lets an interactive operator continue or abort after a failed stage

use std::{path::PathBuf, time::Duration};

use hyperpod_config::{RunMode, WorkloadManager};
use hyperpod_harness::{
    config::ConfigDocument,
    descriptor::NodeProvisioningDescriptor,
    pipeline::{OrchestrationPipeline, PipelineOptions, PipelineReport},
    poller::{PollOutcome, PollSpec},
    source::ConfigSource,
    state::{Stage, StageOutcome},
    test_utils::{FakeCloud, NoSleep, ScriptedPrompter},
};
use tempfile::{TempDir, tempdir};

const SINGLE_HEADNODE: &str = r#"
controller_type = "m.large"
add_login_group = "no"
multi_headnode = "no"

[[worker_groups]]
instance_type = "g.xlarge"
instance_count = 2
"#;

struct Workspace {
    _dir: TempDir,
    output: PathBuf,
    lifecycle: PathBuf,
}

fn workspace() -> Workspace {
    let dir = tempdir().unwrap();
    let lifecycle = dir.path().join("lifecycle");
    std::fs::create_dir_all(&lifecycle).unwrap();
    std::fs::write(lifecycle.join("on_create.sh"), "#!/bin/bash\n").unwrap();
    Workspace {
        output: dir.path().join("out"),
        lifecycle,
        _dir: dir,
    }
}

fn run(cloud: &FakeCloud, ws: &Workspace, toml: &str, dry_run: bool) -> PipelineReport {
    run_with(
        cloud,
        ws,
        toml,
        RunMode::Automated,
        &mut ScriptedPrompter::default(),
        dry_run,
    )
}

fn run_with(
    cloud: &FakeCloud,
    ws: &Workspace,
    toml: &str,
    mode: RunMode,
    prompter: &mut ScriptedPrompter,
    dry_run: bool,
) -> PipelineReport {
    let source = ConfigSource::new(
        Some(ConfigDocument::from_toml_str(toml).unwrap()),
        mode,
        prompter,
    );
    let options = PipelineOptions {
        output_dir: ws.output.clone(),
        lifecycle_dir: Some(ws.lifecycle.clone()),
        cluster_poll: PollSpec::cluster(Duration::from_secs(1), Duration::from_secs(3)),
        stack_poll: PollSpec::stack(Duration::from_secs(1), Duration::from_secs(3)),
        workload_manager: WorkloadManager::Slurm,
        dry_run,
        show_progress: false,
    };
    let sleeper = NoSleep::default();
    OrchestrationPipeline::new(source, cloud, &sleeper, options)
        .run()
        .unwrap()
}

fn provisioning(report: &PipelineReport) -> NodeProvisioningDescriptor {
    let path = &report.descriptors.as_ref().unwrap().provisioning;
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_single_headnode_end_to_end() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.script_cluster_statuses(["Creating", "Creating", "InService"]);

    let report = run(&cloud, &ws, SINGLE_HEADNODE, false);

    assert!(report.is_success(), "{:?}", report.state.records());
    assert_eq!(report.region.as_deref(), Some("us-east-1"));
    assert!(matches!(report.readiness, Some(PollOutcome::Ready)));
    assert!(report.state.outcome(Stage::UserProvisioning).is_pending());

    let submitted = cloud.submitted_descriptor().unwrap();
    assert_eq!(submitted["ClusterName"], "ml-cluster");
    let groups = submitted["InstanceGroups"].as_array().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["InstanceGroupName"], "controller-machine");
    assert_eq!(groups[0]["InstanceCount"], 1);
    assert_eq!(groups[1]["InstanceGroupName"], "worker-group-1");
    assert_eq!(groups[1]["InstanceCount"], 2);
    assert_eq!(groups[1]["LifeCycleConfig"]["SourceS3Uri"], "s3://hyperpod-bucket/src");

    let params = provisioning(&report);
    assert_eq!(params.controller_group, "controller-machine");
    assert!(params.login_group.is_none());
    assert_eq!(params.worker_groups.len(), 1);
    assert_eq!(params.worker_groups[0].instance_group_name, "worker-group-1");
    assert_eq!(params.worker_groups[0].partition_name, "g.xlarge");
    assert!(params.slurm_configurations.is_none());

    let uploads: Vec<String> = cloud.uploads().into_iter().map(|(_, uri)| uri).collect();
    assert_eq!(
        uploads,
        [
            "s3://hyperpod-bucket/src",
            "s3://hyperpod-bucket/src/provisioning_parameters.json"
        ]
    );
}

#[test]
fn test_multi_headnode_end_to_end() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.add_stack(
        "sagemaker-hyperpod-multi-headnode",
        FakeCloud::coordination_outputs(),
    );
    let toml = SINGLE_HEADNODE.replace("multi_headnode = \"no\"", "multi_headnode = \"yes\"");

    let report = run(&cloud, &ws, &toml, false);

    assert!(report.is_success(), "{:?}", report.state.records());
    let submitted = cloud.submitted_descriptor().unwrap();
    assert_eq!(submitted["InstanceGroups"][0]["InstanceCount"], 2);
    assert_eq!(
        submitted["InstanceGroups"][0]["ExecutionRole"],
        "arn:aws:iam::111:role/slurm-exec"
    );

    let slurm = provisioning(&report).slurm_configurations.unwrap();
    for field in [
        &slurm.slurm_database_endpoint,
        &slurm.slurm_database_secret_arn,
        &slurm.slurm_database_user,
        &slurm.slurm_shared_directory,
        &slurm.slurm_sns_arn,
    ] {
        assert!(!field.is_empty());
    }
}

#[test]
fn test_dry_run_leaves_cloud_untouched() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();

    let report = run(&cloud, &ws, SINGLE_HEADNODE, true);

    assert!(report.state.fatal().is_none());
    assert_eq!(
        report.state.outcome(Stage::DescriptorValidation),
        &StageOutcome::Succeeded
    );
    for stage in [
        Stage::LifecycleAssetStaging,
        Stage::ClusterCreationRequest,
        Stage::ReadinessPolling,
    ] {
        assert!(report.state.outcome(stage).is_pending(), "{stage}");
    }
    assert!(!cloud.called("sync_directory"));
    assert!(!cloud.called("put_object"));
    assert!(!cloud.called("create_cluster"));
    assert!(report.descriptors.unwrap().cluster.exists());
}

#[test]
fn test_creation_failure_is_fatal_when_automated() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.fail("create_cluster", "AccessDeniedException: not authorized");

    let report = run(&cloud, &ws, SINGLE_HEADNODE, false);

    let (stage, reason) = report.state.fatal().unwrap();
    assert_eq!(stage, Stage::ClusterCreationRequest);
    assert!(reason.contains("not authorized"));
    assert!(
        report
            .manual_command
            .as_deref()
            .unwrap()
            .contains("sagemaker create-cluster --cli-input-json")
    );
    assert!(report.state.outcome(Stage::ReadinessPolling).is_pending());
    assert!(!cloud.called("cluster_status"));
}

#[test]
fn test_existing_cluster_counts_as_created() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.fail(
        "create_cluster",
        "ResourceInUse: Cluster ml-cluster already exists",
    );
    cloud.script_cluster_statuses(["InService"]);

    let report = run(&cloud, &ws, SINGLE_HEADNODE, false);

    assert!(report.is_success(), "{:?}", report.state.records());
    assert!(report.cluster_arn.is_none());
    assert!(report.manual_command.is_none());
}

#[test]
fn test_readiness_timeout_reports_not_ready() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.script_cluster_statuses(["Creating"]);

    let report = run(&cloud, &ws, SINGLE_HEADNODE, false);

    let (stage, reason) = report.state.fatal().unwrap();
    assert_eq!(stage, Stage::ReadinessPolling);
    assert!(reason.contains("not yet ready"));
    assert!(matches!(
        report.readiness,
        Some(PollOutcome::TimedOut { attempts: 3, .. })
    ));
    assert!(report.state.outcome(Stage::UserProvisioning).is_pending());
}

#[test]
fn test_failed_cluster_stops_polling() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.script_cluster_statuses(["Creating", "Failed"]);

    let report = run(&cloud, &ws, SINGLE_HEADNODE, false);

    assert_eq!(report.state.fatal().unwrap().0, Stage::ReadinessPolling);
    assert!(matches!(report.readiness, Some(PollOutcome::Failed(_))));
}

#[test]
fn test_users_provisioned_after_ready() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    let toml = format!(
        "{SINGLE_HEADNODE}\n[[users]]\nusername = \"alice\"\n\n[[users]]\nusername = \"bob\"\nuid = 3000\n"
    );

    let report = run(&cloud, &ws, &toml, false);

    assert_eq!(
        report.state.outcome(Stage::UserProvisioning),
        &StageOutcome::Succeeded
    );
    let path = report.users_file.unwrap();
    assert_eq!(
        std::fs::read_to_string(path).unwrap(),
        "alice,2001,/fsx/alice\nbob,3000,/fsx/bob\n"
    );
    assert!(
        cloud
            .uploads()
            .iter()
            .any(|(_, uri)| uri == "s3://hyperpod-bucket/src/shared_users.txt")
    );
}

#[test]
fn test_missing_environment_blocks_later_stages() {
    let ws = workspace();
    let cloud = FakeCloud::default();

    let report = run(&cloud, &ws, SINGLE_HEADNODE, false);

    assert!(matches!(
        report.state.outcome(Stage::EnvironmentResolution),
        StageOutcome::FailedRecovered(_)
    ));
    assert_eq!(
        report.state.fatal().unwrap().0,
        Stage::LifecycleAssetStaging
    );
    assert!(!cloud.called("create_cluster"));
}

#[test]
fn test_abort_on_recoverable_failure() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.fail("sync_directory", "upload failed: AccessDenied");
    let toml = format!("on_failure_lifecycle_asset_staging = \"abort\"\n{SINGLE_HEADNODE}");

    let report = run(&cloud, &ws, &toml, false);

    assert_eq!(
        report.state.fatal().unwrap().0,
        Stage::LifecycleAssetStaging
    );
    assert!(report.state.outcome(Stage::TopologyBuild).is_pending());
}

#[test]
fn test_quota_shortfall_only_warns() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.set_quota("g.xlarge", 1);

    let report = run(&cloud, &ws, SINGLE_HEADNODE, true);

    assert!(report.is_success());
    assert!(cloud.calls().contains(&"instance_quota g.xlarge".to_string()));
}

#[test]
fn test_recovered_topology_failure_blocks_validation() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    let toml = SINGLE_HEADNODE.replace(
        "multi_headnode = \"no\"",
        "multi_headnode = \"yes\"\nfallback_single_headnode = \"no\"",
    );

    let report = run(&cloud, &ws, &toml, false);

    assert!(matches!(
        report.state.outcome(Stage::TopologyBuild),
        StageOutcome::FailedRecovered(_)
    ));
    let (stage, reason) = report.state.fatal().unwrap();
    assert_eq!(stage, Stage::DescriptorValidation);
    assert!(reason.contains("topology is unavailable"));
    assert!(!report.is_success());
    assert!(report.topology.is_none());
    assert!(report.state.outcome(Stage::ClusterCreationRequest).is_pending());
    assert!(!cloud.called("create_cluster"));
}

#[test]
fn test_interactive_continue_after_creation_failure() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.fail("create_cluster", "ValidationException: bad descriptor");
    cloud.script_cluster_statuses(["InService"]);
    let mut prompter = ScriptedPrompter::default().replying("Continue or abort", "continue");

    let report = run_with(&cloud, &ws, SINGLE_HEADNODE, RunMode::Interactive, &mut prompter, false);

    assert!(matches!(
        report.state.outcome(Stage::ClusterCreationRequest),
        StageOutcome::FailedRecovered(reason) if reason.contains("bad descriptor")
    ));
    assert!(report.is_success(), "{:?}", report.state.records());
    assert!(report.cluster_arn.is_none());
    assert!(
        report
            .manual_command
            .as_deref()
            .unwrap()
            .contains("sagemaker create-cluster --cli-input-json")
    );
    assert!(matches!(report.readiness, Some(PollOutcome::Ready)));
    assert!(
        prompter
            .asked()
            .iter()
            .any(|p| p.starts_with("cluster creation request failed"))
    );
}

#[test]
fn test_interactive_abort_after_staging_failure() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.fail("sync_directory", "upload failed: AccessDenied");
    let mut prompter = ScriptedPrompter::default().replying("Continue or abort", "abort");

    let report = run_with(&cloud, &ws, SINGLE_HEADNODE, RunMode::Interactive, &mut prompter, false);

    assert_eq!(
        report.state.fatal().unwrap().0,
        Stage::LifecycleAssetStaging
    );
    assert!(report.state.outcome(Stage::TopologyBuild).is_pending());
    assert!(!cloud.called("create_cluster"));
    assert!(
        prompter
            .asked()
            .iter()
            .any(|p| p.starts_with("lifecycle asset staging failed"))
    );
}

#[test]
fn test_interactive_continue_after_staging_failure() {
    let ws = workspace();
    let cloud = FakeCloud::with_default_stack();
    cloud.fail("sync_directory", "upload failed: AccessDenied");
    let mut prompter = ScriptedPrompter::default().replying("Continue or abort", "continue");

    let report = run_with(&cloud, &ws, SINGLE_HEADNODE, RunMode::Interactive, &mut prompter, false);

    assert!(matches!(
        report.state.outcome(Stage::LifecycleAssetStaging),
        StageOutcome::FailedRecovered(_)
    ));
    assert!(report.is_success(), "{:?}", report.state.records());
    assert!(cloud.called("create_cluster"));
}
