//! Cluster and node-provisioning descriptors.
//!
//! The cluster descriptor is the `create-cluster` request body. The provisioning
//! descriptor (`provisioning_parameters.json`) is read by the lifecycle scripts
//! on every node at first boot to decide its role and partition.

use std::{
    collections::HashSet,
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use hyperpod_config::{InstanceRole, WorkloadManager};
use serde::{Deserialize, Serialize};

use crate::{environment::SharedFsBinding, topology::Topology};

pub const CLUSTER_DESCRIPTOR_FILE: &str = "cluster-config.json";
pub const PROVISIONING_DESCRIPTOR_FILE: &str = "provisioning_parameters.json";
pub const PROVISIONING_VERSION: &str = "1.0.0";
pub const ON_CREATE_SCRIPT: &str = "on_create.sh";
const NODE_RECOVERY: &str = "Automatic";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterDescriptor {
    pub cluster_name: String,
    pub instance_groups: Vec<ClusterInstanceGroup>,
    pub vpc_config: VpcConfig,
    pub node_recovery: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterInstanceGroup {
    pub instance_group_name: String,
    pub instance_type: String,
    pub instance_count: u32,
    pub life_cycle_config: LifeCycleConfig,
    pub execution_role: String,
    pub threads_per_core: u8,
    pub instance_storage_configs: Vec<InstanceStorageConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_plan_arn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifeCycleConfig {
    pub source_s3_uri: String,
    pub on_create: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceStorageConfig {
    pub ebs_volume_config: EbsVolumeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbsVolumeConfig {
    #[serde(rename = "VolumeSizeInGB")]
    pub volume_size_in_gb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VpcConfig {
    pub security_group_ids: Vec<String>,
    pub subnets: Vec<String>,
}

/// Contents of `provisioning_parameters.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProvisioningDescriptor {
    pub version: String,
    pub workload_manager: WorkloadManager,
    pub controller_group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_group: Option<String>,
    pub worker_groups: Vec<WorkerPartition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsx_dns_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsx_mountname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsx_openzfs_dns_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slurm_configurations: Option<SlurmConfigurations>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPartition {
    pub instance_group_name: String,
    pub partition_name: String,
}

/// Multi-controller bindings. Present only when two controllers share state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmConfigurations {
    pub slurm_database_endpoint: String,
    pub slurm_database_secret_arn: String,
    pub slurm_database_user: String,
    pub slurm_shared_directory: String,
    pub slurm_sns_arn: String,
}

/// Both descriptors for one topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptors {
    pub cluster: ClusterDescriptor,
    pub provisioning: NodeProvisioningDescriptor,
}

/// Where [`Descriptors::write_to_dir`] put the files.
#[derive(Debug, Clone)]
pub struct DescriptorPaths {
    pub cluster: PathBuf,
    pub provisioning: PathBuf,
}

/// Build both descriptors from a topology.
pub fn write(
    topology: &Topology,
    shared_fs: &SharedFsBinding,
    workload_manager: WorkloadManager,
) -> Result<Descriptors, DescriptorError> {
    let instance_groups = topology
        .groups
        .iter()
        .map(|g| ClusterInstanceGroup {
            instance_group_name: g.name.clone(),
            instance_type: g.instance_type.to_string(),
            instance_count: g.instance_count,
            life_cycle_config: LifeCycleConfig {
                source_s3_uri: g.lifecycle_asset_uri.clone(),
                on_create: ON_CREATE_SCRIPT.to_string(),
            },
            execution_role: g.execution_identity.clone(),
            threads_per_core: g.threads_per_core.as_u8(),
            instance_storage_configs: vec![InstanceStorageConfig {
                ebs_volume_config: EbsVolumeConfig {
                    volume_size_in_gb: g.volume_size_gb,
                },
            }],
            training_plan_arn: g
                .capacity_reservation
                .as_ref()
                .map(|r| r.reservation_id.clone()),
        })
        .collect();

    let cluster = ClusterDescriptor {
        cluster_name: topology.cluster_name.clone(),
        instance_groups,
        vpc_config: VpcConfig {
            security_group_ids: topology.network.security_group_ids.clone(),
            subnets: topology.network.subnet_ids.clone(),
        },
        node_recovery: NODE_RECOVERY.to_string(),
    };

    let controller = topology
        .controller()
        .ok_or_else(|| DescriptorError::Structure(vec!["topology has no controller".to_string()]))?;

    let provisioning = NodeProvisioningDescriptor {
        version: PROVISIONING_VERSION.to_string(),
        workload_manager,
        controller_group: controller.name.clone(),
        login_group: topology.login().map(|g| g.name.clone()),
        worker_groups: topology
            .workers()
            .map(|g| WorkerPartition {
                instance_group_name: g.name.clone(),
                partition_name: g.partition().to_string(),
            })
            .collect(),
        fsx_dns_name: shared_fs.dns_name.clone(),
        fsx_mountname: shared_fs.mount_name.clone(),
        fsx_openzfs_dns_name: shared_fs.openzfs_dns_name.clone(),
        slurm_configurations: topology.coordination.as_ref().map(|c| SlurmConfigurations {
            slurm_database_endpoint: c.database_endpoint.clone(),
            slurm_database_secret_arn: c.secret_arn.clone(),
            slurm_database_user: c.database_user.clone(),
            slurm_shared_directory: c.shared_directory.clone(),
            slurm_sns_arn: c.topic_arn.clone(),
        }),
    };

    let descriptors = Descriptors {
        cluster,
        provisioning,
    };
    descriptors.verify_bijection()?;
    Ok(descriptors)
}

impl Descriptors {
    /// Every worker group in the cluster descriptor has exactly one partition
    /// mapping and vice versa.
    pub fn verify_bijection(&self) -> Result<(), DescriptorError> {
        let p = &self.provisioning;
        let cluster_workers: Vec<&str> = self
            .cluster
            .instance_groups
            .iter()
            .map(|g| g.instance_group_name.as_str())
            .filter(|name| *name != p.controller_group && Some(*name) != p.login_group.as_deref())
            .collect();
        let mapped: Vec<&str> = p
            .worker_groups
            .iter()
            .map(|w| w.instance_group_name.as_str())
            .collect();

        let mut seen = HashSet::new();
        let duplicates: Vec<&str> = mapped.iter().copied().filter(|n| !seen.insert(*n)).collect();

        let unmapped: Vec<String> = cluster_workers
            .iter()
            .filter(|n| !mapped.contains(n))
            .map(ToString::to_string)
            .collect();
        let dangling: Vec<String> = mapped
            .iter()
            .filter(|n| !cluster_workers.contains(n))
            .map(ToString::to_string)
            .collect();

        if unmapped.is_empty() && dangling.is_empty() && duplicates.is_empty() {
            Ok(())
        } else {
            Err(DescriptorError::Bijection {
                unmapped,
                dangling: dangling
                    .into_iter()
                    .chain(duplicates.into_iter().map(|d| format!("{d} (duplicate)")))
                    .collect(),
            })
        }
    }

    /// Structural checks beyond the bijection. Returns every problem found.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        self.verify_bijection()?;

        let mut problems = Vec::new();
        let mut names = HashSet::new();
        for group in &self.cluster.instance_groups {
            let name = &group.instance_group_name;
            if !names.insert(name.as_str()) {
                problems.push(format!("duplicate instance group name {name}"));
            }
            if group.instance_count == 0 {
                problems.push(format!("{name}: instance count must be at least 1"));
            }
            if !(1..=2).contains(&group.threads_per_core) {
                problems.push(format!("{name}: threads per core must be 1 or 2"));
            }
            if group
                .instance_storage_configs
                .iter()
                .any(|c| c.ebs_volume_config.volume_size_in_gb == 0)
            {
                problems.push(format!("{name}: volume size must be positive"));
            }
            if !group.life_cycle_config.source_s3_uri.starts_with("s3://") {
                problems.push(format!(
                    "{name}: lifecycle source {} is not an s3:// URI",
                    group.life_cycle_config.source_s3_uri
                ));
            }
            if group.execution_role.is_empty() {
                problems.push(format!("{name}: missing execution role"));
            }
        }
        if !names.contains(self.provisioning.controller_group.as_str()) {
            problems.push(format!(
                "controller group {} is not in the cluster descriptor",
                self.provisioning.controller_group
            ));
        }
        if let Some(login) = &self.provisioning.login_group
            && !names.contains(login.as_str())
        {
            problems.push(format!("login group {login} is not in the cluster descriptor"));
        }
        if self.cluster.vpc_config.subnets.is_empty()
            || self.cluster.vpc_config.security_group_ids.is_empty()
        {
            problems.push("VPC config needs at least one subnet and security group".to_string());
        }
        if let Some(slurm) = &self.provisioning.slurm_configurations {
            let fields = [
                &slurm.slurm_database_endpoint,
                &slurm.slurm_database_secret_arn,
                &slurm.slurm_database_user,
                &slurm.slurm_shared_directory,
                &slurm.slurm_sns_arn,
            ];
            if fields.iter().any(|f| f.is_empty()) {
                problems.push("slurm_configurations has empty fields".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DescriptorError::Structure(problems))
        }
    }

    /// Write both descriptors as pretty JSON into `dir`, creating it if needed.
    pub fn write_to_dir(&self, dir: &Path) -> Result<DescriptorPaths, DescriptorError> {
        std::fs::create_dir_all(dir).map_err(|e| DescriptorError::Io(dir.to_path_buf(), e))?;

        let paths = DescriptorPaths {
            cluster: dir.join(CLUSTER_DESCRIPTOR_FILE),
            provisioning: dir.join(PROVISIONING_DESCRIPTOR_FILE),
        };
        write_json(&paths.cluster, &self.cluster)?;
        write_json(&paths.provisioning, &self.provisioning)?;

        tracing::info!(
            "Wrote {} and {}",
            paths.cluster.display(),
            paths.provisioning.display()
        );
        Ok(paths)
    }

    /// Load descriptors previously written by [`Descriptors::write_to_dir`].
    pub fn read_from_dir(dir: &Path) -> Result<Self, DescriptorError> {
        Ok(Self {
            cluster: read_json(&dir.join(CLUSTER_DESCRIPTOR_FILE))?,
            provisioning: read_json(&dir.join(PROVISIONING_DESCRIPTOR_FILE))?,
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DescriptorError> {
    let file = File::open(path).map_err(|e| DescriptorError::Io(path.to_path_buf(), e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| DescriptorError::Serialize(path.to_path_buf(), e.to_string()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DescriptorError> {
    let file = File::create(path).map_err(|e| DescriptorError::Io(path.to_path_buf(), e))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .map_err(|e| DescriptorError::Serialize(path.to_path_buf(), e.to_string()))
}

/// Role of a cluster descriptor group, derived from the provisioning descriptor.
#[must_use]
pub fn role_of(descriptors: &Descriptors, group_name: &str) -> InstanceRole {
    let p = &descriptors.provisioning;
    if p.controller_group == group_name {
        InstanceRole::Controller
    } else if p.login_group.as_deref() == Some(group_name) {
        InstanceRole::Login
    } else {
        InstanceRole::Worker
    }
}

/// Errors producing descriptors.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error(
        "worker groups out of sync: unmapped [{}], dangling [{}]",
        .unmapped.join(", "),
        .dangling.join(", ")
    )]
    Bijection {
        unmapped: Vec<String>,
        dangling: Vec<String>,
    },
    #[error("invalid descriptor: {}", .0.join("; "))]
    Structure(Vec<String>),
    #[error("failed to access {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to encode {0}: {1}")]
    Serialize(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use hyperpod_config::{InstanceType, ThreadsPerCore};
    use tempfile::tempdir;

    use super::*;
    use crate::{
        reservation::CapacityReservationBinding,
        topology::{CoordinationStack, InstanceGroup, NetworkBinding},
    };

    fn group(name: &str, role: InstanceRole, ty: &str, count: u32) -> InstanceGroup {
        InstanceGroup {
            name: name.to_string(),
            role,
            instance_type: ty.parse::<InstanceType>().unwrap(),
            instance_count: count,
            volume_size_gb: 500,
            threads_per_core: ThreadsPerCore::One,
            execution_identity: "arn:aws:iam::111:role/exec".to_string(),
            lifecycle_asset_uri: "s3://bucket/src".to_string(),
            capacity_reservation: None,
            partition_name: None,
        }
    }

    fn topology() -> Topology {
        Topology {
            cluster_name: "ml-cluster".to_string(),
            groups: vec![
                group("controller-machine", InstanceRole::Controller, "ml.m5.12xlarge", 1),
                group("login-group", InstanceRole::Login, "ml.m5.4xlarge", 1),
                group("worker-group-1", InstanceRole::Worker, "ml.g5.xlarge", 2),
                group("worker-group-2", InstanceRole::Worker, "ml.p5.48xlarge", 1),
            ],
            network: NetworkBinding {
                security_group_ids: vec!["sg-1".to_string()],
                subnet_ids: vec!["subnet-1".to_string()],
                availability_zone: None,
            },
            coordination: None,
        }
    }

    fn fsx() -> SharedFsBinding {
        SharedFsBinding {
            dns_name: Some("fs-1.fsx.us-east-1.amazonaws.com".to_string()),
            mount_name: Some("abcdef".to_string()),
            openzfs_dns_name: None,
        }
    }

    #[test]
    fn test_cluster_descriptor_wire_format() {
        let mut topology = topology();
        topology.groups[3].capacity_reservation = Some(CapacityReservationBinding {
            reservation_id: "arn:plan".to_string(),
            total_capacity: 4,
            available_capacity: 4,
            bound_instance_type: "ml.p5.48xlarge".to_string(),
            availability_zone: "us-east-1a".to_string(),
        });
        let d = write(&topology, &fsx(), WorkloadManager::Slurm).unwrap();
        let json = serde_json::to_value(&d.cluster).unwrap();

        assert_eq!(json["ClusterName"], "ml-cluster");
        assert_eq!(json["NodeRecovery"], "Automatic");
        assert_eq!(json["VpcConfig"]["Subnets"][0], "subnet-1");
        let worker = &json["InstanceGroups"][2];
        assert_eq!(worker["InstanceGroupName"], "worker-group-1");
        assert_eq!(worker["InstanceCount"], 2);
        assert_eq!(worker["LifeCycleConfig"]["SourceS3Uri"], "s3://bucket/src");
        assert_eq!(worker["LifeCycleConfig"]["OnCreate"], "on_create.sh");
        assert_eq!(
            worker["InstanceStorageConfigs"][0]["EbsVolumeConfig"]["VolumeSizeInGB"],
            500
        );
        assert!(worker.get("TrainingPlanArn").is_none());
        assert_eq!(json["InstanceGroups"][3]["TrainingPlanArn"], "arn:plan");
    }

    #[test]
    fn test_provisioning_descriptor_single_controller() {
        let d = write(&topology(), &fsx(), WorkloadManager::Slurm).unwrap();
        let json = serde_json::to_value(&d.provisioning).unwrap();

        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["workload_manager"], "slurm");
        assert_eq!(json["controller_group"], "controller-machine");
        assert_eq!(json["login_group"], "login-group");
        assert_eq!(json["worker_groups"][1]["partition_name"], "ml.p5.48xlarge");
        assert_eq!(json["fsx_mountname"], "abcdef");
        assert!(json.get("slurm_configurations").is_none());
        assert!(json.get("fsx_openzfs_dns_name").is_none());
    }

    #[test]
    fn test_provisioning_descriptor_multi_controller() {
        let mut topology = topology();
        topology.groups[0].instance_count = 2;
        topology.coordination = Some(CoordinationStack {
            stack_name: "mh".to_string(),
            database_endpoint: "db.cluster.local".to_string(),
            secret_arn: "arn:secret".to_string(),
            database_user: "admin".to_string(),
            shared_directory: "/fsx/slurm".to_string(),
            topic_arn: "arn:sns".to_string(),
            execution_role_arn: "arn:role".to_string(),
        });
        let d = write(&topology, &fsx(), WorkloadManager::Slurm).unwrap();
        let slurm = d.provisioning.slurm_configurations.as_ref().unwrap();
        assert_eq!(slurm.slurm_database_endpoint, "db.cluster.local");
        assert_eq!(slurm.slurm_sns_arn, "arn:sns");
        d.validate().unwrap();
    }

    #[test]
    fn test_bijection_violation_detected() {
        let mut d = write(&topology(), &fsx(), WorkloadManager::Slurm).unwrap();
        d.provisioning.worker_groups.pop();
        d.provisioning.worker_groups.push(WorkerPartition {
            instance_group_name: "worker-group-9".to_string(),
            partition_name: "x".to_string(),
        });

        match d.verify_bijection().unwrap_err() {
            DescriptorError::Bijection { unmapped, dangling } => {
                assert_eq!(unmapped, ["worker-group-2"]);
                assert_eq!(dangling, ["worker-group-9"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_mapping_detected() {
        let mut d = write(&topology(), &fsx(), WorkloadManager::Slurm).unwrap();
        let first = d.provisioning.worker_groups[0].clone();
        d.provisioning.worker_groups.push(first);
        assert!(matches!(
            d.verify_bijection(),
            Err(DescriptorError::Bijection { .. })
        ));
    }

    #[test]
    fn test_structure_problems_collected() {
        let mut d = write(&topology(), &fsx(), WorkloadManager::Slurm).unwrap();
        d.cluster.instance_groups[0].instance_count = 0;
        d.cluster.instance_groups[1].life_cycle_config.source_s3_uri = "/local".to_string();
        match d.validate().unwrap_err() {
            DescriptorError::Structure(problems) => assert_eq!(problems.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_write_to_dir() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("nested");
        let d = write(&topology(), &fsx(), WorkloadManager::Slurm).unwrap();
        let paths = d.write_to_dir(&out).unwrap();

        assert!(paths.cluster.ends_with(CLUSTER_DESCRIPTOR_FILE));
        assert_eq!(Descriptors::read_from_dir(&out).unwrap(), d);
    }

    #[test]
    fn test_read_missing_dir() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Descriptors::read_from_dir(dir.path()),
            Err(DescriptorError::Io(..))
        ));
    }

    #[test]
    fn test_role_of() {
        let d = write(&topology(), &fsx(), WorkloadManager::Slurm).unwrap();
        assert_eq!(role_of(&d, "controller-machine"), InstanceRole::Controller);
        assert_eq!(role_of(&d, "login-group"), InstanceRole::Login);
        assert_eq!(role_of(&d, "worker-group-2"), InstanceRole::Worker);
    }
}
