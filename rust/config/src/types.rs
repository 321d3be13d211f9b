//! Instance roles, workload managers, run modes and instance type names.

use serde::{Deserialize, Serialize};

/// Role an instance group plays in the cluster.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceRole {
    /// Runs the scheduler control plane (slurmctld).
    Controller,
    /// Interactive entry point for users.
    Login,
    /// Runs compute workloads.
    Worker,
}

impl std::fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controller => write!(f, "controller"),
            Self::Login => write!(f, "login"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for InstanceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "controller" | "head" | "headnode" => Ok(Self::Controller),
            "login" => Ok(Self::Login),
            "worker" | "compute" => Ok(Self::Worker),
            _ => Err(format!(
                "unknown instance role '{s}'. Use: controller, login, worker"
            )),
        }
    }
}

/// Workload manager the nodes are bootstrapped for.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum WorkloadManager {
    #[default]
    Slurm,
}

impl std::fmt::Display for WorkloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slurm => write!(f, "slurm"),
        }
    }
}

impl std::str::FromStr for WorkloadManager {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slurm" => Ok(Self::Slurm),
            _ => Err(format!("unsupported workload manager '{s}'. Use: slurm")),
        }
    }
}

/// Whether the pipeline may block on the operator.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Ask the operator for anything the config file does not answer.
    #[default]
    Interactive,
    /// Never prompt; fall back to built-in defaults.
    Automated,
}

impl RunMode {
    #[must_use]
    pub fn is_automated(self) -> bool {
        self == Self::Automated
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::Automated => write!(f, "automated"),
        }
    }
}

/// Hardware threads per physical core. Only 1 (hyperthreading off) and 2 are valid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadsPerCore {
    #[default]
    One,
    Two,
}

impl ThreadsPerCore {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl TryFrom<u8> for ThreadsPerCore {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(format!("threads per core must be 1 or 2, got {value}")),
        }
    }
}

impl std::str::FromStr for ThreadsPerCore {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u8 = s
            .trim()
            .parse()
            .map_err(|_| format!("threads per core must be 1 or 2, got '{s}'"))?;
        Self::try_from(value)
    }
}

impl std::fmt::Display for ThreadsPerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl Serialize for ThreadsPerCore {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for ThreadsPerCore {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Self::try_from(value).map_err(serde::de::Error::custom)
    }
}

/// A cloud instance type name such as `ml.g5.12xlarge`.
///
/// Only the shape is checked (dot-separated, non-empty segments, no whitespace);
/// whether the type exists is for the cloud to decide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceType(String);

impl InstanceType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for InstanceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("instance type must not be empty".to_string());
        }
        let segments: Vec<&str> = trimmed.split('.').collect();
        if segments.len() < 2 || segments.iter().any(|seg| seg.is_empty()) {
            return Err(format!(
                "invalid instance type '{s}', expected a dotted name like ml.g5.12xlarge"
            ));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(format!("invalid character in instance type '{s}'"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for InstanceType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for InstanceType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Decode the loose yes/no answers operators type into prompts and config files.
#[must_use]
pub fn parse_yes_no(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "yes" | "y" | "true" | "1" | "on" => Some(true),
        "no" | "n" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}
