//! Pipeline stage tracking.
//!
//! Every stage moves from `Pending` to exactly one terminal outcome, in stage
//! order. The state lives for one run and is never persisted.

use serde::Serialize;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prerequisites,
    RegionResolution,
    EnvironmentResolution,
    LifecycleAssetStaging,
    TopologyBuild,
    DescriptorValidation,
    ClusterCreationRequest,
    ReadinessPolling,
    UserProvisioning,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Prerequisites,
        Stage::RegionResolution,
        Stage::EnvironmentResolution,
        Stage::LifecycleAssetStaging,
        Stage::TopologyBuild,
        Stage::DescriptorValidation,
        Stage::ClusterCreationRequest,
        Stage::ReadinessPolling,
        Stage::UserProvisioning,
    ];

    /// Key suffix used for per-stage config keys (`on_failure_<key>`).
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Prerequisites => "prerequisites",
            Self::RegionResolution => "region_resolution",
            Self::EnvironmentResolution => "environment_resolution",
            Self::LifecycleAssetStaging => "lifecycle_asset_staging",
            Self::TopologyBuild => "topology_build",
            Self::DescriptorValidation => "descriptor_validation",
            Self::ClusterCreationRequest => "cluster_creation_request",
            Self::ReadinessPolling => "readiness_polling",
            Self::UserProvisioning => "user_provisioning",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Prerequisites => "prerequisites",
            Self::RegionResolution => "region resolution",
            Self::EnvironmentResolution => "environment resolution",
            Self::LifecycleAssetStaging => "lifecycle asset staging",
            Self::TopologyBuild => "topology build",
            Self::DescriptorValidation => "descriptor validation",
            Self::ClusterCreationRequest => "cluster creation request",
            Self::ReadinessPolling => "readiness polling",
            Self::UserProvisioning => "user provisioning",
        };
        write!(f, "{name}")
    }
}

/// Outcome of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum StageOutcome {
    Pending,
    Succeeded,
    FailedRecovered(String),
    FailedFatal(String),
}

impl StageOutcome {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FailedFatal(_))
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::FailedRecovered(reason) => write!(f, "RECOVERED ({reason})"),
            Self::FailedFatal(reason) => write!(f, "FAILED ({reason})"),
        }
    }
}

/// Record of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// Progress of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    records: Vec<StageRecord>,
    /// Index of the next stage allowed to start.
    cursor: usize,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Stage::ALL
                .iter()
                .map(|&stage| StageRecord {
                    stage,
                    outcome: StageOutcome::Pending,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            cursor: 0,
        }
    }

    /// Mark `stage` as started. Stages may be skipped but never revisited.
    pub fn start(mut self, stage: Stage) -> Result<Self, StateError> {
        self.check_forward(stage)?;
        if self.is_halted() {
            return Err(StateError::Halted(stage));
        }
        let record = &mut self.records[stage.index()];
        record.started_at = Some(now_timestamp());
        self.cursor = stage.index();
        Ok(self)
    }

    /// Record the outcome of `stage`, consuming the state.
    pub fn record(mut self, stage: Stage, outcome: StageOutcome) -> Result<Self, StateError> {
        self.check_forward(stage)?;
        if self.is_halted() {
            return Err(StateError::Halted(stage));
        }
        if outcome.is_pending() {
            return Err(StateError::Backward {
                stage,
                current: self.records[stage.index()].outcome.clone(),
            });
        }

        let now = now_timestamp();
        let record = &mut self.records[stage.index()];
        if record.started_at.is_none() {
            record.started_at = Some(now.clone());
        }
        record.finished_at = Some(now);
        record.outcome = outcome;
        self.cursor = stage.index() + 1;
        Ok(self)
    }

    fn check_forward(&self, stage: Stage) -> Result<(), StateError> {
        let record = &self.records[stage.index()];
        if stage.index() < self.cursor || !record.outcome.is_pending() {
            return Err(StateError::Backward {
                stage,
                current: record.outcome.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn outcome(&self, stage: Stage) -> &StageOutcome {
        &self.records[stage.index()].outcome
    }

    #[must_use]
    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// A stage ended fatally; nothing further may run.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.records.iter().any(|r| r.outcome.is_fatal())
    }

    /// The first fatal stage, if any.
    #[must_use]
    pub fn fatal(&self) -> Option<(Stage, &str)> {
        self.records.iter().find_map(|r| match &r.outcome {
            StageOutcome::FailedFatal(reason) => Some((r.stage, reason.as_str())),
            _ => None,
        })
    }

    /// Stages that failed but were recovered.
    pub fn recovered(&self) -> impl Iterator<Item = (Stage, &str)> {
        self.records.iter().filter_map(|r| match &r.outcome {
            StageOutcome::FailedRecovered(reason) => Some((r.stage, reason.as_str())),
            _ => None,
        })
    }
}

/// Current local time formatted for stage records.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors from illegal stage transitions.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("stage {stage} cannot move backwards (currently {current})")]
    Backward { stage: Stage, current: StageOutcome },
    #[error("stage {0} cannot run after a fatal failure")]
    Halted(Stage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_all_pending() {
        let state = PipelineState::new();
        assert_eq!(state.records().len(), Stage::ALL.len());
        assert!(state.records().iter().all(|r| r.outcome.is_pending()));
        assert!(!state.is_halted());
    }

    #[test]
    fn test_forward_transitions_with_skips() {
        let state = PipelineState::new()
            .record(Stage::Prerequisites, StageOutcome::Succeeded)
            .unwrap()
            .start(Stage::RegionResolution)
            .unwrap()
            .record(Stage::RegionResolution, StageOutcome::Succeeded)
            .unwrap()
            .record(
                Stage::TopologyBuild,
                StageOutcome::FailedRecovered("no workers".to_string()),
            )
            .unwrap();

        assert_eq!(state.outcome(Stage::EnvironmentResolution), &StageOutcome::Pending);
        assert_eq!(state.recovered().count(), 1);
        let record = &state.records()[Stage::RegionResolution as usize];
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn test_repeated_transition_rejected() {
        let state = PipelineState::new()
            .record(Stage::Prerequisites, StageOutcome::Succeeded)
            .unwrap();
        let err = state
            .record(Stage::Prerequisites, StageOutcome::Succeeded)
            .unwrap_err();
        assert!(matches!(err, StateError::Backward { stage: Stage::Prerequisites, .. }));
    }

    #[test]
    fn test_backward_transition_rejected() {
        let state = PipelineState::new()
            .record(Stage::TopologyBuild, StageOutcome::Succeeded)
            .unwrap();
        assert!(state.start(Stage::RegionResolution).is_err());
    }

    #[test]
    fn test_pending_is_not_an_outcome() {
        assert!(
            PipelineState::new()
                .record(Stage::Prerequisites, StageOutcome::Pending)
                .is_err()
        );
    }

    #[test]
    fn test_fatal_halts_pipeline() {
        let state = PipelineState::new()
            .record(
                Stage::Prerequisites,
                StageOutcome::FailedFatal("aws missing".to_string()),
            )
            .unwrap();
        assert!(state.is_halted());
        assert_eq!(state.fatal(), Some((Stage::Prerequisites, "aws missing")));
        assert!(matches!(
            state.record(Stage::RegionResolution, StageOutcome::Succeeded),
            Err(StateError::Halted(Stage::RegionResolution))
        ));
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::Prerequisites < Stage::UserProvisioning);
        assert!(Stage::ClusterCreationRequest < Stage::ReadinessPolling);
        assert_eq!(Stage::ALL[4], Stage::TopologyBuild);
    }
}
