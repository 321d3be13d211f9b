//! Capacity reservation (training plan) bindings and fit checks.
//!
//! A reservation pins capacity to one instance type in one availability zone.
//! A worker group bound to it must ask for no more instances than are still
//! available, use the reserved type, and live in the reserved zone.

/// A worker group's binding to a capacity reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityReservationBinding {
    /// Training plan ARN.
    pub reservation_id: String,
    pub total_capacity: u32,
    pub available_capacity: u32,
    pub bound_instance_type: String,
    pub availability_zone: String,
}

/// One way a request disagrees with its reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationMismatch {
    CountExceedsAvailable { requested: u32, available: u32 },
    TypeMismatch { requested: String, reserved: String },
    ZoneMismatch { target: String, reserved: String },
}

impl ReservationMismatch {
    /// Zone mismatches cannot be fixed by editing the group.
    #[must_use]
    pub fn is_correctable(&self) -> bool {
        !matches!(self, Self::ZoneMismatch { .. })
    }

    /// Short identifier used in config keys.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CountExceedsAvailable { .. } => "count",
            Self::TypeMismatch { .. } => "type",
            Self::ZoneMismatch { .. } => "zone",
        }
    }
}

impl std::fmt::Display for ReservationMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CountExceedsAvailable {
                requested,
                available,
            } => write!(
                f,
                "requested {requested} instances but only {available} are available"
            ),
            Self::TypeMismatch {
                requested,
                reserved,
            } => write!(f, "requested {requested} but the reservation is for {reserved}"),
            Self::ZoneMismatch { target, reserved } => write!(
                f,
                "cluster subnet is in {target} but the reservation is in {reserved}"
            ),
        }
    }
}

/// Operator decision for a mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchAction {
    /// Edit the group to match the reservation.
    Correct,
    /// Proceed with the mismatch as an explicit override.
    Keep,
    /// Remove the binding from the group.
    Drop,
}

impl std::str::FromStr for MismatchAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "correct" | "fix" => Ok(Self::Correct),
            "keep" | "override" => Ok(Self::Keep),
            "drop" | "abort" => Ok(Self::Drop),
            _ => Err(format!("unknown action '{s}'. Use: correct, keep, drop")),
        }
    }
}

impl std::fmt::Display for MismatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Correct => write!(f, "correct"),
            Self::Keep => write!(f, "keep"),
            Self::Drop => write!(f, "drop"),
        }
    }
}

/// A worker group request after reconciling it with its reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub instance_count: u32,
    pub instance_type: String,
    pub binding: Option<CapacityReservationBinding>,
    /// Mismatches the operator chose to keep.
    pub overridden: Vec<ReservationMismatch>,
}

impl CapacityReservationBinding {
    /// Every way the request disagrees with this reservation.
    ///
    /// The zone is only checked when the target zone is known.
    #[must_use]
    pub fn check(
        &self,
        instance_count: u32,
        instance_type: &str,
        target_zone: Option<&str>,
    ) -> Vec<ReservationMismatch> {
        let mut mismatches = Vec::new();

        if instance_count > self.available_capacity {
            mismatches.push(ReservationMismatch::CountExceedsAvailable {
                requested: instance_count,
                available: self.available_capacity,
            });
        }

        if instance_type != self.bound_instance_type {
            mismatches.push(ReservationMismatch::TypeMismatch {
                requested: instance_type.to_string(),
                reserved: self.bound_instance_type.clone(),
            });
        }

        if let Some(zone) = target_zone
            && zone != self.availability_zone
        {
            mismatches.push(ReservationMismatch::ZoneMismatch {
                target: zone.to_string(),
                reserved: self.availability_zone.clone(),
            });
        }

        mismatches
    }

    /// Check the request and apply `decide` to every mismatch.
    ///
    /// Correcting a zone mismatch, or a count when nothing is available, drops
    /// the binding since no edit to the group can satisfy it.
    pub fn reconcile<F>(
        self,
        instance_count: u32,
        instance_type: &str,
        target_zone: Option<&str>,
        mut decide: F,
    ) -> Reconciled
    where
        F: FnMut(&ReservationMismatch) -> MismatchAction,
    {
        let mut result = Reconciled {
            instance_count,
            instance_type: instance_type.to_string(),
            binding: None,
            overridden: Vec::new(),
        };

        for mismatch in self.check(instance_count, instance_type, target_zone) {
            tracing::warn!("Reservation {}: {mismatch}", self.reservation_id);
            let action = decide(&mismatch);
            match (action, &mismatch) {
                (MismatchAction::Keep, _) => {
                    tracing::warn!("Keeping mismatch by operator override: {mismatch}");
                    result.overridden.push(mismatch);
                }
                (MismatchAction::Drop, _)
                | (MismatchAction::Correct, ReservationMismatch::ZoneMismatch { .. }) => {
                    tracing::warn!("Dropping reservation {}", self.reservation_id);
                    result.overridden.clear();
                    return result;
                }
                (MismatchAction::Correct, ReservationMismatch::CountExceedsAvailable { .. }) => {
                    if self.available_capacity == 0 {
                        tracing::warn!(
                            "Reservation {} has no capacity left, dropping it",
                            self.reservation_id
                        );
                        result.overridden.clear();
                        return result;
                    }
                    result.instance_count = self.available_capacity;
                }
                (MismatchAction::Correct, ReservationMismatch::TypeMismatch { .. }) => {
                    result.instance_type.clone_from(&self.bound_instance_type);
                }
            }
        }

        result.binding = Some(self);
        result
    }
}
