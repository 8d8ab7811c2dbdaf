use crate::model::HousekeepingStatus::{self, *};

/// Allowed housekeeping transitions. Anything not listed is rejected.
const TRANSITIONS: &[(HousekeepingStatus, &[HousekeepingStatus])] = &[
    (Dirty, &[Cleaning, MaintenanceRequired, OutOfService]),
    (Cleaning, &[Clean, Dirty, MaintenanceRequired]),
    (Clean, &[Inspected, Dirty, MaintenanceRequired]),
    (Inspected, &[Dirty, MaintenanceRequired, OutOfService]),
    (MaintenanceRequired, &[Dirty, OutOfService]),
    (OutOfService, &[Dirty]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal housekeeping transition {from} -> {to}")]
pub struct TransitionError {
    pub from: HousekeepingStatus,
    pub to: HousekeepingStatus,
}

pub fn allowed_targets(from: HousekeepingStatus) -> &'static [HousekeepingStatus] {
    TRANSITIONS
        .iter()
        .find(|(source, _)| *source == from)
        .map(|(_, targets)| *targets)
        .unwrap_or(&[])
}

pub fn can_transition(from: HousekeepingStatus, to: HousekeepingStatus) -> bool {
    allowed_targets(from).contains(&to)
}

pub fn validate_transition(
    from: HousekeepingStatus,
    to: HousekeepingStatus,
) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

/// Outcome of an inspection. Only a `Clean` room can be inspected.
pub fn inspection_target(
    from: HousekeepingStatus,
    approved: bool,
) -> Result<HousekeepingStatus, TransitionError> {
    let to = if approved { Inspected } else { Dirty };
    if from != Clean {
        return Err(TransitionError { from, to });
    }
    Ok(to)
}
