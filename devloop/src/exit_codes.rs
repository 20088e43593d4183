//! Stable exit codes for devloop CLI commands.

use crate::core::types::RunStatus;

/// Command succeeded, or the run completed / is still running.
pub const OK: i32 = 0;
/// Invalid layout, config, design document, run id, or any other error.
pub const INVALID: i32 = 1;
/// The run is suspended waiting for an approval decision.
pub const SUSPENDED: i32 = 2;
/// The run reached the Failed terminal.
pub const FAILED: i32 = 3;
/// The run is halted or degraded; `devloop step` resumes it.
pub const HALTED: i32 = 4;

/// Exit code reported for a run left in `status`.
pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Running | RunStatus::Completed => OK,
        RunStatus::Suspended => SUSPENDED,
        RunStatus::Failed => FAILED,
        RunStatus::Halted | RunStatus::Degraded => HALTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_distinct_codes() {
        assert_eq!(for_status(RunStatus::Completed), OK);
        assert_eq!(for_status(RunStatus::Suspended), SUSPENDED);
        assert_eq!(for_status(RunStatus::Failed), FAILED);
        assert_eq!(for_status(RunStatus::Degraded), HALTED);
        assert_eq!(for_status(RunStatus::Halted), HALTED);
    }
}
