//! Mission status transitions.
//!
//! The drone remains authoritative for whether a command is executable;
//! this module only answers whether a transition is legal for the mission
//! record the server holds.

use thiserror::Error;

use crate::models::{CommandAction, MissionStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("action {action:?} is not legal in state {from:?}")]
    Illegal {
        from: MissionStatus,
        action: CommandAction,
    },
}

/// Commands an operator may issue in the given mission state.
pub fn legal_actions(status: MissionStatus) -> &'static [CommandAction] {
    match status {
        MissionStatus::Planned => &[CommandAction::Start],
        MissionStatus::InProgress => &[
            CommandAction::Pause,
            CommandAction::Abort,
            CommandAction::Rth,
        ],
        MissionStatus::Paused => &[
            CommandAction::Resume,
            CommandAction::Abort,
            CommandAction::Rth,
        ],
        MissionStatus::Completed | MissionStatus::Aborted | MissionStatus::Failed => &[],
    }
}

/// Map an acknowledged action to the next mission status.
pub fn apply_action(
    status: MissionStatus,
    action: CommandAction,
) -> Result<MissionStatus, TransitionError> {
    let next = match (status, action) {
        (MissionStatus::Planned, CommandAction::Start) => MissionStatus::InProgress,
        (MissionStatus::InProgress, CommandAction::Pause) => MissionStatus::Paused,
        (MissionStatus::Paused, CommandAction::Resume) => MissionStatus::InProgress,
        (MissionStatus::InProgress | MissionStatus::Paused, CommandAction::Abort)
        | (MissionStatus::InProgress | MissionStatus::Paused, CommandAction::Rth) => {
            MissionStatus::Aborted
        }
        (from, action) => return Err(TransitionError::Illegal { from, action }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_accepts_only_start() {
        assert_eq!(
            apply_action(MissionStatus::Planned, CommandAction::Start),
            Ok(MissionStatus::InProgress)
        );
        for action in [
            CommandAction::Pause,
            CommandAction::Resume,
            CommandAction::Abort,
            CommandAction::Rth,
        ] {
            assert!(apply_action(MissionStatus::Planned, action).is_err());
        }
    }

    #[test]
    fn pause_resume_cycle() {
        let paused = apply_action(MissionStatus::InProgress, CommandAction::Pause).unwrap();
        assert_eq!(paused, MissionStatus::Paused);
        let resumed = apply_action(paused, CommandAction::Resume).unwrap();
        assert_eq!(resumed, MissionStatus::InProgress);
    }

    #[test]
    fn abort_and_rth_terminate() {
        assert_eq!(
            apply_action(MissionStatus::InProgress, CommandAction::Rth),
            Ok(MissionStatus::Aborted)
        );
        assert_eq!(
            apply_action(MissionStatus::Paused, CommandAction::Abort),
            Ok(MissionStatus::Aborted)
        );
    }

    #[test]
    fn terminal_states_reject_everything() {
        for status in [
            MissionStatus::Completed,
            MissionStatus::Aborted,
            MissionStatus::Failed,
        ] {
            assert!(legal_actions(status).is_empty());
            assert!(apply_action(status, CommandAction::Resume).is_err());
        }
    }

    #[test]
    fn resume_in_progress_is_illegal() {
        let err = apply_action(MissionStatus::InProgress, CommandAction::Resume).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: MissionStatus::InProgress,
                action: CommandAction::Resume
            }
        );
    }
}
