//! The feature transition table.
//!
//! This is the only place that knows which `(stage, action)` pairs are legal.
//! Everything else asks [`next_stage`].

use crate::error::{FlowError, Result};
use crate::models::{Action, Stage};

/// Resolve the stage `action` moves a feature to from `current`.
///
/// `block_origin` is the stage recorded when the feature was blocked; it is
/// only consulted for [`Action::Resume`].
pub fn next_stage(current: Stage, action: Action, block_origin: Option<Stage>) -> Result<Stage> {
    use Action::*;
    use Stage::*;

    let next = match (current, action) {
        (Planning, Start) => Some(InProgress),
        (InProgress, Implement) => Some(Implementation),
        (Implementation, Test) => Some(Testing),
        (Testing, Action::Review) => Some(Stage::Review),
        (Stage::Review, Complete) => Some(Completed),
        (Stage::Review, Rework) => Some(Implementation),
        (stage, Block) if stage.is_blockable() => Some(Blocked),
        (Blocked, Resume) => block_origin.filter(Stage::is_blockable),
        _ => None,
    };

    next.ok_or(FlowError::InvalidTransition {
        stage: current,
        action,
    })
}

/// Actions that are legal from `current`.
pub fn allowed_actions(current: Stage, block_origin: Option<Stage>) -> Vec<Action> {
    Action::ALL
        .iter()
        .copied()
        .filter(|action| next_stage(current, *action, block_origin).is_ok())
        .collect()
}

/// Whether some action moves a feature from `from` directly to `to`.
pub fn can_reach(from: Stage, to: Stage, block_origin: Option<Stage>) -> bool {
    Action::ALL
        .iter()
        .any(|action| matches!(next_stage(from, *action, block_origin), Ok(s) if s == to))
}

/// The forward action that leaves `stage` along the main path, if any.
pub fn advance_action(stage: Stage) -> Option<Action> {
    match stage {
        Stage::Planning => Some(Action::Start),
        Stage::InProgress => Some(Action::Implement),
        Stage::Implementation => Some(Action::Test),
        Stage::Testing => Some(Action::Review),
        Stage::Review => Some(Action::Complete),
        Stage::Completed | Stage::Blocked => None,
    }
}
