//! Permission rules for the evaluation lifecycle and its report.
//!
//! ```text
//! created --accept--> accepted --start--> in_progress --complete--> completed
//! created | accepted | in_progress --cancel--> canceled
//! ```
//!
//! Report actions hang off `in_progress` and the assigned evaluator. A report
//! moves `draft -> finalized` once and stays viewable after the evaluation
//! completes.

use std::fmt;

use shared::domain::{Evaluation, EvaluationStatus, Report, Role, User, UserId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            role: user.role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Accept,
    Start,
    Complete,
    Cancel,
    CreateReport,
    UpdateReport,
    FinalizeReport,
    ViewReport,
    AddPhoto,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Accept,
        Action::Start,
        Action::Complete,
        Action::Cancel,
        Action::CreateReport,
        Action::UpdateReport,
        Action::FinalizeReport,
        Action::ViewReport,
        Action::AddPhoto,
    ];

    /// Actions that move the evaluation's own status.
    pub fn is_transition(self) -> bool {
        matches!(
            self,
            Self::Accept | Self::Start | Self::Complete | Self::Cancel
        )
    }

    /// The status the evaluation lands in after a transition.
    pub fn target_status(self) -> Option<EvaluationStatus> {
        match self {
            Self::Accept => Some(EvaluationStatus::Accepted),
            Self::Start => Some(EvaluationStatus::InProgress),
            Self::Complete => Some(EvaluationStatus::Completed),
            Self::Cancel => Some(EvaluationStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accept => "accept",
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
            Self::CreateReport => "create a report for",
            Self::UpdateReport => "edit the report of",
            Self::FinalizeReport => "finalize the report of",
            Self::ViewReport => "view the report of",
            Self::AddPhoto => "add photos to",
        })
    }
}

/// What the client knows about the evaluation's report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReportSlot {
    /// Not looked up yet.
    #[default]
    Unknown,
    /// Looked up and none exists.
    Absent,
    Present(Report),
}

impl ReportSlot {
    pub fn report(&self) -> Option<&Report> {
        match self {
            Self::Present(report) => Some(report),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl From<Option<Report>> for ReportSlot {
    fn from(report: Option<Report>) -> Self {
        match report {
            Some(report) => Self::Present(report),
            None => Self::Absent,
        }
    }
}

/// Why an action was refused locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("only evaluators can accept evaluations")]
    NotEvaluator,
    #[error("this evaluation already has an evaluator")]
    AlreadyAssigned,
    #[error("only the assigned evaluator can {action} this evaluation")]
    NotAssignedEvaluator { action: Action },
    #[error("only the requester or an admin can cancel this evaluation")]
    NotRequester,
    #[error("cannot {action} an evaluation that is {status}")]
    StatusMismatch {
        action: Action,
        status: EvaluationStatus,
    },
    #[error("a report already exists for this evaluation")]
    ReportExists,
    #[error("no report exists for this evaluation yet")]
    ReportMissing,
    #[error("the report is finalized and can no longer be edited")]
    ReportFinalized,
    #[error("this evaluation changed on the server, refresh before trying again")]
    StaleState,
    #[error("another change to this evaluation is still in progress")]
    ActionInFlight,
    #[error("evaluation not loaded yet")]
    NotLoaded,
}

pub fn check(
    action: Action,
    actor: &Actor,
    evaluation: &Evaluation,
    report: &ReportSlot,
) -> Result<(), Denial> {
    match action {
        Action::Accept => {
            if actor.role != Role::Evaluator {
                return Err(Denial::NotEvaluator);
            }
            if evaluation.evaluator_id.is_some() {
                return Err(Denial::AlreadyAssigned);
            }
            require_status(action, evaluation, EvaluationStatus::Created)
        }
        Action::Start => {
            require_status(action, evaluation, EvaluationStatus::Accepted)?;
            require_assigned(action, actor, evaluation)
        }
        Action::Complete => {
            require_status(action, evaluation, EvaluationStatus::InProgress)?;
            require_assigned(action, actor, evaluation)
        }
        Action::Cancel => {
            require_not_terminal(action, evaluation)?;
            if actor.id != evaluation.requester_id && actor.role != Role::Admin {
                return Err(Denial::NotRequester);
            }
            Ok(())
        }
        Action::CreateReport => {
            require_report_editing(action, actor, evaluation)?;
            if report.report().is_some() {
                return Err(Denial::ReportExists);
            }
            Ok(())
        }
        Action::UpdateReport | Action::FinalizeReport => {
            require_report_editing(action, actor, evaluation)?;
            match report.report() {
                Some(report) if report.is_draft() => Ok(()),
                Some(_) => Err(Denial::ReportFinalized),
                None => Err(Denial::ReportMissing),
            }
        }
        Action::ViewReport => report.report().map(|_| ()).ok_or(Denial::ReportMissing),
        Action::AddPhoto => require_not_terminal(action, evaluation),
    }
}

pub fn allowed_actions(actor: &Actor, evaluation: &Evaluation, report: &ReportSlot) -> Vec<Action> {
    Action::ALL
        .into_iter()
        .filter(|action| check(*action, actor, evaluation, report).is_ok())
        .collect()
}

fn require_status(
    action: Action,
    evaluation: &Evaluation,
    expected: EvaluationStatus,
) -> Result<(), Denial> {
    if evaluation.status != expected {
        return Err(Denial::StatusMismatch {
            action,
            status: evaluation.status,
        });
    }
    Ok(())
}

fn require_not_terminal(action: Action, evaluation: &Evaluation) -> Result<(), Denial> {
    if evaluation.status.is_terminal() {
        return Err(Denial::StatusMismatch {
            action,
            status: evaluation.status,
        });
    }
    Ok(())
}

fn require_assigned(action: Action, actor: &Actor, evaluation: &Evaluation) -> Result<(), Denial> {
    if !evaluation.is_assigned_to(actor.id) {
        return Err(Denial::NotAssignedEvaluator { action });
    }
    Ok(())
}

fn require_report_editing(
    action: Action,
    actor: &Actor,
    evaluation: &Evaluation,
) -> Result<(), Denial> {
    require_status(action, evaluation, EvaluationStatus::InProgress)?;
    require_assigned(action, actor, evaluation)
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
