use chrono::NaiveDateTime;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ContentField, FacultyCode, InvitationKind, Phase, Stage};

/// Why a forward stage transition was refused. Every variant names the unmet precondition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionRejection {
    #[error("stage {target} needs an accepted advising invitation first")]
    MissingAdvisor { target: Stage },

    #[error("the {field} must be filled in before the thesis can reach stage {target}")]
    IncompleteContent { field: ContentField, target: Stage },

    #[error("phase {phase} committee has {accepted} of {required} accepted invitations")]
    IncompleteCommittee {
        phase: Phase,
        accepted: usize,
        required: usize,
    },

    #[error("phase {phase} evaluation has {scored} of {required} committee scores")]
    IncompleteEvaluation {
        phase: Phase,
        scored: usize,
        required: usize,
    },

    #[error("stage {target} is past the last stage ({max}) of phase {phase}")]
    StageOutOfRange { target: Stage, max: Stage, phase: Phase },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvitationError {
    #[error("{faculty} already holds an active {kind} invitation for phase {phase}")]
    DuplicateInvitation {
        faculty: FacultyCode,
        phase: Phase,
        kind: InvitationKind,
    },

    #[error("phase {phase} already has {limit} active {kind} invitation(s)")]
    QuotaExceeded {
        phase: Phase,
        kind: InvitationKind,
        limit: usize,
    },

    #[error("{faculty} advises this thesis and cannot also sit on its committee")]
    SelfConflict { faculty: FacultyCode },

    #[error("{faculty} already answered the phase {phase} invitation")]
    AlreadyResponded { faculty: FacultyCode, phase: Phase },

    #[error("no invitation for {faculty} in phase {phase}")]
    NotFound { faculty: FacultyCode, phase: Phase },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} changed since it was read; re-fetch before retrying")]
    StaleRead { entity: &'static str, id: Uuid },

    #[error("store unreachable: {0}")]
    TransportFailure(#[source] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("malformed {table} row: {reason}")]
    InvalidRow { table: &'static str, reason: String },

    #[error(transparent)]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportFailure(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_transport_error(&err) {
            Self::TransportFailure(err)
        } else {
            Self::Database(err)
        }
    }
}

pub fn is_transport_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Umbrella error for one user-level action against the store.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error(transparent)]
    Transition(#[from] TransitionRejection),

    #[error(transparent)]
    Invitation(#[from] InvitationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{at} is not a slot shared by the advisor and both committee members")]
    SlotUnavailable { at: NaiveDateTime },

    #[error("score {score} is outside 0..=10")]
    InvalidScore { score: f64 },

    #[error("thesis has no advisor of record")]
    NoAdvisorOfRecord,
}

impl From<sqlx::Error> for ProgressError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

impl ProgressError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_transport_failures() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert!(matches!(err, StoreError::TransportFailure(_)));
    }

    #[test]
    fn missing_rows_are_not_retryable() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejections_name_the_unmet_precondition() {
        let err = TransitionRejection::IncompleteContent {
            field: ContentField::Abstract,
            target: Stage::PROJECT_SCHEDULING,
        };
        assert_eq!(
            err.to_string(),
            "the abstract must be filled in before the thesis can reach stage 5"
        );

        let err = InvitationError::QuotaExceeded {
            phase: Phase::Project,
            kind: InvitationKind::Committee,
            limit: 2,
        };
        assert!(err.to_string().contains("2 active committee"));
    }

    #[test]
    fn invalid_score_names_only_the_range() {
        let err = ProgressError::InvalidScore { score: 11.5 };
        assert_eq!(err.to_string(), "score 11.5 is outside 0..=10");
    }
}
