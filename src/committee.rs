use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::InvitationError;
use crate::ledger::InvitationLedger;
use crate::models::{FacultyCode, Invitation, InvitationDraft, InvitationKind, Phase};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposalOutcome {
    Created,
    DuplicateInvitation,
    QuotaExceeded,
    SelfConflict,
    /// The store could not confirm the invitation either way.
    Failed { reason: String },
}

impl From<&InvitationError> for ProposalOutcome {
    fn from(err: &InvitationError) -> Self {
        match err {
            InvitationError::DuplicateInvitation { .. } => Self::DuplicateInvitation,
            InvitationError::QuotaExceeded { .. } => Self::QuotaExceeded,
            InvitationError::SelfConflict { .. } => Self::SelfConflict,
            other => Self::Failed {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateOutcome {
    pub faculty: FacultyCode,
    #[serde(flatten)]
    pub outcome: ProposalOutcome,
    #[serde(skip)]
    pub invitation: Option<Invitation>,
}

impl CandidateOutcome {
    pub fn is_created(&self) -> bool {
        self.outcome == ProposalOutcome::Created
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitteeStatus {
    pub phase: Phase,
    pub pending: usize,
    pub accepted: usize,
    pub remaining_budget: usize,
}

impl CommitteeStatus {
    pub fn of(ledger: &InvitationLedger, phase: Phase) -> Self {
        let active = ledger.active_count(phase, InvitationKind::Committee);
        let accepted = ledger.accepted_count(phase, InvitationKind::Committee);
        Self {
            phase,
            pending: active - accepted,
            accepted,
            remaining_budget: ledger.remaining_budget(phase, InvitationKind::Committee),
        }
    }

    /// Whether the proposal form may be offered at all.
    pub fn can_propose(&self) -> bool {
        self.remaining_budget > 0
    }
}

/// Sends committee invitations through the ledger, one independent invitation per candidate.
pub struct CommitteeAssembler<'a> {
    ledger: &'a mut InvitationLedger,
}

impl<'a> CommitteeAssembler<'a> {
    pub fn new(ledger: &'a mut InvitationLedger) -> Self {
        Self { ledger }
    }

    pub fn describe_committee_status(&self, phase: Phase) -> CommitteeStatus {
        CommitteeStatus::of(self.ledger, phase)
    }

    /// Partial success is expected: a failed candidate never undoes the others.
    pub fn propose_committee(
        &mut self,
        phase: Phase,
        candidates: &[FacultyCode],
        message: &str,
        now: DateTime<Utc>,
    ) -> Vec<CandidateOutcome> {
        let mut outcomes = Vec::with_capacity(candidates.len());

        for faculty in candidates {
            if !self.describe_committee_status(phase).can_propose() {
                outcomes.push(CandidateOutcome {
                    faculty: faculty.clone(),
                    outcome: ProposalOutcome::QuotaExceeded,
                    invitation: None,
                });
                continue;
            }

            let draft = InvitationDraft {
                faculty: faculty.clone(),
                phase,
                kind: InvitationKind::Committee,
                message: message.to_string(),
            };
            let outcome = match self.ledger.create_invitation(draft, now) {
                Ok(invitation) => CandidateOutcome {
                    faculty: faculty.clone(),
                    outcome: ProposalOutcome::Created,
                    invitation: Some(invitation.clone()),
                },
                Err(err) => CandidateOutcome {
                    faculty: faculty.clone(),
                    outcome: ProposalOutcome::from(&err),
                    invitation: None,
                },
            };
            outcomes.push(outcome);
        }

        let created = outcomes.iter().filter(|outcome| outcome.is_created()).count();
        info!(
            thesis = %self.ledger.thesis_id(),
            phase = phase.number(),
            proposed = candidates.len(),
            created,
            "committee proposal evaluated"
        );
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn codes(values: &[&str]) -> Vec<FacultyCode> {
        values.iter().map(|value| FacultyCode::from(*value)).collect()
    }

    fn advised_ledger() -> InvitationLedger {
        InvitationLedger::new(Uuid::new_v4()).with_advisor_of_record(Some(FacultyCode::from("ADV")))
    }

    #[test]
    fn reports_each_candidate_without_rollback() {
        let mut ledger = advised_ledger();
        let mut assembler = CommitteeAssembler::new(&mut ledger);

        let outcomes = assembler.propose_committee(
            Phase::Project,
            &codes(&["F01", "ADV", "F01", "F02", "F03"]),
            "Committee for the project defense",
            Utc::now(),
        );

        let kinds: Vec<ProposalOutcome> = outcomes.iter().map(|o| o.outcome.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                ProposalOutcome::Created,
                ProposalOutcome::SelfConflict,
                ProposalOutcome::DuplicateInvitation,
                ProposalOutcome::Created,
                ProposalOutcome::QuotaExceeded,
            ]
        );
        assert!(outcomes[0].invitation.is_some());
        assert_eq!(ledger.active_count(Phase::Project, InvitationKind::Committee), 2);
    }

    #[test]
    fn status_tracks_pending_and_accepted() {
        let mut ledger = advised_ledger();
        let now = Utc::now();
        CommitteeAssembler::new(&mut ledger).propose_committee(
            Phase::Final,
            &codes(&["F01", "F02"]),
            "",
            now,
        );
        ledger
            .respond_invitation(&FacultyCode::from("F02"), Phase::Final, true, now)
            .unwrap();

        let status = CommitteeAssembler::new(&mut ledger).describe_committee_status(Phase::Final);
        assert_eq!(
            status,
            CommitteeStatus {
                phase: Phase::Final,
                pending: 1,
                accepted: 1,
                remaining_budget: 0,
            }
        );
        assert!(!status.can_propose());

        let project = CommitteeStatus::of(&ledger, Phase::Project);
        assert_eq!(project.remaining_budget, 2);
    }

    #[test]
    fn exhausted_budget_skips_the_ledger() {
        let mut ledger = advised_ledger();
        let now = Utc::now();
        CommitteeAssembler::new(&mut ledger).propose_committee(
            Phase::Project,
            &codes(&["F01", "F02"]),
            "",
            now,
        );
        let before = ledger.history().len();

        let outcomes = CommitteeAssembler::new(&mut ledger).propose_committee(
            Phase::Project,
            &codes(&["ADV", "F09"]),
            "",
            now,
        );
        assert!(outcomes
            .iter()
            .all(|outcome| outcome.outcome == ProposalOutcome::QuotaExceeded));
        assert_eq!(ledger.history().len(), before);
    }

    #[test]
    fn refusal_reopens_a_seat() {
        let mut ledger = advised_ledger();
        let now = Utc::now();
        CommitteeAssembler::new(&mut ledger).propose_committee(
            Phase::Project,
            &codes(&["F01", "F02"]),
            "",
            now,
        );
        ledger
            .respond_invitation(&FacultyCode::from("F01"), Phase::Project, false, now)
            .unwrap();

        let outcomes = CommitteeAssembler::new(&mut ledger).propose_committee(
            Phase::Project,
            &codes(&["F03"]),
            "",
            now,
        );
        assert!(outcomes[0].is_created());
    }
}
