use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::availability::{intersect_availability, CommonSlots, FacultyGrid, OfferingGrid};
use crate::committee::{CandidateOutcome, CommitteeAssembler, CommitteeStatus, ProposalOutcome};
use crate::db;
use crate::error::{ProgressError, TransitionRejection};
use crate::evaluation::{compute_aggregate, is_valid_score, EvaluationAggregate};
use crate::ledger::{InvitationLedger, COMMITTEE_SEATS};
use crate::models::{
    ContentEdit, Defense, FacultyCode, Invitation, InvitationDraft, InvitationKind, NewThesis,
    OfferingKey, Phase, Stage, Thesis, ThesisFilter, ThesisId, ThesisSnapshot,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::stage::{StageStateMachine, TransitionContext};

pub struct ProgressService {
    pool: PgPool,
    retry: RetryPolicy,
    machine: StageStateMachine,
}

impl ProgressService {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self {
            pool,
            retry,
            machine: StageStateMachine::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // Theses

    pub async fn create_thesis(&self, new: &NewThesis) -> Result<Thesis, ProgressError> {
        let thesis = db::insert_thesis(&self.pool, new).await?;
        info!(thesis = %thesis.id, student = %thesis.student_code, "thesis created");
        Ok(thesis)
    }

    pub async fn find_theses(&self, filter: &ThesisFilter) -> Result<Vec<Thesis>, ProgressError> {
        let pool = &self.pool;
        with_retry(&self.retry, "find theses", || async move {
            Ok::<_, ProgressError>(db::find_theses(pool, filter).await?)
        })
        .await
    }

    /// Thesis, invitations, defense rows and advisor of record, fetched concurrently.
    pub async fn load_snapshot(&self, id: ThesisId) -> Result<ThesisSnapshot, ProgressError> {
        let pool = &self.pool;
        with_retry(&self.retry, "load snapshot", || async move {
            let (thesis, invitations, defenses, orientorship) = tokio::try_join!(
                db::fetch_thesis(pool, id),
                db::fetch_invitations(pool, id),
                db::fetch_defenses(pool, id),
                db::fetch_orientorship(pool, id),
            )?;
            Ok::<_, ProgressError>(ThesisSnapshot {
                thesis,
                invitations,
                defenses,
                orientorship,
            })
        })
        .await
    }

    async fn fetch_thesis(&self, id: ThesisId) -> Result<Thesis, ProgressError> {
        let pool = &self.pool;
        with_retry(&self.retry, "fetch thesis", || async move {
            Ok::<_, ProgressError>(db::fetch_thesis(pool, id).await?)
        })
        .await
    }

    pub async fn edit_content(&self, id: ThesisId, edit: &ContentEdit) -> Result<Thesis, ProgressError> {
        let mut thesis = self.fetch_thesis(id).await?;
        if edit.is_empty() {
            return Ok(thesis);
        }
        edit.apply(&mut thesis);
        Ok(db::update_content(&self.pool, &thesis).await?)
    }

    /// Validates the move against a fresh snapshot, then stores it.
    ///
    /// When the write times out the outcome is unknown: the thesis is read back
    /// and the move counts as done only if the stored stage already is `target`.
    pub async fn attempt_transition(&self, id: ThesisId, target: Stage) -> Result<Thesis, ProgressError> {
        let snapshot = self.load_snapshot(id).await?;
        let ledger = InvitationLedger::from_snapshot(&snapshot);
        let advanced = self.machine.attempt_transition(
            &snapshot.thesis,
            target,
            TransitionContext {
                ledger: &ledger,
                defenses: &snapshot.defenses,
            },
        )?;

        if advanced.stage == snapshot.thesis.stage {
            return Ok(snapshot.thesis);
        }

        match db::update_stage(&self.pool, &advanced).await {
            Ok(stored) => {
                info!(thesis = %id, from = %snapshot.thesis.stage, to = %stored.stage, "stage stored");
                Ok(stored)
            }
            Err(err) if err.is_retryable() => {
                warn!(thesis = %id, error = %err, "stage update outcome unknown, re-reading");
                let stored = self.fetch_thesis(id).await?;
                if stored.stage == target && stored.version > snapshot.thesis.version {
                    Ok(stored)
                } else {
                    Err(err.into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    // Invitations

    pub async fn list_invitations(
        &self,
        id: ThesisId,
        phase: Option<Phase>,
        kind: Option<InvitationKind>,
    ) -> Result<Vec<Invitation>, ProgressError> {
        let ledger = self.fetch_ledger(id).await?;
        Ok(ledger
            .list_invitations(phase, kind)
            .into_iter()
            .cloned()
            .collect())
    }

    pub async fn faculty_invitations(
        &self,
        faculty: &FacultyCode,
        phase: Option<Phase>,
    ) -> Result<Vec<Invitation>, ProgressError> {
        let pool = &self.pool;
        with_retry(&self.retry, "faculty invitations", || async move {
            Ok::<_, ProgressError>(db::fetch_faculty_invitations(pool, faculty, phase).await?)
        })
        .await
    }

    /// Stores one invitation. After a transport failure the log is re-read
    /// instead of re-sending, so a write that did land is not duplicated.
    async fn store_invitation(
        &self,
        id: ThesisId,
        draft: InvitationDraft,
    ) -> Result<Invitation, ProgressError> {
        match db::insert_invitation(&self.pool, id, draft.clone(), Utc::now()).await {
            Err(err) if err.is_retryable() => {
                warn!(thesis = %id, faculty = %draft.faculty, error = %err, "invitation outcome unknown, re-reading");
                let invitations = self.list_invitations(id, Some(draft.phase), Some(draft.kind)).await?;
                invitations
                    .into_iter()
                    .find(|invitation| invitation.faculty == draft.faculty && invitation.is_active())
                    .ok_or(err)
            }
            other => other,
        }
    }

    pub async fn invite_advisor(
        &self,
        id: ThesisId,
        faculty: FacultyCode,
        message: String,
    ) -> Result<Invitation, ProgressError> {
        let snapshot = self.load_snapshot(id).await?;
        let draft = InvitationDraft {
            faculty,
            phase: snapshot.thesis.phase,
            kind: InvitationKind::Advising,
            message,
        };
        InvitationLedger::from_snapshot(&snapshot).check_create(&draft)?;
        self.store_invitation(id, draft).await
    }

    pub async fn respond_invitation(
        &self,
        id: ThesisId,
        faculty: &FacultyCode,
        phase: Phase,
        accepted: bool,
    ) -> Result<Invitation, ProgressError> {
        let target = self
            .fetch_ledger(id)
            .await?
            .response_target(faculty, phase)
            .map(|invitation| invitation.id);

        match db::respond_invitation(&self.pool, id, faculty, phase, accepted, Utc::now()).await {
            Err(err) if err.is_retryable() => {
                warn!(thesis = %id, faculty = %faculty, error = %err, "response outcome unknown, re-reading");
                let Some(target) = target else {
                    return Err(err);
                };
                self.fetch_ledger(id)
                    .await?
                    .response_recorded(target, accepted)
                    .cloned()
                    .ok_or(err)
            }
            other => other,
        }
    }

    async fn fetch_ledger(&self, id: ThesisId) -> Result<InvitationLedger, ProgressError> {
        let pool = &self.pool;
        let invitations = with_retry(&self.retry, "fetch invitations", || async move {
            Ok::<_, ProgressError>(db::fetch_invitations(pool, id).await?)
        })
        .await?;
        Ok(InvitationLedger::from_invitations(id, invitations))
    }

    pub async fn cancel_invitation(
        &self,
        id: ThesisId,
        faculty: &FacultyCode,
        phase: Phase,
    ) -> Result<Invitation, ProgressError> {
        db::cancel_invitation(&self.pool, id, faculty, phase, Utc::now()).await
    }

    // Committee

    pub async fn committee_status(&self, id: ThesisId, phase: Phase) -> Result<CommitteeStatus, ProgressError> {
        let snapshot = self.load_snapshot(id).await?;
        Ok(CommitteeStatus::of(&InvitationLedger::from_snapshot(&snapshot), phase))
    }

    /// Checks all candidates locally, then stores the ones that passed one by one.
    pub async fn propose_committee(
        &self,
        id: ThesisId,
        phase: Phase,
        candidates: &[FacultyCode],
        message: &str,
    ) -> Result<Vec<CandidateOutcome>, ProgressError> {
        let snapshot = self.load_snapshot(id).await?;
        let mut ledger = InvitationLedger::from_snapshot(&snapshot);
        let mut outcomes =
            CommitteeAssembler::new(&mut ledger).propose_committee(phase, candidates, message, Utc::now());

        for outcome in outcomes.iter_mut().filter(|outcome| outcome.is_created()) {
            let Some(local) = outcome.invitation.take() else {
                continue;
            };
            let draft = InvitationDraft {
                faculty: local.faculty,
                phase: local.phase,
                kind: local.kind,
                message: local.message,
            };
            match self.store_invitation(id, draft).await {
                Ok(stored) => outcome.invitation = Some(stored),
                Err(ProgressError::Invitation(err)) => {
                    warn!(thesis = %id, faculty = %outcome.faculty, %err, "store rejected committee invitation");
                    outcome.outcome = ProposalOutcome::from(&err);
                }
                Err(err) => {
                    outcome.outcome = ProposalOutcome::Failed {
                        reason: err.to_string(),
                    };
                }
            }
        }
        Ok(outcomes)
    }

    // Availability

    pub async fn configure_offering(&self, grid: &OfferingGrid) -> Result<usize, ProgressError> {
        let pool = &self.pool;
        with_retry(&self.retry, "configure offering", || async move {
            Ok::<_, ProgressError>(db::replace_offering_grid(pool, grid).await?)
        })
        .await
    }

    /// Replaces the faculty member's grid with `open`; every other cell becomes unavailable.
    pub async fn synchronize_availability(
        &self,
        faculty: &FacultyCode,
        offering: &OfferingKey,
        open: &[(NaiveDate, NaiveTime)],
    ) -> Result<usize, ProgressError> {
        let pool = &self.pool;
        let grid = with_retry(&self.retry, "fetch offering grid", || async move {
            Ok::<_, ProgressError>(db::fetch_offering_grid(pool, offering).await?)
        })
        .await?;
        let slots = FacultyGrid::synchronize(faculty, &grid, open.iter().copied());
        let slots = &slots;
        with_retry(&self.retry, "replace faculty grid", || async move {
            Ok::<_, ProgressError>(db::replace_faculty_grid(pool, faculty, offering, slots).await?)
        })
        .await
    }

    /// Common slots of the advisor and both accepted committee members.
    ///
    /// The four grids are fetched concurrently; if any fetch fails the whole
    /// lookup fails and is retried as a unit.
    pub async fn common_slots(&self, id: ThesisId) -> Result<(OfferingGrid, CommonSlots), ProgressError> {
        let snapshot = self.load_snapshot(id).await?;
        self.common_slots_for(&snapshot).await
    }

    async fn common_slots_for(
        &self,
        snapshot: &ThesisSnapshot,
    ) -> Result<(OfferingGrid, CommonSlots), ProgressError> {
        let thesis = &snapshot.thesis;
        let ledger = InvitationLedger::from_snapshot(snapshot);
        let advisor = ledger.advisor().ok_or(ProgressError::NoAdvisorOfRecord)?;
        let members = ledger.committee_members(thesis.phase);
        let &[first, second] = members.as_slice() else {
            return Err(TransitionRejection::IncompleteCommittee {
                phase: thesis.phase,
                accepted: members.len(),
                required: COMMITTEE_SEATS,
            }
            .into());
        };

        let pool = &self.pool;
        let offering = &thesis.offering();
        let (grid, advisor_grid, first_grid, second_grid) =
            with_retry(&self.retry, "fetch availability grids", || async move {
                Ok::<_, ProgressError>(tokio::try_join!(
                    db::fetch_offering_grid(pool, offering),
                    db::fetch_faculty_grid(pool, advisor, offering),
                    db::fetch_faculty_grid(pool, first, offering),
                    db::fetch_faculty_grid(pool, second, offering),
                )?)
            })
            .await?;

        let common = intersect_availability(&grid, [&advisor_grid, &first_grid, &second_grid]);
        info!(thesis = %thesis.id, offering = %offering, shared = common.len(), "availability intersected");
        Ok((grid, common))
    }

    // Defense

    pub async fn schedule_defense(&self, id: ThesisId, at: NaiveDateTime) -> Result<u64, ProgressError> {
        let snapshot = self.load_snapshot(id).await?;
        let ledger = InvitationLedger::from_snapshot(&snapshot);
        let phase = snapshot.thesis.phase;
        let accepted = ledger.accepted_count(phase, InvitationKind::Committee);
        if accepted != COMMITTEE_SEATS {
            return Err(TransitionRejection::IncompleteCommittee {
                phase,
                accepted,
                required: COMMITTEE_SEATS,
            }
            .into());
        }

        let (_, common) = self.common_slots_for(&snapshot).await?;
        if !common.contains(at) {
            return Err(ProgressError::SlotUnavailable { at });
        }

        let pool = &self.pool;
        let updated = with_retry(&self.retry, "schedule defense", || async move {
            Ok::<_, ProgressError>(db::schedule_defense(pool, id, phase, at).await?)
        })
        .await?;

        info!(thesis = %id, %at, rows = updated, "defense scheduled");
        Ok(updated)
    }

    pub async fn record_score(
        &self,
        id: ThesisId,
        faculty: &FacultyCode,
        score: f64,
    ) -> Result<Defense, ProgressError> {
        if !is_valid_score(score) {
            return Err(ProgressError::InvalidScore { score });
        }
        let thesis = self.fetch_thesis(id).await?;
        let pool = &self.pool;
        let phase = thesis.phase;
        with_retry(&self.retry, "record score", || async move {
            Ok::<_, ProgressError>(db::record_score(pool, id, phase, faculty, score).await?)
        })
        .await
    }

    pub async fn evaluation(
        &self,
        id: ThesisId,
        phase: Option<Phase>,
    ) -> Result<EvaluationAggregate, ProgressError> {
        let snapshot = self.load_snapshot(id).await?;
        let phase = phase.unwrap_or(snapshot.thesis.phase);
        let ledger = InvitationLedger::from_snapshot(&snapshot);
        Ok(compute_aggregate(
            &snapshot.defenses,
            id,
            phase,
            &ledger.committee_members(phase),
        ))
    }
}
