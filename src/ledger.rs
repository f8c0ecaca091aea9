use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::InvitationError;
use crate::models::{
    FacultyCode, Invitation, InvitationDraft, InvitationKind, Phase, ThesisId, ThesisSnapshot,
};

/// Committee seats per (thesis, phase), advisor excluded.
pub const COMMITTEE_SEATS: usize = 2;
/// Active advising invitations allowed per (thesis, phase).
pub const ADVISING_SEATS: usize = 1;

pub fn seats(kind: InvitationKind) -> usize {
    match kind {
        InvitationKind::Advising => ADVISING_SEATS,
        InvitationKind::Committee => COMMITTEE_SEATS,
    }
}

/// Invitation log of a single thesis.
///
/// Cancelled rows stay in the log so history can be shown, but they never
/// count towards duplicates or quotas. Every rule is checked here, both by
/// the client against its latest read and by the store inside the
/// transaction that persists a new invitation.
#[derive(Debug, Clone)]
pub struct InvitationLedger {
    thesis_id: ThesisId,
    invitations: Vec<Invitation>,
    advisor_of_record: Option<FacultyCode>,
}

impl InvitationLedger {
    pub fn new(thesis_id: ThesisId) -> Self {
        Self {
            thesis_id,
            invitations: Vec::new(),
            advisor_of_record: None,
        }
    }

    pub fn from_invitations(thesis_id: ThesisId, invitations: Vec<Invitation>) -> Self {
        let invitations = invitations
            .into_iter()
            .filter(|invitation| invitation.thesis_id == thesis_id)
            .collect();
        Self {
            invitations,
            ..Self::new(thesis_id)
        }
    }

    pub fn from_snapshot(snapshot: &ThesisSnapshot) -> Self {
        Self::from_invitations(snapshot.thesis.id, snapshot.invitations.clone()).with_advisor_of_record(
            snapshot
                .orientorship
                .as_ref()
                .map(|orientorship| orientorship.faculty.clone()),
        )
    }

    /// Advisor assigned outside the invitation flow (e.g. by an administrator).
    pub fn with_advisor_of_record(mut self, faculty: Option<FacultyCode>) -> Self {
        self.advisor_of_record = faculty;
        self
    }

    pub fn thesis_id(&self) -> ThesisId {
        self.thesis_id
    }

    /// Every invitation including cancelled ones, in insertion order.
    pub fn history(&self) -> &[Invitation] {
        &self.invitations
    }

    /// Non-cancelled invitations, optionally narrowed by phase and kind.
    pub fn list_invitations(
        &self,
        phase: Option<Phase>,
        kind: Option<InvitationKind>,
    ) -> Vec<&Invitation> {
        self.invitations
            .iter()
            .filter(|invitation| invitation.cancelled_at.is_none())
            .filter(|invitation| phase.map_or(true, |phase| invitation.phase == phase))
            .filter(|invitation| kind.map_or(true, |kind| invitation.kind == kind))
            .collect()
    }

    pub fn active(&self, phase: Phase, kind: InvitationKind) -> impl Iterator<Item = &Invitation> {
        self.invitations.iter().filter(move |invitation| {
            invitation.phase == phase && invitation.kind == kind && invitation.is_active()
        })
    }

    pub fn active_count(&self, phase: Phase, kind: InvitationKind) -> usize {
        self.active(phase, kind).count()
    }

    pub fn accepted_count(&self, phase: Phase, kind: InvitationKind) -> usize {
        self.active(phase, kind)
            .filter(|invitation| invitation.is_accepted())
            .count()
    }

    pub fn remaining_budget(&self, phase: Phase, kind: InvitationKind) -> usize {
        seats(kind).saturating_sub(self.active_count(phase, kind))
    }

    /// Accepted committee members for a phase, in the order they were invited.
    pub fn committee_members(&self, phase: Phase) -> Vec<&FacultyCode> {
        self.active(phase, InvitationKind::Committee)
            .filter(|invitation| invitation.is_accepted())
            .map(|invitation| &invitation.faculty)
            .collect()
    }

    /// The advisor of record, or else the faculty member with an accepted advising invitation.
    pub fn advisor(&self) -> Option<&FacultyCode> {
        self.advisor_of_record.as_ref().or_else(|| {
            self.invitations
                .iter()
                .rev()
                .find(|invitation| {
                    invitation.kind == InvitationKind::Advising && invitation.is_accepted()
                })
                .map(|invitation| &invitation.faculty)
        })
    }

    pub fn has_accepted_advisor(&self) -> bool {
        self.advisor().is_some()
    }

    fn holds_active(&self, faculty: &FacultyCode, kind: InvitationKind) -> bool {
        self.invitations.iter().any(|invitation| {
            invitation.kind == kind && invitation.is_active() && &invitation.faculty == faculty
        })
    }

    /// Runs every creation rule without touching the log.
    pub fn check_create(&self, draft: &InvitationDraft) -> Result<(), InvitationError> {
        let duplicate = self
            .active(draft.phase, draft.kind)
            .any(|invitation| invitation.faculty == draft.faculty);
        if duplicate {
            return Err(InvitationError::DuplicateInvitation {
                faculty: draft.faculty.clone(),
                phase: draft.phase,
                kind: draft.kind,
            });
        }

        let conflict = match draft.kind {
            InvitationKind::Committee => {
                self.advisor() == Some(&draft.faculty)
                    || self.holds_active(&draft.faculty, InvitationKind::Advising)
            }
            InvitationKind::Advising => {
                self.holds_active(&draft.faculty, InvitationKind::Committee)
            }
        };
        if conflict {
            return Err(InvitationError::SelfConflict {
                faculty: draft.faculty.clone(),
            });
        }

        if self.remaining_budget(draft.phase, draft.kind) == 0 {
            return Err(InvitationError::QuotaExceeded {
                phase: draft.phase,
                kind: draft.kind,
                limit: seats(draft.kind),
            });
        }

        Ok(())
    }

    pub fn create_invitation(
        &mut self,
        draft: InvitationDraft,
        now: DateTime<Utc>,
    ) -> Result<&Invitation, InvitationError> {
        self.check_create(&draft)?;
        let invitation = Invitation {
            id: Uuid::new_v4(),
            thesis_id: self.thesis_id,
            faculty: draft.faculty,
            phase: draft.phase,
            kind: draft.kind,
            message: draft.message,
            sent_at: now,
            responded_at: None,
            accepted: false,
            cancelled_at: None,
        };
        debug!(thesis = %self.thesis_id, faculty = %invitation.faculty, kind = %invitation.kind, "invitation created");
        self.invitations.push(invitation);
        Ok(&self.invitations[self.invitations.len() - 1])
    }

    /// Indices of non-cancelled rows for (faculty, phase), oldest first.
    fn matching(&self, faculty: &FacultyCode, phase: Phase) -> Vec<usize> {
        self.invitations
            .iter()
            .enumerate()
            .filter(|(_, invitation)| {
                invitation.cancelled_at.is_none()
                    && invitation.phase == phase
                    && &invitation.faculty == faculty
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Pending rows win over answered ones so a re-invitation after a refusal can be answered.
    fn locate(&self, faculty: &FacultyCode, phase: Phase) -> Option<usize> {
        let matching = self.matching(faculty, phase);
        matching
            .iter()
            .rev()
            .copied()
            .find(|&index| self.invitations[index].responded_at.is_none())
            .or_else(|| matching.last().copied())
    }

    /// The row a response for (faculty, phase) would be written to.
    pub fn response_target(&self, faculty: &FacultyCode, phase: Phase) -> Option<&Invitation> {
        self.locate(faculty, phase).map(|index| &self.invitations[index])
    }

    /// The invitation `id`, if the answer `accepted` is on record for it.
    pub fn response_recorded(&self, id: Uuid, accepted: bool) -> Option<&Invitation> {
        self.invitations.iter().find(|invitation| {
            invitation.id == id
                && invitation.cancelled_at.is_none()
                && invitation.responded_at.is_some()
                && invitation.accepted == accepted
        })
    }

    pub fn respond_invitation(
        &mut self,
        faculty: &FacultyCode,
        phase: Phase,
        accepted: bool,
        now: DateTime<Utc>,
    ) -> Result<&Invitation, InvitationError> {
        let index = self
            .locate(faculty, phase)
            .ok_or_else(|| InvitationError::NotFound {
                faculty: faculty.clone(),
                phase,
            })?;
        let invitation = &mut self.invitations[index];
        if invitation.responded_at.is_some() {
            return Err(InvitationError::AlreadyResponded {
                faculty: faculty.clone(),
                phase,
            });
        }
        invitation.responded_at = Some(now);
        invitation.accepted = accepted;
        debug!(thesis = %self.thesis_id, faculty = %faculty, accepted, "invitation answered");
        Ok(&self.invitations[index])
    }

    /// Logically removes an invitation whatever its response state.
    pub fn cancel_invitation(
        &mut self,
        faculty: &FacultyCode,
        phase: Phase,
        now: DateTime<Utc>,
    ) -> Result<&Invitation, InvitationError> {
        let matching = self.matching(faculty, phase);
        let index = matching
            .iter()
            .rev()
            .copied()
            .find(|&index| self.invitations[index].is_active())
            .or_else(|| matching.last().copied())
            .ok_or_else(|| InvitationError::NotFound {
                faculty: faculty.clone(),
                phase,
            })?;
        self.invitations[index].cancelled_at = Some(now);
        if self.advisor_of_record.as_ref() == Some(faculty)
            && self.invitations[index].kind == InvitationKind::Advising
        {
            self.advisor_of_record = None;
        }
        Ok(&self.invitations[index])
    }
}
