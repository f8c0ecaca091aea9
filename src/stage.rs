//! Per-phase stage tables and the forward-transition guards.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::TransitionRejection;
use crate::evaluation::compute_aggregate;
use crate::ledger::{InvitationLedger, COMMITTEE_SEATS};
use crate::models::{ContentField, Defense, InvitationKind, Phase, Stage, Thesis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    AwaitingAdvisor,
    Drafting,
    Review,
    Administrative,
    DefenseScheduling,
    Graded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRule {
    pub stage: Stage,
    pub label: &'static str,
    pub kind: StageKind,
    /// Field written while the thesis sits in this stage.
    pub drafts: Option<ContentField>,
}

const fn rule(
    stage: u8,
    label: &'static str,
    kind: StageKind,
    drafts: Option<ContentField>,
) -> StageRule {
    StageRule {
        stage: Stage(stage),
        label,
        kind,
        drafts,
    }
}

const PROJECT_RULES: [StageRule; 7] = [
    rule(0, "selecting topic, awaiting advisor", StageKind::AwaitingAdvisor, None),
    rule(1, "drafting theme", StageKind::Drafting, Some(ContentField::Theme)),
    rule(2, "drafting title", StageKind::Drafting, Some(ContentField::Title)),
    rule(3, "drafting abstract", StageKind::Drafting, Some(ContentField::Abstract)),
    rule(4, "advisor review", StageKind::Review, None),
    rule(5, "project defense scheduling", StageKind::DefenseScheduling, None),
    rule(6, "project defense graded", StageKind::Graded, None),
];

const FINAL_RULES: [StageRule; 10] = [
    rule(0, "selecting topic, awaiting advisor", StageKind::AwaitingAdvisor, None),
    rule(1, "drafting theme", StageKind::Drafting, Some(ContentField::Theme)),
    rule(2, "drafting title", StageKind::Drafting, Some(ContentField::Title)),
    rule(3, "drafting abstract", StageKind::Drafting, Some(ContentField::Abstract)),
    rule(4, "advisor review", StageKind::Review, None),
    rule(5, "project defense on record", StageKind::Administrative, None),
    rule(6, "project approval filed", StageKind::Administrative, None),
    rule(7, "progress seminar", StageKind::Drafting, Some(ContentField::SeminarNotes)),
    rule(8, "final defense scheduling", StageKind::DefenseScheduling, None),
    rule(9, "final defense graded, process complete", StageKind::Graded, None),
];

#[derive(Debug)]
pub struct PhaseTrack {
    pub phase: Phase,
    pub scheduling: Stage,
    pub terminal: Stage,
    rules: &'static [StageRule],
}

static PROJECT_TRACK: PhaseTrack = PhaseTrack {
    phase: Phase::Project,
    scheduling: Stage::PROJECT_SCHEDULING,
    terminal: Stage::PROJECT_GRADED,
    rules: &PROJECT_RULES,
};

static FINAL_TRACK: PhaseTrack = PhaseTrack {
    phase: Phase::Final,
    scheduling: Stage::FINAL_SCHEDULING,
    terminal: Stage::FINAL_GRADED,
    rules: &FINAL_RULES,
};

pub fn track(phase: Phase) -> &'static PhaseTrack {
    match phase {
        Phase::Project => &PROJECT_TRACK,
        Phase::Final => &FINAL_TRACK,
    }
}

impl PhaseTrack {
    pub fn max_stage(&self) -> Stage {
        self.terminal
    }

    pub fn rules(&self) -> &'static [StageRule] {
        self.rules
    }

    pub fn rule(&self, stage: Stage) -> Option<&'static StageRule> {
        self.rules.iter().find(|rule| rule.stage == stage)
    }

    pub fn label(&self, stage: Stage) -> &'static str {
        self.rule(stage).map_or("unknown stage", |rule| rule.label)
    }

    /// Fields drafted in the stages before `target`.
    pub fn required_content(&self, target: Stage) -> impl Iterator<Item = ContentField> + '_ {
        self.rules
            .iter()
            .filter(move |rule| rule.stage < target)
            .filter_map(|rule| rule.drafts)
    }
}

/// What the guards may look at besides the thesis itself.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub ledger: &'a InvitationLedger,
    pub defenses: &'a [Defense],
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StageStateMachine;

impl StageStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Returns the thesis at `target`, or the first unmet precondition.
    ///
    /// The input thesis is never modified; rejection has no side effects.
    pub fn attempt_transition(
        &self,
        thesis: &Thesis,
        target: Stage,
        context: TransitionContext<'_>,
    ) -> Result<Thesis, TransitionRejection> {
        let track = track(thesis.phase);
        if target > track.max_stage() {
            return Err(TransitionRejection::StageOutOfRange {
                target,
                max: track.max_stage(),
                phase: thesis.phase,
            });
        }

        if target > thesis.stage {
            if let Err(rejection) = self.check_forward(thesis, target, track, context) {
                info!(thesis = %thesis.id, from = %thesis.stage, to = %target, %rejection, "stage transition rejected");
                return Err(rejection);
            }
        }

        debug!(thesis = %thesis.id, from = %thesis.stage, to = %target, "stage transition accepted");
        let mut advanced = thesis.clone();
        advanced.stage = target;
        Ok(advanced)
    }

    fn check_forward(
        &self,
        thesis: &Thesis,
        target: Stage,
        track: &PhaseTrack,
        context: TransitionContext<'_>,
    ) -> Result<(), TransitionRejection> {
        if thesis.stage == Stage::AWAITING_ADVISOR && !context.ledger.has_accepted_advisor() {
            return Err(TransitionRejection::MissingAdvisor { target });
        }

        if target >= track.scheduling {
            if let Some(field) = track
                .required_content(target)
                .find(|field| thesis.content(*field).is_none())
            {
                return Err(TransitionRejection::IncompleteContent { field, target });
            }
        }

        if thesis.stage <= track.scheduling && target > track.scheduling {
            check_committee(thesis, context)?;
        }

        if target >= track.terminal {
            let members = context.ledger.committee_members(thesis.phase);
            let aggregate =
                compute_aggregate(context.defenses, thesis.id, thesis.phase, &members);
            if !aggregate.complete {
                return Err(TransitionRejection::IncompleteEvaluation {
                    phase: thesis.phase,
                    scored: aggregate.scored,
                    required: aggregate.expected,
                });
            }
        }

        Ok(())
    }
}

/// A defense date on record is only valid with both committee seats accepted.
pub fn check_committee(
    thesis: &Thesis,
    context: TransitionContext<'_>,
) -> Result<(), TransitionRejection> {
    let scheduled = context.defenses.iter().any(|defense| {
        defense.thesis_id == thesis.id
            && defense.phase == thesis.phase
            && defense.scheduled_at.is_some()
    });
    let accepted = context
        .ledger
        .accepted_count(thesis.phase, InvitationKind::Committee);
    if scheduled && accepted != COMMITTEE_SEATS {
        return Err(TransitionRejection::IncompleteCommittee {
            phase: thesis.phase,
            accepted,
            required: COMMITTEE_SEATS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FacultyCode, InvitationDraft, Term};
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn stage(value: u8) -> Stage {
        Stage::new(value).unwrap()
    }

    fn thesis(phase: Phase, at: u8) -> Thesis {
        Thesis {
            id: Uuid::new_v4(),
            student_code: "2021001".to_string(),
            course_code: "CS-TCC".to_string(),
            year: 2025,
            term: Term::First,
            phase,
            stage: stage(at),
            theme: Some("Distributed consensus".to_string()),
            title: Some("Raft under partitions".to_string()),
            abstract_text: Some("We measure leader election latency.".to_string()),
            seminar_notes: Some("Presented preliminary results.".to_string()),
            version: 0,
        }
    }

    fn invite(ledger: &mut InvitationLedger, faculty: &str, phase: Phase, kind: InvitationKind, accept: bool) {
        let now = Utc::now();
        ledger
            .create_invitation(
                InvitationDraft {
                    faculty: FacultyCode::from(faculty),
                    phase,
                    kind,
                    message: String::new(),
                },
                now,
            )
            .unwrap();
        if accept {
            ledger
                .respond_invitation(&FacultyCode::from(faculty), phase, true, now)
                .unwrap();
        }
    }

    fn committee_ledger(thesis: &Thesis) -> InvitationLedger {
        let mut ledger = InvitationLedger::new(thesis.id);
        invite(&mut ledger, "ADV", thesis.phase, InvitationKind::Advising, true);
        invite(&mut ledger, "F01", thesis.phase, InvitationKind::Committee, true);
        invite(&mut ledger, "F02", thesis.phase, InvitationKind::Committee, true);
        ledger
    }

    fn defenses(thesis: &Thesis, scores: [Option<f64>; 2], scheduled: bool) -> Vec<Defense> {
        let at = NaiveDate::from_ymd_opt(2025, 6, 10)
            .and_then(|date| date.and_hms_opt(14, 0, 0))
            .filter(|_| scheduled);
        let mut rows = vec![Defense {
            id: Uuid::new_v4(),
            thesis_id: thesis.id,
            phase: thesis.phase,
            faculty: FacultyCode::from("ADV"),
            is_advisor: true,
            scheduled_at: at,
            score: None,
        }];
        for (faculty, score) in ["F01", "F02"].into_iter().zip(scores) {
            rows.push(Defense {
                id: Uuid::new_v4(),
                thesis_id: thesis.id,
                phase: thesis.phase,
                faculty: FacultyCode::from(faculty),
                is_advisor: false,
                scheduled_at: at,
                score,
            });
        }
        rows
    }

    #[test]
    fn pending_advisor_blocks_first_step() {
        let thesis = thesis(Phase::Project, 0);
        let mut ledger = InvitationLedger::new(thesis.id);
        invite(&mut ledger, "ADV", Phase::Project, InvitationKind::Advising, false);

        let result = StageStateMachine::new().attempt_transition(
            &thesis,
            stage(1),
            TransitionContext {
                ledger: &ledger,
                defenses: &[],
            },
        );
        assert_eq!(result, Err(TransitionRejection::MissingAdvisor { target: stage(1) }));
    }

    #[test]
    fn accepted_advisor_unlocks_drafting() {
        let thesis = thesis(Phase::Project, 0);
        let mut ledger = InvitationLedger::new(thesis.id);
        invite(&mut ledger, "ADV", Phase::Project, InvitationKind::Advising, true);

        let moved = StageStateMachine::new()
            .attempt_transition(
                &thesis,
                stage(1),
                TransitionContext {
                    ledger: &ledger,
                    defenses: &[],
                },
            )
            .unwrap();
        assert_eq!(moved.stage, stage(1));
        assert_eq!(thesis.stage, stage(0));
    }

    #[test]
    fn missing_abstract_blocks_scheduling() {
        let mut thesis = thesis(Phase::Project, 4);
        thesis.abstract_text = Some("   ".to_string());
        let ledger = committee_ledger(&thesis);

        let result = StageStateMachine::new().attempt_transition(
            &thesis,
            Stage::PROJECT_SCHEDULING,
            TransitionContext {
                ledger: &ledger,
                defenses: &[],
            },
        );
        assert_eq!(
            result,
            Err(TransitionRejection::IncompleteContent {
                field: ContentField::Abstract,
                target: Stage::PROJECT_SCHEDULING,
            })
        );
    }

    #[test]
    fn drafting_stages_do_not_check_content() {
        let mut thesis = thesis(Phase::Project, 1);
        thesis.title = None;
        let ledger = committee_ledger(&thesis);
        let result = StageStateMachine::new().attempt_transition(
            &thesis,
            stage(3),
            TransitionContext {
                ledger: &ledger,
                defenses: &[],
            },
        );
        assert!(result.is_ok());
    }

    #[test]
    fn final_phase_requires_seminar_notes() {
        let mut thesis = thesis(Phase::Final, 7);
        thesis.seminar_notes = None;
        let ledger = committee_ledger(&thesis);
        let result = StageStateMachine::new().attempt_transition(
            &thesis,
            Stage::FINAL_SCHEDULING,
            TransitionContext {
                ledger: &ledger,
                defenses: &[],
            },
        );
        assert!(matches!(
            result,
            Err(TransitionRejection::IncompleteContent {
                field: ContentField::SeminarNotes,
                ..
            })
        ));
    }

    #[test]
    fn scheduled_defense_without_full_committee_is_blocked() {
        let thesis = thesis(Phase::Project, 5);
        let mut ledger = InvitationLedger::new(thesis.id);
        invite(&mut ledger, "ADV", Phase::Project, InvitationKind::Advising, true);
        invite(&mut ledger, "F01", Phase::Project, InvitationKind::Committee, true);
        invite(&mut ledger, "F02", Phase::Project, InvitationKind::Committee, false);
        let rows = defenses(&thesis, [Some(8.0), Some(7.0)], true);

        let result = StageStateMachine::new().attempt_transition(
            &thesis,
            Stage::PROJECT_GRADED,
            TransitionContext {
                ledger: &ledger,
                defenses: &rows,
            },
        );
        assert_eq!(
            result,
            Err(TransitionRejection::IncompleteCommittee {
                phase: Phase::Project,
                accepted: 1,
                required: 2,
            })
        );
    }

    #[test]
    fn graded_stage_needs_complete_evaluation() {
        let thesis = thesis(Phase::Project, 5);
        let ledger = committee_ledger(&thesis);
        let rows = defenses(&thesis, [Some(8.0), None], true);
        let machine = StageStateMachine::new();

        let result = machine.attempt_transition(
            &thesis,
            Stage::PROJECT_GRADED,
            TransitionContext {
                ledger: &ledger,
                defenses: &rows,
            },
        );
        assert_eq!(
            result,
            Err(TransitionRejection::IncompleteEvaluation {
                phase: Phase::Project,
                scored: 1,
                required: 2,
            })
        );

        let rows = defenses(&thesis, [Some(8.0), Some(4.0)], true);
        let graded = machine
            .attempt_transition(
                &thesis,
                Stage::PROJECT_GRADED,
                TransitionContext {
                    ledger: &ledger,
                    defenses: &rows,
                },
            )
            .unwrap();
        assert_eq!(graded.stage, Stage::PROJECT_GRADED);
    }

    #[test]
    fn replacing_a_graded_member_still_lets_the_phase_finish() {
        let thesis = thesis(Phase::Project, 5);
        let mut ledger = committee_ledger(&thesis);
        let mut rows = defenses(&thesis, [Some(2.0), Some(7.0)], true);
        ledger
            .cancel_invitation(&FacultyCode::from("F01"), Phase::Project, Utc::now())
            .unwrap();
        invite(&mut ledger, "F03", Phase::Project, InvitationKind::Committee, true);
        rows.push(Defense {
            id: Uuid::new_v4(),
            thesis_id: thesis.id,
            phase: Phase::Project,
            faculty: FacultyCode::from("F03"),
            is_advisor: false,
            scheduled_at: rows[0].scheduled_at,
            score: Some(9.0),
        });

        let graded = StageStateMachine::new()
            .attempt_transition(
                &thesis,
                Stage::PROJECT_GRADED,
                TransitionContext {
                    ledger: &ledger,
                    defenses: &rows,
                },
            )
            .unwrap();
        assert_eq!(graded.stage, Stage::PROJECT_GRADED);
    }

    #[test]
    fn project_phase_caps_at_stage_six() {
        let thesis = thesis(Phase::Project, 6);
        let ledger = committee_ledger(&thesis);
        let result = StageStateMachine::new().attempt_transition(
            &thesis,
            stage(7),
            TransitionContext {
                ledger: &ledger,
                defenses: &[],
            },
        );
        assert!(matches!(result, Err(TransitionRejection::StageOutOfRange { .. })));
    }

    #[test]
    fn backward_moves_skip_every_guard() {
        let mut thesis = thesis(Phase::Final, 9);
        thesis.theme = None;
        let ledger = InvitationLedger::new(thesis.id);
        let moved = StageStateMachine::new()
            .attempt_transition(
                &thesis,
                stage(0),
                TransitionContext {
                    ledger: &ledger,
                    defenses: &[],
                },
            )
            .unwrap();
        assert_eq!(moved.stage, stage(0));
    }

    #[test]
    fn jump_to_final_grade_crosses_every_guard() {
        let thesis = thesis(Phase::Final, 0);
        let ledger = committee_ledger(&thesis);
        let rows = defenses(&thesis, [Some(9.0), Some(9.5)], true);
        let moved = StageStateMachine::new()
            .attempt_transition(
                &thesis,
                Stage::FINAL_GRADED,
                TransitionContext {
                    ledger: &ledger,
                    defenses: &rows,
                },
            )
            .unwrap();
        assert_eq!(moved.stage, Stage::FINAL_GRADED);
    }

    #[test]
    fn tracks_expose_labels_and_bounds() {
        assert_eq!(track(Phase::Project).max_stage(), stage(6));
        assert_eq!(track(Phase::Final).max_stage(), stage(9));
        assert_eq!(track(Phase::Final).label(stage(8)), "final defense scheduling");
        let required: Vec<ContentField> = track(Phase::Project)
            .required_content(Stage::PROJECT_SCHEDULING)
            .collect();
        assert_eq!(
            required,
            vec![ContentField::Theme, ContentField::Title, ContentField::Abstract]
        );
    }
}
