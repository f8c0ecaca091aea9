use serde::Serialize;

use crate::ledger::COMMITTEE_SEATS;
use crate::models::{Defense, FacultyCode, Phase, ThesisId};

pub const APPROVAL_THRESHOLD: f64 = 6.0;
pub const MAX_SCORE: f64 = 10.0;

pub fn is_valid_score(score: f64) -> bool {
    score.is_finite() && (0.0..=MAX_SCORE).contains(&score)
}

/// Derived view of a phase's committee scores. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvaluationAggregate {
    pub phase: Phase,
    pub mean: Option<f64>,
    pub scored: usize,
    pub expected: usize,
    pub complete: bool,
    pub auto_approved: bool,
}

/// Aggregates the defense rows of the seated committee of one thesis and phase.
///
/// `members` are the currently accepted committee members. Rows kept from a
/// member whose seat was cancelled after grading are ignored. Scores are
/// summed in sorted order so the mean does not depend on the order in which
/// rows were graded or read back.
pub fn compute_aggregate(
    defenses: &[Defense],
    thesis_id: ThesisId,
    phase: Phase,
    members: &[&FacultyCode],
) -> EvaluationAggregate {
    let committee: Vec<&Defense> = defenses
        .iter()
        .filter(|defense| defense.thesis_id == thesis_id && defense.phase == phase)
        .filter(|defense| !defense.is_advisor && members.contains(&&defense.faculty))
        .collect();

    let mut scores: Vec<f64> = committee.iter().filter_map(|defense| defense.score).collect();
    scores.sort_by(f64::total_cmp);

    let mean = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    };
    let complete = committee.len() == COMMITTEE_SEATS && scores.len() == COMMITTEE_SEATS;

    EvaluationAggregate {
        phase,
        mean,
        scored: scores.len(),
        expected: COMMITTEE_SEATS,
        complete,
        auto_approved: complete && mean.is_some_and(|mean| mean >= APPROVAL_THRESHOLD),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn seated(codes: &[&str]) -> Vec<FacultyCode> {
        codes.iter().map(|code| FacultyCode::from(*code)).collect()
    }

    fn aggregate_for(rows: &[Defense], thesis: ThesisId, members: &[FacultyCode]) -> EvaluationAggregate {
        let members: Vec<&FacultyCode> = members.iter().collect();
        compute_aggregate(rows, thesis, Phase::Project, &members)
    }

    fn row(thesis_id: ThesisId, faculty: &str, is_advisor: bool, score: Option<f64>) -> Defense {
        Defense {
            id: Uuid::new_v4(),
            thesis_id,
            phase: Phase::Project,
            faculty: FacultyCode::from(faculty),
            is_advisor,
            scheduled_at: None,
            score,
        }
    }

    #[test]
    fn boundary_mean_is_approved() {
        let thesis = Uuid::new_v4();
        let rows = vec![
            row(thesis, "ADV", true, None),
            row(thesis, "F01", false, Some(7.0)),
            row(thesis, "F02", false, Some(5.0)),
        ];
        let aggregate = aggregate_for(&rows, thesis, &seated(&["F01", "F02"]));
        assert_eq!(aggregate.mean, Some(6.0));
        assert!(aggregate.complete);
        assert!(aggregate.auto_approved);
    }

    #[test]
    fn single_grade_is_incomplete() {
        let thesis = Uuid::new_v4();
        let rows = vec![
            row(thesis, "ADV", true, None),
            row(thesis, "F01", false, Some(8.5)),
            row(thesis, "F02", false, None),
        ];
        let aggregate = aggregate_for(&rows, thesis, &seated(&["F01", "F02"]));
        assert_eq!(aggregate.mean, Some(8.5));
        assert_eq!(aggregate.scored, 1);
        assert!(!aggregate.complete);
        assert!(!aggregate.auto_approved);
    }

    #[test]
    fn complete_but_below_threshold_fails() {
        let thesis = Uuid::new_v4();
        let rows = vec![
            row(thesis, "F01", false, Some(6.0)),
            row(thesis, "F02", false, Some(5.5)),
        ];
        let aggregate = aggregate_for(&rows, thesis, &seated(&["F01", "F02"]));
        assert!(aggregate.complete);
        assert!(!aggregate.auto_approved);
    }

    #[test]
    fn advisor_score_and_other_phases_are_ignored() {
        let thesis = Uuid::new_v4();
        let mut final_row = row(thesis, "F03", false, Some(1.0));
        final_row.phase = Phase::Final;
        let rows = vec![
            row(thesis, "ADV", true, Some(10.0)),
            row(Uuid::new_v4(), "F01", false, Some(2.0)),
            final_row,
        ];
        let aggregate = aggregate_for(&rows, thesis, &seated(&["F01", "F02"]));
        assert_eq!(aggregate.mean, None);
        assert_eq!(aggregate.scored, 0);
        assert!(!aggregate.complete);
    }

    #[test]
    fn score_range_is_inclusive() {
        assert!(is_valid_score(0.0));
        assert!(is_valid_score(10.0));
        assert!(!is_valid_score(10.5));
        assert!(!is_valid_score(f64::NAN));
    }

    #[test]
    fn replaced_member_score_is_left_out() {
        let thesis = Uuid::new_v4();
        let rows = vec![
            row(thesis, "ADV", true, None),
            row(thesis, "F01", false, Some(2.0)),
            row(thesis, "F02", false, Some(7.0)),
            row(thesis, "F03", false, Some(9.0)),
        ];
        let aggregate = aggregate_for(&rows, thesis, &seated(&["F02", "F03"]));
        assert_eq!(aggregate.mean, Some(8.0));
        assert_eq!(aggregate.scored, 2);
        assert!(aggregate.complete);
        assert!(aggregate.auto_approved);
    }

    #[test]
    fn half_seated_committee_is_incomplete() {
        let thesis = Uuid::new_v4();
        let rows = vec![
            row(thesis, "F01", false, Some(8.0)),
            row(thesis, "F02", false, Some(8.0)),
        ];
        let aggregate = aggregate_for(&rows, thesis, &seated(&["F01"]));
        assert_eq!(aggregate.scored, 1);
        assert!(!aggregate.complete);
    }

    proptest! {
        #[test]
        fn aggregate_ignores_recording_order(
            scores in proptest::collection::vec(proptest::option::of(0u32..=100), 0..4),
            seed in any::<u64>(),
        ) {
            let thesis = Uuid::new_v4();
            let rows: Vec<Defense> = scores
                .iter()
                .enumerate()
                .map(|(index, score)| {
                    row(thesis, &format!("F{index}"), false, score.map(|tenths| f64::from(tenths) / 10.0))
                })
                .collect();
            let mut shuffled = rows.clone();
            let len = shuffled.len().max(1);
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();

            let members = seated(&["F0", "F1"]);
            let first = aggregate_for(&rows, thesis, &members);
            prop_assert_eq!(first, aggregate_for(&shuffled, thesis, &members));
            prop_assert_eq!(first, aggregate_for(&rows, thesis, &members));
        }
    }
}
