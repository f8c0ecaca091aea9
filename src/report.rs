use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::availability::CommonSlots;
use crate::committee::CommitteeStatus;
use crate::evaluation::compute_aggregate;
use crate::ledger::InvitationLedger;
use crate::models::{ContentField, InvitationStatus, Stage, ThesisSnapshot};
use crate::stage::{track, StageStateMachine, TransitionContext};

/// What stops the thesis from moving one stage forward, if anything.
pub fn next_blocker(snapshot: &ThesisSnapshot) -> Option<String> {
    let thesis = &snapshot.thesis;
    let next = Stage::new(thesis.stage.value() + 1)?;
    if next > track(thesis.phase).max_stage() {
        return None;
    }
    let ledger = InvitationLedger::from_snapshot(snapshot);
    StageStateMachine::new()
        .attempt_transition(
            thesis,
            next,
            TransitionContext {
                ledger: &ledger,
                defenses: &snapshot.defenses,
            },
        )
        .err()
        .map(|rejection| rejection.to_string())
}

pub fn build_report(
    snapshot: &ThesisSnapshot,
    common: Option<&CommonSlots>,
    generated_at: DateTime<Utc>,
) -> String {
    let thesis = &snapshot.thesis;
    let phase_track = track(thesis.phase);
    let ledger = InvitationLedger::from_snapshot(snapshot);
    let committee = CommitteeStatus::of(&ledger, thesis.phase);
    let aggregate = compute_aggregate(
        &snapshot.defenses,
        thesis.id,
        thesis.phase,
        &ledger.committee_members(thesis.phase),
    );

    let mut output = String::new();
    let _ = writeln!(output, "# Thesis Progress Report");
    let _ = writeln!(
        output,
        "Student {} in {} ({}/{}), generated {}",
        thesis.student_code,
        thesis.course_code,
        thesis.year,
        thesis.term.number(),
        generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Stage");
    let _ = writeln!(
        output,
        "Phase {}, stage {} of {}: {}",
        thesis.phase,
        thesis.stage,
        phase_track.max_stage(),
        phase_track.label(thesis.stage)
    );
    match next_blocker(snapshot) {
        Some(blocker) => {
            let _ = writeln!(output, "Next step blocked: {blocker}");
        }
        None if thesis.stage == phase_track.max_stage() => {
            let _ = writeln!(output, "Phase complete.");
        }
        None => {
            let _ = writeln!(output, "Ready to advance.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Content");
    for field in [
        ContentField::Theme,
        ContentField::Title,
        ContentField::Abstract,
        ContentField::SeminarNotes,
    ] {
        let _ = writeln!(
            output,
            "- {}: {}",
            field.label(),
            thesis.content(field).unwrap_or("(not written)")
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Invitations");
    let advisor = ledger.advisor();
    let _ = writeln!(
        output,
        "Advisor of record: {}",
        advisor.map_or("none".to_string(), ToString::to_string)
    );
    let invitations = ledger.history();
    if invitations.is_empty() {
        let _ = writeln!(output, "No invitations sent.");
    } else {
        for invitation in invitations {
            let status = match invitation.status() {
                InvitationStatus::Pending => "pending",
                InvitationStatus::Accepted => "accepted",
                InvitationStatus::Rejected => "rejected",
                InvitationStatus::Cancelled => "cancelled",
            };
            let _ = writeln!(
                output,
                "- {} {} for phase {}: {} (sent {})",
                invitation.kind,
                invitation.faculty,
                invitation.phase.number(),
                status,
                invitation.sent_at.format("%Y-%m-%d")
            );
        }
    }
    let _ = writeln!(
        output,
        "Committee: {} accepted, {} pending, {} seat(s) open",
        committee.accepted, committee.pending, committee.remaining_budget
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Defense");
    let scheduled = snapshot
        .defenses
        .iter()
        .filter(|defense| defense.phase == thesis.phase)
        .find_map(|defense| defense.scheduled_at);
    match scheduled {
        Some(at) => {
            let _ = writeln!(output, "Scheduled for {}", at.format("%Y-%m-%d %H:%M"));
        }
        None => {
            let _ = writeln!(output, "Not scheduled.");
        }
    }
    match aggregate.mean {
        Some(mean) => {
            let verdict = if aggregate.auto_approved {
                "approved"
            } else if aggregate.complete {
                "not approved"
            } else {
                "partial"
            };
            let _ = writeln!(
                output,
                "Mean score {:.2} from {}/{} grades ({verdict})",
                mean, aggregate.scored, aggregate.expected
            );
        }
        None => {
            let _ = writeln!(output, "No grades recorded.");
        }
    }

    if let Some(common) = common {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Common Availability");
        if common.is_empty() {
            let _ = writeln!(output, "No slot is open for the whole board.");
        } else {
            for (date, times) in common.by_date() {
                let times: Vec<String> = times
                    .iter()
                    .map(|time| time.format("%H:%M").to_string())
                    .collect();
                let _ = writeln!(output, "- {}: {}", date, times.join(", "));
            }
        }
    }

    output
}
