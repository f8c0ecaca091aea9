use std::path::PathBuf;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

mod availability;
mod committee;
mod config;
mod db;
mod error;
mod evaluation;
mod ledger;
mod models;
mod report;
mod retry;
mod service;
mod stage;

use availability::OfferingGrid;
use error::{ProgressError, TransitionRejection};
use models::{
    ContentEdit, FacultyCode, InvitationKind, NewThesis, OfferingKey, Phase, Stage, Term,
    ThesisFilter,
};
use service::ProgressService;

#[derive(Parser)]
#[command(name = "thesis-progress")]
#[command(about = "Capstone thesis progression tracker: stages, invitations, committees and defenses", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: config::Settings,
    /// Print results as JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo offering, faculty calendars and one thesis
    Seed,
    #[command(subcommand)]
    Thesis(ThesisCommand),
    #[command(subcommand)]
    Advisor(AdvisorCommand),
    #[command(subcommand)]
    Invitation(InvitationCommand),
    #[command(subcommand)]
    Committee(CommitteeCommand),
    #[command(subcommand)]
    Offering(OfferingCommand),
    #[command(subcommand)]
    Availability(AvailabilityCommand),
    #[command(subcommand)]
    Defense(DefenseCommand),
    /// Generate a markdown dossier for one thesis
    Report {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long, default_value = "thesis-report.md")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum ThesisCommand {
    /// Register a thesis at stage 0
    Create {
        #[arg(long)]
        student: String,
        #[command(flatten)]
        offering: OfferingArgs,
    },
    List {
        #[arg(long)]
        student: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long, value_parser = parse_term)]
        term: Option<Term>,
        #[arg(long, value_parser = parse_phase)]
        phase: Option<Phase>,
    },
    Show {
        #[arg(long)]
        thesis: Uuid,
    },
    /// Update drafted text; omitted fields are left as they are
    Edit {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long)]
        theme: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long = "abstract")]
        abstract_text: Option<String>,
        #[arg(long)]
        seminar_notes: Option<String>,
    },
    /// Print the stage table of a phase
    Stages {
        #[arg(long, value_parser = parse_phase)]
        phase: Phase,
    },
    /// Move the thesis to another stage; forward moves are checked
    Transition {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long, value_parser = parse_stage)]
        to: Stage,
    },
}

#[derive(Subcommand)]
enum AdvisorCommand {
    /// Invite a faculty member to advise the thesis in its current phase
    Invite {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long)]
        faculty: FacultyCode,
        #[arg(long, default_value = "")]
        message: String,
    },
}

#[derive(Subcommand)]
enum InvitationCommand {
    /// Non-cancelled invitations of one thesis
    List {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long, value_parser = parse_phase)]
        phase: Option<Phase>,
        #[arg(long, value_parser = parse_kind)]
        kind: Option<InvitationKind>,
    },
    /// Non-cancelled invitations addressed to one faculty member
    Inbox {
        #[arg(long)]
        faculty: FacultyCode,
        #[arg(long, value_parser = parse_phase)]
        phase: Option<Phase>,
    },
    #[command(group(
        ArgGroup::new("answer")
            .args(["accept", "decline"])
            .required(true)
            .multiple(false)
    ))]
    Respond {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long)]
        faculty: FacultyCode,
        #[arg(long, value_parser = parse_phase)]
        phase: Phase,
        #[arg(long)]
        accept: bool,
        #[arg(long)]
        decline: bool,
    },
    Cancel {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long)]
        faculty: FacultyCode,
        #[arg(long, value_parser = parse_phase)]
        phase: Phase,
    },
}

#[derive(Subcommand)]
enum CommitteeCommand {
    /// Invite candidates to the committee; each one is judged on its own
    Propose {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long, value_parser = parse_phase)]
        phase: Phase,
        #[arg(long = "candidate", required = true)]
        candidates: Vec<FacultyCode>,
        #[arg(long, default_value = "")]
        message: String,
    },
    Status {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long, value_parser = parse_phase)]
        phase: Phase,
    },
}

#[derive(Subcommand)]
enum OfferingCommand {
    /// Replace the defense-slot universe of an offering
    Configure {
        #[command(flatten)]
        offering: OfferingArgs,
        #[arg(long = "date", required = true)]
        dates: Vec<NaiveDate>,
        #[arg(long = "time", required = true, value_parser = parse_time)]
        times: Vec<NaiveTime>,
    },
}

#[derive(Subcommand)]
enum AvailabilityCommand {
    /// Replace one faculty member's grid; listed slots are open, the rest closed
    Sync {
        #[arg(long)]
        faculty: FacultyCode,
        #[command(flatten)]
        offering: OfferingArgs,
        #[arg(long = "open", value_parser = parse_slot)]
        open: Vec<NaiveDateTime>,
    },
    /// Import grids from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Slots open for the advisor and both committee members
    Common {
        #[arg(long)]
        thesis: Uuid,
    },
}

#[derive(Subcommand)]
enum DefenseCommand {
    Schedule {
        #[arg(long)]
        thesis: Uuid,
        /// Local date and time, e.g. 2025-06-10T14:00
        #[arg(long, value_parser = parse_slot)]
        at: NaiveDateTime,
    },
    Grade {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long)]
        faculty: FacultyCode,
        #[arg(long)]
        score: f64,
    },
    Evaluation {
        #[arg(long)]
        thesis: Uuid,
        #[arg(long, value_parser = parse_phase)]
        phase: Option<Phase>,
    },
}

#[derive(Args)]
struct OfferingArgs {
    #[arg(long)]
    course: String,
    #[arg(long)]
    year: i32,
    #[arg(long, value_parser = parse_term)]
    term: Term,
    #[arg(long, value_parser = parse_phase)]
    phase: Phase,
}

impl OfferingArgs {
    fn key(&self) -> OfferingKey {
        OfferingKey {
            year: self.year,
            term: self.term,
            course_code: self.course.clone(),
            phase: self.phase,
        }
    }
}

fn parse_phase(value: &str) -> Result<Phase, String> {
    value
        .parse::<i16>()
        .ok()
        .and_then(Phase::from_number)
        .ok_or_else(|| format!("phase must be 1 or 2, got {value:?}"))
}

fn parse_term(value: &str) -> Result<Term, String> {
    value
        .parse::<i16>()
        .ok()
        .and_then(Term::from_number)
        .ok_or_else(|| format!("term must be 1 or 2, got {value:?}"))
}

fn parse_stage(value: &str) -> Result<Stage, String> {
    value
        .parse::<u8>()
        .ok()
        .and_then(Stage::new)
        .ok_or_else(|| format!("stage must be between 0 and {}, got {value:?}", Stage::MAX))
}

fn parse_kind(value: &str) -> Result<InvitationKind, String> {
    InvitationKind::parse(value).ok_or_else(|| format!("kind must be advising or committee, got {value:?}"))
}

fn parse_time(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|err| format!("{value:?}: {err}"))
}

fn parse_slot(value: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M"))
        .map_err(|err| format!("{value:?}: {err}"))
}

fn print_stages(phase: Phase, json: bool) -> anyhow::Result<()> {
    let track = stage::track(phase);
    if json {
        let rules: Vec<_> = track
            .rules()
            .iter()
            .map(|rule| {
                serde_json::json!({
                    "stage": rule.stage,
                    "label": rule.label,
                    "kind": rule.kind,
                    "drafts": rule.drafts,
                })
            })
            .collect();
        return print_json(&rules);
    }
    println!("Phase {} stages:", track.phase);
    for rule in track.rules() {
        match rule.drafts {
            Some(field) => println!("{:>2}  {} (writes {field})", rule.stage.value(), rule.label),
            None => println!("{:>2}  {}", rule.stage.value(), rule.label),
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    config::init_tracing(cli.settings.log_json);

    // The stage table is static; no connection needed.
    if let Commands::Thesis(ThesisCommand::Stages { phase }) = &cli.command {
        return print_stages(*phase, cli.json);
    }

    let pool = cli.settings.connect().await?;
    let service = ProgressService::new(pool, cli.settings.retry_policy());
    let json = cli.json;

    match cli.command {
        Commands::InitDb => {
            db::init_db(service.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let thesis_id = db::seed(service.pool()).await?;
            println!("Seed data inserted; demo thesis {thesis_id}.");
        }
        Commands::Thesis(command) => run_thesis(&service, command, json).await?,
        Commands::Advisor(AdvisorCommand::Invite {
            thesis,
            faculty,
            message,
        }) => {
            let invitation = service.invite_advisor(thesis, faculty, message).await?;
            if json {
                print_json(&invitation)?;
            } else {
                println!(
                    "Advising invitation sent to {} for phase {}.",
                    invitation.faculty, invitation.phase
                );
            }
        }
        Commands::Invitation(command) => run_invitation(&service, command, json).await?,
        Commands::Committee(command) => run_committee(&service, command, json).await?,
        Commands::Offering(OfferingCommand::Configure {
            offering,
            dates,
            times,
        }) => {
            let grid = OfferingGrid::new(offering.key(), dates, times);
            let cells = service.configure_offering(&grid).await?;
            println!("Offering {} now has {cells} defense slots.", grid.offering);
        }
        Commands::Availability(command) => run_availability(&service, command, json).await?,
        Commands::Defense(command) => run_defense(&service, command, json).await?,
        Commands::Report { thesis, out } => {
            let snapshot = service.load_snapshot(thesis).await?;
            let common = match service.common_slots(thesis).await {
                Ok((_, common)) => Some(common),
                Err(ProgressError::NoAdvisorOfRecord)
                | Err(ProgressError::Transition(TransitionRejection::IncompleteCommittee { .. })) => None,
                Err(err) => return Err(err.into()),
            };
            let report = report::build_report(&snapshot, common.as_ref(), Utc::now());
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn run_thesis(service: &ProgressService, command: ThesisCommand, json: bool) -> anyhow::Result<()> {
    match command {
        ThesisCommand::Create { student, offering } => {
            let thesis = service
                .create_thesis(&NewThesis {
                    student_code: student,
                    course_code: offering.course,
                    year: offering.year,
                    term: offering.term,
                    phase: offering.phase,
                })
                .await?;
            if json {
                print_json(&thesis)?;
            } else {
                println!("Thesis {} registered for student {}.", thesis.id, thesis.student_code);
            }
        }
        ThesisCommand::List {
            student,
            course,
            year,
            term,
            phase,
        } => {
            let theses = service
                .find_theses(&ThesisFilter {
                    student_code: student,
                    course_code: course,
                    year,
                    term,
                    phase,
                })
                .await?;
            if json {
                return print_json(&theses);
            }
            if theses.is_empty() {
                println!("No theses match.");
            }
            for thesis in &theses {
                println!(
                    "- {} student {} {} {}/{} phase {} stage {}",
                    thesis.id,
                    thesis.student_code,
                    thesis.course_code,
                    thesis.year,
                    thesis.term.number(),
                    thesis.phase.number(),
                    thesis.stage
                );
            }
        }
        ThesisCommand::Show { thesis } => {
            let snapshot = service.load_snapshot(thesis).await?;
            let track = stage::track(snapshot.thesis.phase);
            let blocker = report::next_blocker(&snapshot);
            if json {
                return print_json(&serde_json::json!({
                    "thesis": snapshot.thesis,
                    "stage_label": track.label(snapshot.thesis.stage),
                    "invitations": snapshot.invitations,
                    "defenses": snapshot.defenses,
                    "orientorship": snapshot.orientorship,
                    "next_blocker": blocker,
                }));
            }
            let current = &snapshot.thesis;
            println!(
                "Thesis {} (student {}), phase {}, stage {}: {}",
                current.id,
                current.student_code,
                current.phase,
                current.stage,
                track.label(current.stage)
            );
            if let Some(orientorship) = &snapshot.orientorship {
                println!("Advisor of record: {}", orientorship.faculty);
            }
            match blocker {
                Some(reason) => println!("Next step blocked: {reason}"),
                None => println!("No blocker for the next stage."),
            }
        }
        ThesisCommand::Edit {
            thesis,
            theme,
            title,
            abstract_text,
            seminar_notes,
        } => {
            let edit = ContentEdit {
                theme,
                title,
                abstract_text,
                seminar_notes,
            };
            let updated = service.edit_content(thesis, &edit).await?;
            if json {
                print_json(&updated)?;
            } else {
                println!("Thesis {} content saved (version {}).", updated.id, updated.version);
            }
        }
        ThesisCommand::Stages { phase } => print_stages(phase, json)?,
        ThesisCommand::Transition { thesis, to } => {
            let moved = service.attempt_transition(thesis, to).await?;
            if json {
                print_json(&moved)?;
            } else {
                println!(
                    "Thesis {} is at stage {}: {}",
                    moved.id,
                    moved.stage,
                    stage::track(moved.phase).label(moved.stage)
                );
            }
        }
    }
    Ok(())
}

async fn run_invitation(
    service: &ProgressService,
    command: InvitationCommand,
    json: bool,
) -> anyhow::Result<()> {
    let invitations = match command {
        InvitationCommand::List {
            thesis,
            phase,
            kind,
        } => service.list_invitations(thesis, phase, kind).await?,
        InvitationCommand::Inbox { faculty, phase } => {
            service.faculty_invitations(&faculty, phase).await?
        }
        InvitationCommand::Respond {
            thesis,
            faculty,
            phase,
            accept,
            ..
        } => vec![service.respond_invitation(thesis, &faculty, phase, accept).await?],
        InvitationCommand::Cancel {
            thesis,
            faculty,
            phase,
        } => vec![service.cancel_invitation(thesis, &faculty, phase).await?],
    };

    if json {
        return print_json(&invitations);
    }
    if invitations.is_empty() {
        println!("No invitations.");
    }
    for invitation in &invitations {
        let status = serde_json::to_value(invitation.status())?;
        println!(
            "- {} {} thesis {} phase {}: {}",
            invitation.kind,
            invitation.faculty,
            invitation.thesis_id,
            invitation.phase.number(),
            status.as_str().unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_committee(
    service: &ProgressService,
    command: CommitteeCommand,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        CommitteeCommand::Propose {
            thesis,
            phase,
            candidates,
            message,
        } => {
            let outcomes = service
                .propose_committee(thesis, phase, &candidates, &message)
                .await?;
            if json {
                return print_json(&outcomes);
            }
            for outcome in &outcomes {
                let label = serde_json::to_value(&outcome.outcome)?;
                println!(
                    "- {}: {}",
                    outcome.faculty,
                    label["outcome"].as_str().unwrap_or_default()
                );
            }
        }
        CommitteeCommand::Status { thesis, phase } => {
            let status = service.committee_status(thesis, phase).await?;
            if json {
                return print_json(&status);
            }
            println!(
                "Phase {} committee: {} accepted, {} pending, {} seat(s) open.",
                status.phase, status.accepted, status.pending, status.remaining_budget
            );
            if !status.can_propose() {
                println!("No further candidates can be invited.");
            }
        }
    }
    Ok(())
}

async fn run_availability(
    service: &ProgressService,
    command: AvailabilityCommand,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        AvailabilityCommand::Sync {
            faculty,
            offering,
            open,
        } => {
            let open: Vec<(NaiveDate, NaiveTime)> =
                open.iter().map(|slot| (slot.date(), slot.time())).collect();
            let offering = offering.key();
            let written = service
                .synchronize_availability(&faculty, &offering, &open)
                .await?;
            println!("Stored {written} slots for {faculty} in {offering}.");
        }
        AvailabilityCommand::Import { csv } => {
            let grids = db::import_availability_csv(service.pool(), &csv).await?;
            println!("Replaced {grids} availability grids from {}.", csv.display());
        }
        AvailabilityCommand::Common { thesis } => {
            let (grid, common) = service.common_slots(thesis).await?;
            if json {
                return print_json(&common);
            }
            if grid.is_empty() {
                println!("Offering {} has no defense slots configured.", grid.offering);
            } else if common.is_empty() {
                println!("No common slot among {} offered.", grid.len());
            }
            for (date, times) in common.by_date() {
                let times: Vec<String> = times
                    .iter()
                    .map(|time| time.format("%H:%M").to_string())
                    .collect();
                println!("- {}: {}", date, times.join(", "));
            }
        }
    }
    Ok(())
}

async fn run_defense(
    service: &ProgressService,
    command: DefenseCommand,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        DefenseCommand::Schedule { thesis, at } => {
            let rows = service.schedule_defense(thesis, at).await?;
            println!("Defense set for {} on {rows} board rows.", at.format("%Y-%m-%d %H:%M"));
        }
        DefenseCommand::Grade {
            thesis,
            faculty,
            score,
        } => {
            let defense = service.record_score(thesis, &faculty, score).await?;
            if json {
                return print_json(&defense);
            }
            println!("Recorded {score:.1} from {faculty}.");
            let aggregate = service.evaluation(thesis, Some(defense.phase)).await?;
            if aggregate.complete {
                println!(
                    "Evaluation complete: mean {:.2}, {}.",
                    aggregate.mean.unwrap_or_default(),
                    if aggregate.auto_approved { "approved" } else { "not approved" }
                );
            }
        }
        DefenseCommand::Evaluation { thesis, phase } => {
            let aggregate = service.evaluation(thesis, phase).await?;
            if json {
                return print_json(&aggregate);
            }
            match aggregate.mean {
                Some(mean) => println!(
                    "Phase {}: mean {:.2} from {}/{} grades, complete {}, approved {}.",
                    aggregate.phase,
                    mean,
                    aggregate.scored,
                    aggregate.expected,
                    aggregate.complete,
                    aggregate.auto_approved
                ),
                None => println!("Phase {}: no grades recorded.", aggregate.phase),
            }
        }
    }
    Ok(())
}
