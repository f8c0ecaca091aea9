use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::availability::{group_by_grid, FacultyGrid, OfferingGrid};
use crate::error::{InvitationError, ProgressError, StoreError};
use crate::ledger::{InvitationLedger, COMMITTEE_SEATS};
use crate::models::{
    AvailabilitySlot, Defense, FacultyCode, Invitation, InvitationDraft, InvitationKind,
    NewThesis, OfferingKey, Orientorship, Phase, Stage, Term, Thesis, ThesisFilter, ThesisId,
};

const SELECT_THESIS: &str = "SELECT id, student_code, course_code, year, term, phase, stage, \
     theme, title, abstract_text, seminar_notes, version \
     FROM thesis_progress.theses";

const THESIS_RETURNING: &str = "RETURNING id, student_code, course_code, year, term, phase, stage, \
     theme, title, abstract_text, seminar_notes, version";

const SELECT_INVITATION: &str = "SELECT id, thesis_id, faculty_code, phase, kind, message, \
     sent_at, responded_at, accepted, cancelled_at \
     FROM thesis_progress.invitations";

const SELECT_DEFENSE: &str = "SELECT id, thesis_id, phase, faculty_code, is_advisor, scheduled_at, score \
     FROM thesis_progress.defenses";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn invalid(table: &'static str, reason: String) -> StoreError {
    StoreError::InvalidRow { table, reason }
}

fn phase_column(table: &'static str, row: &PgRow) -> Result<Phase, StoreError> {
    let value: i16 = row.try_get("phase")?;
    Phase::from_number(value).ok_or_else(|| invalid(table, format!("phase {value}")))
}

fn thesis_from_row(row: &PgRow) -> Result<Thesis, StoreError> {
    let term: i16 = row.try_get("term")?;
    let stage: i16 = row.try_get("stage")?;
    Ok(Thesis {
        id: row.try_get("id")?,
        student_code: row.try_get("student_code")?,
        course_code: row.try_get("course_code")?,
        year: row.try_get("year")?,
        term: Term::from_number(term).ok_or_else(|| invalid("theses", format!("term {term}")))?,
        phase: phase_column("theses", row)?,
        stage: u8::try_from(stage)
            .ok()
            .and_then(Stage::new)
            .ok_or_else(|| invalid("theses", format!("stage {stage}")))?,
        theme: row.try_get("theme")?,
        title: row.try_get("title")?,
        abstract_text: row.try_get("abstract_text")?,
        seminar_notes: row.try_get("seminar_notes")?,
        version: row.try_get("version")?,
    })
}

fn invitation_from_row(row: &PgRow) -> Result<Invitation, StoreError> {
    let kind: String = row.try_get("kind")?;
    let faculty: String = row.try_get("faculty_code")?;
    Ok(Invitation {
        id: row.try_get("id")?,
        thesis_id: row.try_get("thesis_id")?,
        faculty: FacultyCode::new(faculty),
        phase: phase_column("invitations", row)?,
        kind: InvitationKind::parse(&kind)
            .ok_or_else(|| invalid("invitations", format!("kind {kind}")))?,
        message: row.try_get("message")?,
        sent_at: row.try_get("sent_at")?,
        responded_at: row.try_get("responded_at")?,
        accepted: row.try_get("accepted")?,
        cancelled_at: row.try_get("cancelled_at")?,
    })
}

fn defense_from_row(row: &PgRow) -> Result<Defense, StoreError> {
    let faculty: String = row.try_get("faculty_code")?;
    Ok(Defense {
        id: row.try_get("id")?,
        thesis_id: row.try_get("thesis_id")?,
        phase: phase_column("defenses", row)?,
        faculty: FacultyCode::new(faculty),
        is_advisor: row.try_get("is_advisor")?,
        scheduled_at: row.try_get("scheduled_at")?,
        score: row.try_get("score")?,
    })
}

// Theses

pub async fn fetch_thesis<'e, E>(executor: E, id: ThesisId) -> Result<Thesis, StoreError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(&format!("{SELECT_THESIS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity: "thesis",
            id: id.to_string(),
        })?;
    thesis_from_row(&row)
}

pub async fn find_theses(pool: &PgPool, filter: &ThesisFilter) -> Result<Vec<Thesis>, StoreError> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_THESIS);
    builder.push(" WHERE TRUE");
    if let Some(student) = &filter.student_code {
        builder.push(" AND student_code = ").push_bind(student.clone());
    }
    if let Some(course) = &filter.course_code {
        builder.push(" AND course_code = ").push_bind(course.clone());
    }
    if let Some(year) = filter.year {
        builder.push(" AND year = ").push_bind(year);
    }
    if let Some(term) = filter.term {
        builder.push(" AND term = ").push_bind(term.number());
    }
    if let Some(phase) = filter.phase {
        builder.push(" AND phase = ").push_bind(phase.number());
    }
    builder.push(" ORDER BY year DESC, term DESC, course_code, student_code, phase");

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(thesis_from_row).collect()
}

pub async fn insert_thesis(pool: &PgPool, new: &NewThesis) -> Result<Thesis, StoreError> {
    let row = sqlx::query(&format!(
        "INSERT INTO thesis_progress.theses (id, student_code, course_code, year, term, phase, stage) \
         VALUES ($1, $2, $3, $4, $5, $6, 0) {THESIS_RETURNING}"
    ))
    .bind(Uuid::new_v4())
    .bind(&new.student_code)
    .bind(&new.course_code)
    .bind(new.year)
    .bind(new.term.number())
    .bind(new.phase.number())
    .fetch_one(pool)
    .await?;
    thesis_from_row(&row)
}

/// Compare-and-swap on `version`: a concurrent update turns into `StaleRead`.
pub async fn update_stage(pool: &PgPool, thesis: &Thesis) -> Result<Thesis, StoreError> {
    let row = sqlx::query(&format!(
        "UPDATE thesis_progress.theses SET stage = $2, version = version + 1 \
         WHERE id = $1 AND version = $3 {THESIS_RETURNING}"
    ))
    .bind(thesis.id)
    .bind(i16::from(thesis.stage.value()))
    .bind(thesis.version)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::StaleRead {
        entity: "thesis",
        id: thesis.id,
    })?;
    thesis_from_row(&row)
}

pub async fn update_content(pool: &PgPool, thesis: &Thesis) -> Result<Thesis, StoreError> {
    let row = sqlx::query(&format!(
        "UPDATE thesis_progress.theses \
         SET theme = $2, title = $3, abstract_text = $4, seminar_notes = $5, version = version + 1 \
         WHERE id = $1 AND version = $6 {THESIS_RETURNING}"
    ))
    .bind(thesis.id)
    .bind(&thesis.theme)
    .bind(&thesis.title)
    .bind(&thesis.abstract_text)
    .bind(&thesis.seminar_notes)
    .bind(thesis.version)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::StaleRead {
        entity: "thesis",
        id: thesis.id,
    })?;
    thesis_from_row(&row)
}

async fn lock_thesis(conn: &mut PgConnection, id: ThesisId) -> Result<(), StoreError> {
    sqlx::query("SELECT id FROM thesis_progress.theses WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity: "thesis",
            id: id.to_string(),
        })?;
    Ok(())
}

// Invitations and orientorships

pub async fn fetch_invitations<'e, E>(
    executor: E,
    thesis_id: ThesisId,
) -> Result<Vec<Invitation>, StoreError>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query(&format!(
        "{SELECT_INVITATION} WHERE thesis_id = $1 ORDER BY sent_at, id"
    ))
    .bind(thesis_id)
    .fetch_all(executor)
    .await?;
    rows.iter().map(invitation_from_row).collect()
}

pub async fn fetch_faculty_invitations(
    pool: &PgPool,
    faculty: &FacultyCode,
    phase: Option<Phase>,
) -> Result<Vec<Invitation>, StoreError> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_INVITATION);
    builder
        .push(" WHERE cancelled_at IS NULL AND faculty_code = ")
        .push_bind(faculty.as_str().to_string());
    if let Some(phase) = phase {
        builder.push(" AND phase = ").push_bind(phase.number());
    }
    builder.push(" ORDER BY sent_at DESC");

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(invitation_from_row).collect()
}

pub async fn fetch_orientorship<'e, E>(
    executor: E,
    thesis_id: ThesisId,
) -> Result<Option<Orientorship>, StoreError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(
        "SELECT thesis_id, faculty_code, assigned_at FROM thesis_progress.orientorships \
         WHERE thesis_id = $1 ORDER BY assigned_at DESC LIMIT 1",
    )
    .bind(thesis_id)
    .fetch_optional(executor)
    .await?;

    row.map(|row| -> Result<Orientorship, StoreError> {
        let faculty: String = row.try_get("faculty_code")?;
        Ok(Orientorship {
            thesis_id: row.try_get("thesis_id")?,
            faculty: FacultyCode::new(faculty),
            assigned_at: row.try_get("assigned_at")?,
        })
    })
    .transpose()
}

async fn load_ledger(
    conn: &mut PgConnection,
    thesis_id: ThesisId,
) -> Result<InvitationLedger, StoreError> {
    let invitations = fetch_invitations(&mut *conn, thesis_id).await?;
    let advisor = fetch_orientorship(&mut *conn, thesis_id)
        .await?
        .map(|orientorship| orientorship.faculty);
    Ok(InvitationLedger::from_invitations(thesis_id, invitations).with_advisor_of_record(advisor))
}

/// Persists a new invitation. The thesis row is locked and the ledger rules are
/// re-run on fresh rows, so this is the final word on duplicates and quotas.
pub async fn insert_invitation(
    pool: &PgPool,
    thesis_id: ThesisId,
    draft: InvitationDraft,
    now: DateTime<Utc>,
) -> Result<Invitation, ProgressError> {
    let mut tx = pool.begin().await?;
    lock_thesis(&mut tx, thesis_id).await?;
    let mut ledger = load_ledger(&mut tx, thesis_id).await?;
    let invitation = ledger.create_invitation(draft, now)?.clone();

    sqlx::query(
        r#"
        INSERT INTO thesis_progress.invitations
        (id, thesis_id, faculty_code, phase, kind, message, sent_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(invitation.id)
    .bind(thesis_id)
    .bind(invitation.faculty.as_str())
    .bind(invitation.phase.number())
    .bind(invitation.kind.as_str())
    .bind(&invitation.message)
    .bind(invitation.sent_at)
    .execute(&mut *tx)
    .await
    .map_err(|err| match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ProgressError::Invitation(InvitationError::DuplicateInvitation {
                faculty: invitation.faculty.clone(),
                phase: invitation.phase,
                kind: invitation.kind,
            })
        }
        other => ProgressError::from(other),
    })?;

    tx.commit().await?;
    info!(thesis = %thesis_id, faculty = %invitation.faculty, kind = %invitation.kind, "invitation stored");
    Ok(invitation)
}

/// Records an answer. Accepting an advising invitation makes the faculty member
/// advisor of record. Once both committee seats are accepted, any acceptance in
/// the phase makes sure the defense rows exist.
pub async fn respond_invitation(
    pool: &PgPool,
    thesis_id: ThesisId,
    faculty: &FacultyCode,
    phase: Phase,
    accepted: bool,
    now: DateTime<Utc>,
) -> Result<Invitation, ProgressError> {
    let mut tx = pool.begin().await?;
    lock_thesis(&mut tx, thesis_id).await?;
    let mut ledger = load_ledger(&mut tx, thesis_id).await?;
    let answered = ledger
        .respond_invitation(faculty, phase, accepted, now)?
        .clone();

    let updated = sqlx::query(
        "UPDATE thesis_progress.invitations SET responded_at = $2, accepted = $3 \
         WHERE id = $1 AND responded_at IS NULL AND cancelled_at IS NULL",
    )
    .bind(answered.id)
    .bind(now)
    .bind(accepted)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(InvitationError::AlreadyResponded {
            faculty: faculty.clone(),
            phase,
        }
        .into());
    }

    if answered.accepted && answered.kind == InvitationKind::Advising {
        sqlx::query(
            "INSERT INTO thesis_progress.orientorships (thesis_id, faculty_code, assigned_at) \
             VALUES ($1, $2, $3) ON CONFLICT (thesis_id, faculty_code) DO NOTHING",
        )
        .bind(thesis_id)
        .bind(faculty.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    if opens_defense_board(&ledger, &answered) {
        ensure_defense_rows(&mut tx, &ledger, phase).await?;
    }

    tx.commit().await?;
    info!(thesis = %thesis_id, faculty = %faculty, accepted, kind = %answered.kind, "invitation answered");
    Ok(answered)
}

/// Logically deletes an invitation and undoes what its acceptance set up.
pub async fn cancel_invitation(
    pool: &PgPool,
    thesis_id: ThesisId,
    faculty: &FacultyCode,
    phase: Phase,
    now: DateTime<Utc>,
) -> Result<Invitation, ProgressError> {
    let mut tx = pool.begin().await?;
    lock_thesis(&mut tx, thesis_id).await?;
    let mut ledger = load_ledger(&mut tx, thesis_id).await?;
    let cancelled = ledger.cancel_invitation(faculty, phase, now)?.clone();

    sqlx::query("UPDATE thesis_progress.invitations SET cancelled_at = $2 WHERE id = $1")
        .bind(cancelled.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    match cancelled.kind {
        InvitationKind::Advising => {
            sqlx::query(
                "DELETE FROM thesis_progress.orientorships WHERE thesis_id = $1 AND faculty_code = $2",
            )
            .bind(thesis_id)
            .bind(faculty.as_str())
            .execute(&mut *tx)
            .await?;
        }
        InvitationKind::Committee => {
            // Graded rows are kept for the record; only an empty seat is freed.
            sqlx::query(
                "DELETE FROM thesis_progress.defenses \
                 WHERE thesis_id = $1 AND phase = $2 AND faculty_code = $3 \
                 AND NOT is_advisor AND score IS NULL",
            )
            .bind(thesis_id)
            .bind(phase.number())
            .bind(faculty.as_str())
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    info!(thesis = %thesis_id, faculty = %faculty, kind = %cancelled.kind, "invitation cancelled");
    Ok(cancelled)
}

// Defenses

fn opens_defense_board(ledger: &InvitationLedger, answered: &Invitation) -> bool {
    answered.accepted
        && ledger.accepted_count(answered.phase, InvitationKind::Committee) == COMMITTEE_SEATS
}

/// Board seats as (faculty, is_advisor); the advisor is left out until one is on record.
fn defense_seats(ledger: &InvitationLedger, phase: Phase) -> Vec<(&FacultyCode, bool)> {
    let mut seats: Vec<(&FacultyCode, bool)> = ledger
        .committee_members(phase)
        .into_iter()
        .map(|member| (member, false))
        .collect();
    if let Some(advisor) = ledger.advisor() {
        seats.push((advisor, true));
    }
    seats
}

async fn ensure_defense_rows(
    conn: &mut PgConnection,
    ledger: &InvitationLedger,
    phase: Phase,
) -> Result<(), StoreError> {
    for (faculty, is_advisor) in defense_seats(ledger, phase) {
        sqlx::query(
            r#"
            INSERT INTO thesis_progress.defenses (id, thesis_id, phase, faculty_code, is_advisor)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (thesis_id, phase, faculty_code) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(ledger.thesis_id())
        .bind(phase.number())
        .bind(faculty.as_str())
        .bind(is_advisor)
        .execute(&mut *conn)
        .await?;
    }
    debug!(thesis = %ledger.thesis_id(), phase = phase.number(), "defense rows ensured");
    Ok(())
}

pub async fn fetch_defenses<'e, E>(executor: E, thesis_id: ThesisId) -> Result<Vec<Defense>, StoreError>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query(&format!(
        "{SELECT_DEFENSE} WHERE thesis_id = $1 ORDER BY phase, is_advisor DESC, faculty_code"
    ))
    .bind(thesis_id)
    .fetch_all(executor)
    .await?;
    rows.iter().map(defense_from_row).collect()
}

/// Sets the same date on every defense row of the phase. Idempotent.
pub async fn schedule_defense(
    pool: &PgPool,
    thesis_id: ThesisId,
    phase: Phase,
    at: NaiveDateTime,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE thesis_progress.defenses SET scheduled_at = $3 WHERE thesis_id = $1 AND phase = $2",
    )
    .bind(thesis_id)
    .bind(phase.number())
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Grades one committee row. Advisor rows are never graded.
pub async fn record_score(
    pool: &PgPool,
    thesis_id: ThesisId,
    phase: Phase,
    faculty: &FacultyCode,
    score: f64,
) -> Result<Defense, StoreError> {
    let row = sqlx::query(
        "UPDATE thesis_progress.defenses SET score = $4 \
         WHERE thesis_id = $1 AND phase = $2 AND faculty_code = $3 AND NOT is_advisor \
         RETURNING id, thesis_id, phase, faculty_code, is_advisor, scheduled_at, score",
    )
    .bind(thesis_id)
    .bind(phase.number())
    .bind(faculty.as_str())
    .bind(score)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound {
        entity: "committee defense row",
        id: faculty.to_string(),
    })?;
    defense_from_row(&row)
}

// Availability

pub async fn fetch_offering_grid<'e, E>(
    executor: E,
    offering: &OfferingKey,
) -> Result<OfferingGrid, StoreError>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query(
        "SELECT slot_date, slot_time FROM thesis_progress.offering_slots \
         WHERE year = $1 AND term = $2 AND course_code = $3 AND phase = $4",
    )
    .bind(offering.year)
    .bind(offering.term.number())
    .bind(&offering.course_code)
    .bind(offering.phase.number())
    .fetch_all(executor)
    .await?;

    let mut cells = Vec::with_capacity(rows.len());
    for row in rows {
        let date: NaiveDate = row.try_get("slot_date")?;
        let time: NaiveTime = row.try_get("slot_time")?;
        cells.push((date, time));
    }
    Ok(OfferingGrid::from_cells(offering.clone(), cells))
}

pub async fn replace_offering_grid(pool: &PgPool, grid: &OfferingGrid) -> Result<usize, StoreError> {
    let offering = &grid.offering;
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM thesis_progress.offering_slots \
         WHERE year = $1 AND term = $2 AND course_code = $3 AND phase = $4",
    )
    .bind(offering.year)
    .bind(offering.term.number())
    .bind(&offering.course_code)
    .bind(offering.phase.number())
    .execute(&mut *tx)
    .await?;

    let mut inserted = 0usize;
    for (date, time) in grid.cells() {
        sqlx::query(
            r#"
            INSERT INTO thesis_progress.offering_slots
            (year, term, course_code, phase, slot_date, slot_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(offering.year)
        .bind(offering.term.number())
        .bind(&offering.course_code)
        .bind(offering.phase.number())
        .bind(date)
        .bind(time)
        .execute(&mut *tx)
        .await?;
        inserted += 1;
    }

    tx.commit().await?;
    Ok(inserted)
}

pub async fn fetch_faculty_grid<'e, E>(
    executor: E,
    faculty: &FacultyCode,
    offering: &OfferingKey,
) -> Result<FacultyGrid, StoreError>
where
    E: PgExecutor<'e>,
{
    let rows = sqlx::query(
        "SELECT slot_date, slot_time, available FROM thesis_progress.availability_slots \
         WHERE faculty_code = $1 AND year = $2 AND term = $3 AND course_code = $4 AND phase = $5",
    )
    .bind(faculty.as_str())
    .bind(offering.year)
    .bind(offering.term.number())
    .bind(&offering.course_code)
    .bind(offering.phase.number())
    .fetch_all(executor)
    .await?;

    let mut slots = Vec::with_capacity(rows.len());
    for row in rows {
        slots.push(AvailabilitySlot {
            faculty: faculty.clone(),
            offering: offering.clone(),
            date: row.try_get("slot_date")?,
            time: row.try_get("slot_time")?,
            available: row.try_get("available")?,
        });
    }
    Ok(FacultyGrid::from_slots(faculty.clone(), offering.clone(), &slots))
}

/// Replaces one faculty member's grid for one offering; never merges.
pub async fn replace_faculty_grid(
    pool: &PgPool,
    faculty: &FacultyCode,
    offering: &OfferingKey,
    slots: &[AvailabilitySlot],
) -> Result<usize, StoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM thesis_progress.availability_slots \
         WHERE faculty_code = $1 AND year = $2 AND term = $3 AND course_code = $4 AND phase = $5",
    )
    .bind(faculty.as_str())
    .bind(offering.year)
    .bind(offering.term.number())
    .bind(&offering.course_code)
    .bind(offering.phase.number())
    .execute(&mut *tx)
    .await?;

    let mut written = 0usize;
    for slot in slots
        .iter()
        .filter(|slot| &slot.faculty == faculty && &slot.offering == offering)
    {
        sqlx::query(
            r#"
            INSERT INTO thesis_progress.availability_slots
            (faculty_code, year, term, course_code, phase, slot_date, slot_time, available)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (faculty_code, year, term, course_code, phase, slot_date, slot_time)
            DO UPDATE SET available = EXCLUDED.available
            "#,
        )
        .bind(faculty.as_str())
        .bind(offering.year)
        .bind(offering.term.number())
        .bind(&offering.course_code)
        .bind(offering.phase.number())
        .bind(slot.date)
        .bind(slot.time)
        .bind(slot.available)
        .execute(&mut *tx)
        .await?;
        written += 1;
    }

    tx.commit().await?;
    info!(faculty = %faculty, offering = %offering, written, "availability grid replaced");
    Ok(written)
}

fn parse_slot_time(value: &str) -> anyhow::Result<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .with_context(|| format!("invalid slot time {value:?}"))
}

/// Reads `faculty_code,year,term,course,phase,date,time,available` rows.
pub fn read_availability_csv(csv_path: &Path) -> anyhow::Result<Vec<AvailabilitySlot>> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        faculty_code: String,
        year: i32,
        term: i16,
        course: String,
        phase: i16,
        date: NaiveDate,
        time: String,
        available: bool,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut slots = Vec::new();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("bad availability row {}", line + 1))?;
        let term = Term::from_number(row.term)
            .with_context(|| format!("row {}: term must be 1 or 2", line + 1))?;
        let phase = Phase::from_number(row.phase)
            .with_context(|| format!("row {}: phase must be 1 or 2", line + 1))?;
        slots.push(AvailabilitySlot {
            faculty: FacultyCode::new(row.faculty_code),
            offering: OfferingKey {
                year: row.year,
                term,
                course_code: row.course.trim().to_string(),
                phase,
            },
            date: row.date,
            time: parse_slot_time(&row.time)?,
            available: row.available,
        });
    }

    Ok(slots)
}

/// Each (faculty, offering) present in the file has its grid replaced wholesale.
pub async fn import_availability_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    let slots = read_availability_csv(csv_path)?;
    let grids = group_by_grid(slots);
    for ((faculty, offering), slots) in &grids {
        replace_faculty_grid(pool, faculty, offering, slots)
            .await
            .with_context(|| format!("failed to replace grid of {faculty} for {offering}"))?;
    }
    Ok(grids.len())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<ThesisId> {
    let offering = OfferingKey {
        year: 2025,
        term: Term::First,
        course_code: "CS-TCC".to_string(),
        phase: Phase::Project,
    };
    let date = |day: u32| NaiveDate::from_ymd_opt(2025, 6, day).context("invalid date");
    let time = |hour: u32| NaiveTime::from_hms_opt(hour, 0, 0).context("invalid time");

    let grid = OfferingGrid::new(
        offering.clone(),
        [date(10)?, date(11)?],
        [time(9)?, time(14)?, time(15)?],
    );
    replace_offering_grid(pool, &grid).await?;

    let calendars = [
        ("ADV-ROCHA", vec![(date(10)?, time(14)?), (date(10)?, time(15)?)]),
        ("FAC-LIMA", vec![(date(10)?, time(14)?), (date(11)?, time(9)?)]),
        ("FAC-SOUZA", vec![(date(10)?, time(14)?)]),
        ("FAC-MELO", vec![(date(11)?, time(9)?)]),
    ];
    for (code, open) in calendars {
        let faculty = FacultyCode::from(code);
        let slots = FacultyGrid::synchronize(&faculty, &grid, open);
        replace_faculty_grid(pool, &faculty, &offering, &slots).await?;
    }

    let thesis_id = Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?;
    sqlx::query(
        r#"
        INSERT INTO thesis_progress.theses
        (id, student_code, course_code, year, term, phase, stage, theme)
        VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(thesis_id)
    .bind("2021001")
    .bind(&offering.course_code)
    .bind(offering.year)
    .bind(offering.term.number())
    .bind(offering.phase.number())
    .bind("Consensus protocols under network partitions")
    .execute(pool)
    .await?;

    Ok(thesis_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn invitation_draft(faculty: &str, kind: InvitationKind) -> InvitationDraft {
        InvitationDraft {
            faculty: FacultyCode::from(faculty),
            phase: Phase::Project,
            kind,
            message: String::new(),
        }
    }

    #[test]
    fn advisor_accepting_after_full_committee_gets_a_defense_seat() {
        let mut ledger = InvitationLedger::new(Uuid::new_v4());
        let now = Utc::now();
        for member in ["F01", "F02"] {
            ledger
                .create_invitation(invitation_draft(member, InvitationKind::Committee), now)
                .unwrap();
            ledger
                .respond_invitation(&FacultyCode::from(member), Phase::Project, true, now)
                .unwrap();
        }
        assert_eq!(defense_seats(&ledger, Phase::Project).len(), 2);

        ledger
            .create_invitation(invitation_draft("ADV", InvitationKind::Advising), now)
            .unwrap();
        let answered = ledger
            .respond_invitation(&FacultyCode::from("ADV"), Phase::Project, true, now)
            .unwrap()
            .clone();

        assert!(opens_defense_board(&ledger, &answered));
        let seats = defense_seats(&ledger, Phase::Project);
        assert_eq!(seats.len(), 3);
        assert!(seats.contains(&(&FacultyCode::from("ADV"), true)));
    }

    #[test]
    fn refusals_and_half_committees_leave_the_board_closed() {
        let mut ledger = InvitationLedger::new(Uuid::new_v4());
        let now = Utc::now();
        ledger
            .create_invitation(invitation_draft("F01", InvitationKind::Committee), now)
            .unwrap();
        let first = ledger
            .respond_invitation(&FacultyCode::from("F01"), Phase::Project, true, now)
            .unwrap()
            .clone();
        assert!(!opens_defense_board(&ledger, &first));

        ledger
            .create_invitation(invitation_draft("F02", InvitationKind::Committee), now)
            .unwrap();
        let refused = ledger
            .respond_invitation(&FacultyCode::from("F02"), Phase::Project, false, now)
            .unwrap()
            .clone();
        assert!(!opens_defense_board(&ledger, &refused));
    }

    #[test]
    fn reads_availability_rows_from_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "faculty_code,year,term,course,phase,date,time,available").unwrap();
        writeln!(file, "ADV,2025,1,CS-TCC,1,2025-06-10,14:00,true").unwrap();
        writeln!(file, "ADV,2025,1,CS-TCC,1,2025-06-10,15:00:00,false").unwrap();
        writeln!(file, "F01,2025,2,CS-TCC,2,2025-11-03,09:30,true").unwrap();
        file.flush().unwrap();

        let slots = read_availability_csv(file.path()).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].time, NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        assert!(!slots[1].available);
        assert_eq!(slots[2].offering.phase, Phase::Final);
        assert_eq!(slots[2].offering.term, Term::Second);

        let grids = group_by_grid(slots);
        assert_eq!(grids.len(), 2);
    }

    #[test]
    fn rejects_unknown_phase() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "faculty_code,year,term,course,phase,date,time,available").unwrap();
        writeln!(file, "ADV,2025,1,CS-TCC,3,2025-06-10,14:00,true").unwrap();
        file.flush().unwrap();

        assert!(read_availability_csv(file.path()).is_err());
    }
}
