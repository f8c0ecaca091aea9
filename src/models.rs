use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ThesisId = Uuid;

/// Institutional code of a faculty member (advisor or committee member).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FacultyCode(String);

impl FacultyCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FacultyCode {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for FacultyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Project,
    Final,
}

impl Phase {
    pub fn from_number(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::Project),
            2 => Some(Self::Final),
            _ => None,
        }
    }

    pub fn number(self) -> i16 {
        match self {
            Self::Project => 1,
            Self::Final => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Term {
    First,
    Second,
}

impl Term {
    pub fn from_number(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::First),
            2 => Some(Self::Second),
            _ => None,
        }
    }

    pub fn number(self) -> i16 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }
}

/// Progress checkpoint of a thesis, 0 through 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Stage(pub(crate) u8);

impl Stage {
    pub const AWAITING_ADVISOR: Stage = Stage(0);
    pub const PROJECT_SCHEDULING: Stage = Stage(5);
    pub const PROJECT_GRADED: Stage = Stage(6);
    pub const FINAL_SCHEDULING: Stage = Stage(8);
    pub const FINAL_GRADED: Stage = Stage(9);
    pub const MAX: u8 = 9;

    pub fn new(value: u8) -> Option<Self> {
        (value <= Self::MAX).then_some(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Stage::new(value).ok_or_else(|| format!("stage {value} is outside 0..={}", Stage::MAX))
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> Self {
        stage.0
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Drafted text that a thesis must carry before it can be defended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentField {
    Theme,
    Title,
    Abstract,
    SeminarNotes,
}

impl ContentField {
    pub fn label(self) -> &'static str {
        match self {
            Self::Theme => "theme",
            Self::Title => "title",
            Self::Abstract => "abstract",
            Self::SeminarNotes => "seminar notes",
        }
    }
}

impl fmt::Display for ContentField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thesis {
    pub id: ThesisId,
    pub student_code: String,
    pub course_code: String,
    pub year: i32,
    pub term: Term,
    pub phase: Phase,
    pub stage: Stage,
    pub theme: Option<String>,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub seminar_notes: Option<String>,
    /// Compare-and-swap counter bumped on every stored update.
    pub version: i64,
}

impl Thesis {
    pub fn content(&self, field: ContentField) -> Option<&str> {
        let value = match field {
            ContentField::Theme => self.theme.as_deref(),
            ContentField::Title => self.title.as_deref(),
            ContentField::Abstract => self.abstract_text.as_deref(),
            ContentField::SeminarNotes => self.seminar_notes.as_deref(),
        };
        value.filter(|text| !text.trim().is_empty())
    }

    pub fn offering(&self) -> OfferingKey {
        OfferingKey {
            year: self.year,
            term: self.term,
            course_code: self.course_code.clone(),
            phase: self.phase,
        }
    }
}

/// A student entering the process for one course offering and phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewThesis {
    pub student_code: String,
    pub course_code: String,
    pub year: i32,
    pub term: Term,
    pub phase: Phase,
}

/// Read filter for theses; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThesisFilter {
    pub student_code: Option<String>,
    pub course_code: Option<String>,
    pub year: Option<i32>,
    pub term: Option<Term>,
    pub phase: Option<Phase>,
}

/// Partial update of the drafted fields; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentEdit {
    pub theme: Option<String>,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub seminar_notes: Option<String>,
}

impl ContentEdit {
    pub fn is_empty(&self) -> bool {
        self.theme.is_none()
            && self.title.is_none()
            && self.abstract_text.is_none()
            && self.seminar_notes.is_none()
    }

    pub fn apply(&self, thesis: &mut Thesis) {
        if let Some(theme) = &self.theme {
            thesis.theme = Some(theme.clone());
        }
        if let Some(title) = &self.title {
            thesis.title = Some(title.clone());
        }
        if let Some(text) = &self.abstract_text {
            thesis.abstract_text = Some(text.clone());
        }
        if let Some(notes) = &self.seminar_notes {
            thesis.seminar_notes = Some(notes.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationKind {
    Advising,
    Committee,
}

impl InvitationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Advising => "advising",
            Self::Committee => "committee",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "advising" => Some(Self::Advising),
            "committee" => Some(Self::Committee),
            _ => None,
        }
    }
}

impl fmt::Display for InvitationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: Uuid,
    pub thesis_id: ThesisId,
    pub faculty: FacultyCode,
    pub phase: Phase,
    pub kind: InvitationKind,
    pub message: String,
    pub sent_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    /// Only meaningful once `responded_at` is set.
    pub accepted: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Invitation {
    pub fn status(&self) -> InvitationStatus {
        if self.cancelled_at.is_some() {
            InvitationStatus::Cancelled
        } else if self.responded_at.is_none() {
            InvitationStatus::Pending
        } else if self.accepted {
            InvitationStatus::Accepted
        } else {
            InvitationStatus::Rejected
        }
    }

    /// Pending or accepted, and not cancelled.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status(),
            InvitationStatus::Pending | InvitationStatus::Accepted
        )
    }

    pub fn is_accepted(&self) -> bool {
        self.status() == InvitationStatus::Accepted
    }
}

/// Input for a new invitation, before the ledger assigns identity and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationDraft {
    pub faculty: FacultyCode,
    pub phase: Phase,
    pub kind: InvitationKind,
    pub message: String,
}

/// Course offering an availability grid belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OfferingKey {
    pub year: i32,
    pub term: Term,
    pub course_code: String,
    pub phase: Phase,
}

impl fmt::Display for OfferingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} phase {}",
            self.year,
            self.term.number(),
            self.course_code,
            self.phase.number()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub faculty: FacultyCode,
    pub offering: OfferingKey,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defense {
    pub id: Uuid,
    pub thesis_id: ThesisId,
    pub phase: Phase,
    pub faculty: FacultyCode,
    /// The advisor's row takes part in scheduling but is not graded numerically.
    pub is_advisor: bool,
    /// Institution-local wall time, matching the availability grid.
    pub scheduled_at: Option<NaiveDateTime>,
    pub score: Option<f64>,
}

/// Advisor of record for a thesis, driven by an accepted advising invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Orientorship {
    pub thesis_id: ThesisId,
    pub faculty: FacultyCode,
    pub assigned_at: DateTime<Utc>,
}

/// Everything the core needs to judge one thesis, read at one point in time.
#[derive(Debug, Clone)]
pub struct ThesisSnapshot {
    pub thesis: Thesis,
    pub invitations: Vec<Invitation>,
    pub defenses: Vec<Defense>,
    pub orientorship: Option<Orientorship>,
}
