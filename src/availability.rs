use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::models::{AvailabilitySlot, FacultyCode, OfferingKey};

/// The bookable (date × time) universe configured for one offering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferingGrid {
    pub offering: OfferingKey,
    dates: BTreeSet<NaiveDate>,
    times: BTreeSet<NaiveTime>,
}

impl OfferingGrid {
    pub fn new(
        offering: OfferingKey,
        dates: impl IntoIterator<Item = NaiveDate>,
        times: impl IntoIterator<Item = NaiveTime>,
    ) -> Self {
        Self {
            offering,
            dates: dates.into_iter().collect(),
            times: times.into_iter().collect(),
        }
    }

    /// Rebuilds the universe from stored (date, time) cells.
    pub fn from_cells(
        offering: OfferingKey,
        cells: impl IntoIterator<Item = (NaiveDate, NaiveTime)>,
    ) -> Self {
        let (dates, times): (BTreeSet<_>, BTreeSet<_>) = cells.into_iter().unzip();
        Self {
            offering,
            dates,
            times,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty() || self.times.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dates.len() * self.times.len()
    }

    pub fn contains(&self, date: NaiveDate, time: NaiveTime) -> bool {
        self.dates.contains(&date) && self.times.contains(&time)
    }

    pub fn cells(&self) -> impl Iterator<Item = (NaiveDate, NaiveTime)> + '_ {
        self.dates
            .iter()
            .flat_map(move |date| self.times.iter().map(move |time| (*date, *time)))
    }
}

/// One faculty member's open slots for one offering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacultyGrid {
    pub faculty: FacultyCode,
    pub offering: OfferingKey,
    open: HashSet<(NaiveDate, NaiveTime)>,
}

impl FacultyGrid {
    /// Keeps the available rows that belong to this faculty member and offering.
    pub fn from_slots(
        faculty: FacultyCode,
        offering: OfferingKey,
        slots: &[AvailabilitySlot],
    ) -> Self {
        let open = slots
            .iter()
            .filter(|slot| {
                slot.available && slot.faculty == faculty && slot.offering == offering
            })
            .map(|slot| (slot.date, slot.time))
            .collect();
        Self {
            faculty,
            offering,
            open,
        }
    }

    pub fn is_open(&self, date: NaiveDate, time: NaiveTime) -> bool {
        self.open.contains(&(date, time))
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Expands a synchronisation request into the full grid that replaces the stored one.
    ///
    /// Every cell of the offering gets a row; cells outside the offering are dropped.
    pub fn synchronize(
        faculty: &FacultyCode,
        grid: &OfferingGrid,
        open: impl IntoIterator<Item = (NaiveDate, NaiveTime)>,
    ) -> Vec<AvailabilitySlot> {
        let open: HashSet<(NaiveDate, NaiveTime)> = open.into_iter().collect();
        grid.cells()
            .map(|(date, time)| AvailabilitySlot {
                faculty: faculty.clone(),
                offering: grid.offering.clone(),
                date,
                time,
                available: open.contains(&(date, time)),
            })
            .collect()
    }
}

/// Slots shared by every grid, grouped by date with both levels sorted ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CommonSlots {
    by_date: BTreeMap<NaiveDate, Vec<NaiveTime>>,
}

impl CommonSlots {
    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_date.values().map(Vec::len).sum()
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.by_date
            .get(&at.date())
            .is_some_and(|times| times.binary_search(&at.time()).is_ok())
    }

    pub fn by_date(&self) -> &BTreeMap<NaiveDate, Vec<NaiveTime>> {
        &self.by_date
    }
}

impl FromIterator<(NaiveDate, NaiveTime)> for CommonSlots {
    fn from_iter<I: IntoIterator<Item = (NaiveDate, NaiveTime)>>(iter: I) -> Self {
        let mut by_date: BTreeMap<NaiveDate, Vec<NaiveTime>> = BTreeMap::new();
        for (date, time) in iter {
            by_date.entry(date).or_default().push(time);
        }
        for times in by_date.values_mut() {
            times.sort();
            times.dedup();
        }
        Self { by_date }
    }
}

/// Finds the slots open for the advisor and both committee members.
///
/// A grid registered for a different offering counts as entirely closed, as does
/// any cell outside the offering's own universe. Runs in time linear in the
/// number of open cells.
pub fn intersect_availability(grid: &OfferingGrid, faculty: [&FacultyGrid; 3]) -> CommonSlots {
    if faculty.iter().any(|candidate| candidate.offering != grid.offering) {
        return CommonSlots::default();
    }
    let mut grids = faculty;
    grids.sort_by_key(|candidate| candidate.open_count());
    let [smallest, rest @ ..] = grids;

    smallest
        .open
        .iter()
        .filter(|(date, time)| grid.contains(*date, *time))
        .filter(|(date, time)| rest.iter().all(|other| other.is_open(*date, *time)))
        .copied()
        .collect()
}

/// Groups imported rows into one full-replace batch per (faculty, offering).
pub fn group_by_grid(
    slots: Vec<AvailabilitySlot>,
) -> BTreeMap<(FacultyCode, OfferingKey), Vec<AvailabilitySlot>> {
    let mut grouped: BTreeMap<(FacultyCode, OfferingKey), Vec<AvailabilitySlot>> = BTreeMap::new();
    for slot in slots {
        grouped
            .entry((slot.faculty.clone(), slot.offering.clone()))
            .or_default()
            .push(slot);
    }
    grouped
}
