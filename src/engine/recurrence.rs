use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use tracing::{debug, info};
use ulid::Ulid;

use super::clock::Clock;
use super::error::EngineError;
use crate::limits::*;
use crate::model::*;
use crate::store::Store;

/// Inclusive range of calendar dates in the facility's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, EngineError> {
        if start > end {
            return Err(EngineError::InvalidInput("date window ends before it starts"));
        }
        let window = Self { start, end };
        if window.days() > MAX_RECURRENCE_DAYS {
            return Err(EngineError::LimitExceeded("date window too wide"));
        }
        Ok(window)
    }

    /// `today` through the last day of its month.
    pub fn rest_of_month(today: NaiveDate) -> Self {
        let (year, month) = if today.month() == 12 {
            (today.year() + 1, 1)
        } else {
            (today.year(), today.month() + 1)
        };
        let end = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|first| first.pred_opt())
            .unwrap_or(today);
        Self { start: today, end }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRequest {
    /// 0 = Sunday .. 6 = Saturday
    pub weekday: u8,
    pub time: NaiveTime,
    pub window: DateWindow,
    pub instructors: Vec<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub date: NaiveDate,
    pub start: Ms,
}

/// Why an instructor cannot take a week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// No session at that instant, or only a cancelled one.
    NoSession,
    Full,
    Closed,
}

impl Conflict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conflict::NoSession => "no_session",
            Conflict::Full => "full",
            Conflict::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: Ms,
    pub session_id: Option<Ulid>,
    pub available_capacity: u32,
    pub conflict: Option<Conflict>,
}

impl Slot {
    pub fn is_available(&self) -> bool {
        self.conflict.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructorAvailability {
    pub instructor_id: Ulid,
    /// True only when every occurrence has an open slot.
    pub available_for_all: bool,
    pub conflict_dates: Vec<NaiveDate>,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub occurrences: Vec<Occurrence>,
    pub instructors: Vec<InstructorAvailability>,
}

impl Resolution {
    pub fn instructor(&self, instructor_id: Ulid) -> Option<&InstructorAvailability> {
        self.instructors
            .iter()
            .find(|i| i.instructor_id == instructor_id)
    }
}

/// What to do with weeks the chosen instructor cannot take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictPolicy {
    SkipConflicted,
    /// Try these instructors, in order, for each conflicted week.
    FindAlternative { candidates: Vec<Ulid> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alternative {
    pub date: NaiveDate,
    pub instructor_id: Ulid,
    pub session_id: Ulid,
}

/// Sessions to put in one hold, plus every week that did not make it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPlan {
    pub instructor_id: Ulid,
    /// Primary and alternative sessions, in date order.
    pub session_ids: Vec<Ulid>,
    pub skipped_dates: Vec<NaiveDate>,
    pub alternatives: Vec<Alternative>,
    pub unresolved_dates: Vec<NaiveDate>,
}

/// Expands "every Tuesday at 16:00 this month" into dated occurrences and
/// looks up each instructor's session for every one of them. Read-only: it
/// never reserves anything, and the hold taken afterwards re-checks capacity.
#[derive(Clone)]
pub struct RecurrenceResolver {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    tz: Tz,
}

impl RecurrenceResolver {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, tz: Tz) -> Self {
        Self { store, clock, tz }
    }

    pub fn today(&self) -> NaiveDate {
        local_date(self.clock.now_ms(), self.tz)
    }

    pub async fn resolve(&self, request: &RecurrenceRequest) -> Result<Resolution, EngineError> {
        let instructors = dedup_instructors(&request.instructors)?;
        let occurrences = self.occurrences(request.weekday, request.time, request.window)?;
        let availability = self.check(&occurrences, &instructors).await?;
        debug!(
            weekday = request.weekday,
            occurrences = occurrences.len(),
            instructors = instructors.len(),
            "recurrence resolved"
        );
        Ok(Resolution {
            occurrences,
            instructors: availability,
        })
    }

    /// Every date in the window on `weekday`, at `time` local, that is still
    /// in the future.
    pub fn occurrences(
        &self,
        weekday: u8,
        time: NaiveTime,
        window: DateWindow,
    ) -> Result<Vec<Occurrence>, EngineError> {
        if weekday > 6 {
            return Err(EngineError::InvalidInput("weekday must be 0 (Sunday) to 6 (Saturday)"));
        }
        if window.days() > MAX_RECURRENCE_DAYS {
            return Err(EngineError::LimitExceeded("date window too wide"));
        }
        let now = self.clock.now_ms();
        let mut out = Vec::new();
        let mut date = window.start;
        while date <= window.end {
            if date.weekday().num_days_from_sunday() == u32::from(weekday) {
                match local_instant(date, time, self.tz) {
                    Some(start) if start > now => out.push(Occurrence { date, start }),
                    Some(_) => {}
                    None => debug!(%date, %time, "local time does not exist; occurrence skipped"),
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        Ok(out)
    }

    /// Build the plan for `instructor_id` under the caller's conflict policy.
    pub async fn plan(
        &self,
        resolution: &Resolution,
        instructor_id: Ulid,
        policy: &ConflictPolicy,
    ) -> Result<BookingPlan, EngineError> {
        let primary = resolution
            .instructor(instructor_id)
            .ok_or(EngineError::InvalidInput("instructor is not part of the resolution"))?;

        let mut picked: Vec<(NaiveDate, Ulid)> = primary
            .slots
            .iter()
            .filter(|s| s.is_available())
            .filter_map(|s| s.session_id.map(|id| (s.date, id)))
            .collect();
        let conflicts = primary.conflict_dates.clone();

        let mut plan = BookingPlan {
            instructor_id,
            session_ids: Vec::new(),
            skipped_dates: Vec::new(),
            alternatives: Vec::new(),
            unresolved_dates: Vec::new(),
        };

        match policy {
            ConflictPolicy::SkipConflicted => {
                if !conflicts.is_empty() {
                    info!(%instructor_id, skipped = ?conflicts, "conflicted weeks skipped by caller");
                }
                plan.skipped_dates = conflicts;
            }
            ConflictPolicy::FindAlternative { candidates } => {
                let candidates: Vec<Ulid> = dedup_instructors(candidates)?
                    .into_iter()
                    .filter(|c| *c != instructor_id)
                    .collect();
                let retry: Vec<Occurrence> = resolution
                    .occurrences
                    .iter()
                    .filter(|o| conflicts.contains(&o.date))
                    .copied()
                    .collect();
                let found = if retry.is_empty() || candidates.is_empty() {
                    Vec::new()
                } else {
                    self.check(&retry, &candidates).await?
                };

                for date in conflicts {
                    let hit = found.iter().find_map(|c| {
                        c.slots
                            .iter()
                            .find(|s| s.date == date && s.is_available())
                            .and_then(|s| s.session_id)
                            .map(|session_id| Alternative {
                                date,
                                instructor_id: c.instructor_id,
                                session_id,
                            })
                    });
                    match hit {
                        Some(alt) => {
                            info!(%date, from = %instructor_id, to = %alt.instructor_id, "conflicted week reassigned");
                            picked.push((date, alt.session_id));
                            plan.alternatives.push(alt);
                        }
                        None => {
                            info!(%date, %instructor_id, "no alternative instructor for week");
                            plan.unresolved_dates.push(date);
                        }
                    }
                }
            }
        }

        picked.sort_by_key(|(date, _)| *date);
        plan.session_ids = picked.into_iter().map(|(_, id)| id).collect();
        Ok(plan)
    }

    async fn check(
        &self,
        occurrences: &[Occurrence],
        instructors: &[Ulid],
    ) -> Result<Vec<InstructorAvailability>, EngineError> {
        let now = self.clock.now_ms();
        let mut out = Vec::with_capacity(instructors.len());
        for &instructor_id in instructors {
            let sessions = match (occurrences.first(), occurrences.last()) {
                (Some(first), Some(last)) => {
                    self.store
                        .sessions_for_instructor(instructor_id, Span::new(first.start, last.start + 1))
                        .await?
                }
                _ => Vec::new(),
            };

            let slots: Vec<Slot> = occurrences
                .iter()
                .map(|occ| slot_for(occ, &sessions, now))
                .collect();
            let conflict_dates: Vec<NaiveDate> = slots
                .iter()
                .filter(|s| !s.is_available())
                .map(|s| s.date)
                .collect();
            out.push(InstructorAvailability {
                instructor_id,
                available_for_all: !slots.is_empty() && conflict_dates.is_empty(),
                conflict_dates,
                slots,
            });
        }
        Ok(out)
    }
}

fn slot_for(occ: &Occurrence, sessions: &[SessionState], now: Ms) -> Slot {
    let at_instant: Vec<&SessionState> = sessions
        .iter()
        .filter(|s| s.session.span.start == occ.start)
        .collect();
    let open_best = at_instant
        .iter()
        .filter(|s| s.session.status.is_open())
        .max_by_key(|s| s.available(now));

    let (session_id, available_capacity, conflict) = match open_best {
        Some(s) if s.available(now) > 0 => (Some(s.session.id), s.available(now), None),
        Some(s) => (Some(s.session.id), 0, Some(Conflict::Full)),
        None => match at_instant
            .iter()
            .find(|s| s.session.status == SessionStatus::Completed)
        {
            Some(s) => (Some(s.session.id), 0, Some(Conflict::Closed)),
            None => (None, 0, Some(Conflict::NoSession)),
        },
    };
    Slot {
        date: occ.date,
        start: occ.start,
        session_id,
        available_capacity,
        conflict,
    }
}

fn dedup_instructors(ids: &[Ulid]) -> Result<Vec<Ulid>, EngineError> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    if out.len() > MAX_INSTRUCTOR_CANDIDATES {
        return Err(EngineError::LimitExceeded("too many instructors"));
    }
    Ok(out)
}

/// Instant of `date` at `time` in `tz`. `None` inside a DST gap.
pub fn local_instant(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<Ms> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

pub fn local_date(at: Ms, tz: Tz) -> NaiveDate {
    DateTime::from_timestamp_millis(at)
        .map(|utc| utc.with_timezone(&tz).date_naive())
        .unwrap_or_default()
}
