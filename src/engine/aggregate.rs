use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::{self, ClockTime};
use crate::model::*;

use super::{BookingEngine, EngineError, HoursPolicy};

/// Everything that decides one employee's slots on one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayConstraints {
    pub employee_id: Ulid,
    /// Availability ∩ opening window, sorted by start, each at least one
    /// service long.
    pub spans: Vec<Span>,
    /// Appointments, time off and blocks overlapping the local day. Unmerged.
    pub busy: Vec<Span>,
}

impl DayConstraints {
    fn closed(employee_id: Ulid) -> Self {
        Self { employee_id, spans: Vec::new(), busy: Vec::new() }
    }
}

impl BookingEngine {
    /// UTC offset for a location, falling back to the deployment default.
    pub(super) fn offset_for(&self, location: Option<&Location>) -> i32 {
        location.map_or(self.settings.default_utc_offset_min, |l| l.utc_offset_min)
    }

    /// Opening window for (location, weekday) under the hours policy.
    async fn opening_window(
        &self,
        org_id: Ulid,
        location_id: Option<Ulid>,
        date: NaiveDate,
    ) -> Result<Option<(ClockTime, ClockTime)>, EngineError> {
        let weekday = calendar::weekday_of(date);
        let row = match location_id {
            Some(location_id) => self.store.business_hours(org_id, location_id, weekday).await?,
            None => None,
        };
        Ok(match (row, self.settings.hours) {
            (Some(hours), _) => Some((hours.open, hours.close)),
            (None, HoursPolicy::Strict) => None,
            (None, HoursPolicy::Fallback { open, close }) => Some((open, close)),
        })
    }

    pub async fn day_constraints(
        &self,
        org_id: Ulid,
        location_id: Option<Ulid>,
        employee: &Employee,
        date: NaiveDate,
        duration: Ms,
    ) -> Result<DayConstraints, EngineError> {
        let location_id = location_id.or(employee.location_id);
        let location = match location_id {
            Some(id) => self.store.location(org_id, id).await?,
            None => None,
        };
        let offset = self.offset_for(location.as_ref());

        let Some((open, close)) = self.opening_window(org_id, location_id, date).await? else {
            return Ok(DayConstraints::closed(employee.id));
        };
        let Some(window) = calendar::local_span(date, open, close, offset) else {
            return Ok(DayConstraints::closed(employee.id));
        };

        let rows = self
            .store
            .staff_availability(org_id, employee.id, calendar::weekday_of(date))
            .await?;
        let mut spans: Vec<Span> = rows
            .iter()
            .filter_map(|r| calendar::local_span(date, r.start, r.end, offset))
            .filter_map(|s| s.intersect(&window))
            .filter(|s| s.duration_ms() >= duration)
            .collect();
        spans.sort_by_key(|s| (s.start, s.end));
        if spans.is_empty() {
            return Ok(DayConstraints::closed(employee.id));
        }

        let day = calendar::day_window(date, offset);
        let mut busy: Vec<Span> = self
            .store
            .appointments_overlapping(org_id, employee.id, day)
            .await?
            .into_iter()
            .map(|a| a.span)
            .collect();
        busy.extend(
            self.store
                .time_off_overlapping(org_id, employee.id, day)
                .await?
                .into_iter()
                .map(|t| t.span),
        );
        if let Some(location_id) = location_id {
            busy.extend(
                self.store
                    .blocks_overlapping(org_id, location_id, employee.id, day)
                    .await?
                    .into_iter()
                    .map(|b| b.span),
            );
        }

        Ok(DayConstraints { employee_id: employee.id, spans, busy })
    }
}
