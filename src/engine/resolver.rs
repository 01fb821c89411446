use std::collections::BTreeMap;
use std::time::Instant;

use chrono::NaiveDate;
use futures::future::join_all;
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::slots::enumerate;
use super::{BookingEngine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmployeeChoice {
    Any,
    Specific(Ulid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub org_id: Ulid,
    pub location_id: Option<Ulid>,
    pub service_id: Ulid,
    pub employee: EmployeeChoice,
    pub date: NaiveDate,
}

/// One bookable start. `employee_id` is a suggestion, not a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotBucket {
    pub start: Ms,
    pub end: Ms,
    pub employee_id: Ulid,
    pub free_employee_count: u32,
}

#[derive(Debug)]
pub struct SlotReport {
    pub service: Service,
    /// Qualified, eligible employees by name then id.
    pub roster: Vec<Employee>,
    pub slots: Vec<SlotBucket>,
    /// Employees skipped because their constraints could not be read.
    pub errors: Vec<(Ulid, EngineError)>,
}

/// Merge per-employee slot lists keyed by exact start. Input order decides the
/// representative: the first employee free at a start keeps the bucket.
pub fn union_slots(per_employee: &[(Ulid, Vec<Span>)]) -> Vec<SlotBucket> {
    let mut buckets: BTreeMap<Ms, SlotBucket> = BTreeMap::new();
    for (employee_id, slots) in per_employee {
        let mut seen = None;
        for slot in slots {
            // Overlapping availability rows can emit the same start twice.
            if seen == Some(slot.start) {
                continue;
            }
            seen = Some(slot.start);
            buckets
                .entry(slot.start)
                .and_modify(|b| {
                    if b.employee_id != *employee_id {
                        b.free_employee_count += 1;
                    }
                })
                .or_insert(SlotBucket {
                    start: slot.start,
                    end: slot.end,
                    employee_id: *employee_id,
                    free_employee_count: 1,
                });
        }
    }
    buckets.into_values().collect()
}

impl BookingEngine {
    async fn employee_slots(
        &self,
        org_id: Ulid,
        location_id: Option<Ulid>,
        employee: &Employee,
        date: NaiveDate,
        duration: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        let day = self.day_constraints(org_id, location_id, employee, date, duration).await?;
        let mut slots = enumerate(&day.spans, &day.busy, duration, self.settings.step_ms());
        slots.sort_by_key(|s| s.start);
        Ok(slots)
    }

    pub async fn find_slots(&self, query: &SlotQuery) -> Result<SlotReport, EngineError> {
        let started = Instant::now();
        let service = self.active_service(query.org_id, query.service_id).await?;
        if let Some(location_id) = query.location_id {
            self.store
                .location(query.org_id, location_id)
                .await?
                .ok_or(EngineError::not_found("location", location_id))?;
        }
        let roster = self.roster(query.org_id, service.id, query.location_id).await?;

        let candidates: Vec<&Employee> = match query.employee {
            EmployeeChoice::Any => roster.iter().collect(),
            EmployeeChoice::Specific(id) => {
                let employee = roster
                    .iter()
                    .find(|e| e.id == id)
                    .ok_or(EngineError::not_found("employee", id))?;
                vec![employee]
            }
        };

        let duration = service.duration_ms();
        let results = join_all(candidates.iter().map(|employee| async move {
            let slots = self
                .employee_slots(query.org_id, query.location_id, employee, query.date, duration)
                .await;
            (employee.id, slots)
        }))
        .await;

        let mut per_employee = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for (employee_id, result) in results {
            match result {
                Ok(slots) => per_employee.push((employee_id, slots)),
                Err(e) => {
                    warn!(%employee_id, error = %e, "slot query: skipping employee");
                    metrics::counter!(observability::SLOT_QUERY_DEGRADED_TOTAL).increment(1);
                    errors.push((employee_id, e));
                }
            }
        }

        let slots = union_slots(&per_employee);
        metrics::histogram!(observability::SLOTS_RETURNED).record(slots.len() as f64);
        metrics::histogram!(observability::SLOT_QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(SlotReport { service, roster, slots, errors })
    }
}
