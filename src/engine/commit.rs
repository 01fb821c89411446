use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{BookingEngine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Caller-chosen id; generated when absent.
    pub id: Option<Ulid>,
    pub org_id: Ulid,
    pub location_id: Option<Ulid>,
    pub service_id: Ulid,
    pub employee_id: Ulid,
    pub start: Ms,
    pub client: ClientIdentity,
}

fn clean_contact(value: Option<&str>, what: &str) -> Result<Option<String>, EngineError> {
    let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if v.len() > MAX_CONTACT_LEN {
        return Err(EngineError::validation(format!("{what} too long")));
    }
    Ok(Some(v.to_string()))
}

/// Trimmed, bounded identity with at least one contact. Emails compare lowercase.
pub(super) fn normalize_identity(identity: &ClientIdentity) -> Result<ClientIdentity, EngineError> {
    let name = identity.name.trim();
    if name.is_empty() {
        return Err(EngineError::validation("client name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::validation("client name too long"));
    }
    let phone = clean_contact(identity.phone.as_deref(), "phone")?;
    let email = clean_contact(identity.email.as_deref(), "email")?.map(|e| e.to_lowercase());
    if phone.is_none() && email.is_none() {
        return Err(EngineError::validation("phone or email is required"));
    }
    Ok(ClientIdentity { name: name.to_string(), phone, email })
}

impl BookingEngine {
    /// Turn a chosen slot into a `booked` appointment.
    ///
    /// Time off and blocks are checked here; the overlap with other
    /// appointments is decided by the store under the employee's calendar
    /// lock, so of two racing commits for one interval exactly one wins.
    pub async fn book(&self, request: BookingRequest) -> Result<Appointment, EngineError> {
        let identity = normalize_identity(&request.client)?;
        if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&request.start) {
            return Err(EngineError::validation("start timestamp out of range"));
        }

        let org_id = request.org_id;
        let service = self.active_service(org_id, request.service_id).await?;
        let employee = self
            .store
            .employee(org_id, request.employee_id)
            .await?
            .filter(|e| e.active)
            .ok_or(EngineError::not_found("employee", request.employee_id))?;
        if !self.store.is_qualified(org_id, employee.id, service.id).await?
            || !employee.serves_location(request.location_id)
        {
            return Err(EngineError::not_found("employee", employee.id));
        }
        if let Some(location_id) = request.location_id {
            self.store
                .location(org_id, location_id)
                .await?
                .ok_or(EngineError::not_found("location", location_id))?;
        }

        let client = self.store.resolve_client(org_id, &identity).await?;

        let span = Span::new(request.start, request.start + service.duration_ms());
        let location_id = request.location_id.or(employee.location_id);
        if let Some(off) = self
            .store
            .time_off_overlapping(org_id, employee.id, span)
            .await?
            .first()
        {
            return Err(self.conflict(employee.id, off.id));
        }
        if let Some(location_id) = location_id
            && let Some(block) = self
                .store
                .blocks_overlapping(org_id, location_id, employee.id, span)
                .await?
                .first()
        {
            return Err(self.conflict(employee.id, block.id));
        }

        let appointment = Appointment {
            id: request.id.unwrap_or_else(Ulid::new),
            org_id,
            location_id,
            employee_id: employee.id,
            client_id: client.id,
            service_id: service.id,
            span,
            status: AppointmentStatus::Booked,
        };
        self.store
            .insert_appointment(appointment.clone())
            .await
            .map_err(|e| match EngineError::from(e) {
                EngineError::Conflict { employee_id, with } => self.conflict(employee_id, with),
                other => other,
            })?;

        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        info!(
            appointment_id = %appointment.id,
            employee_id = %appointment.employee_id,
            start = appointment.span.start,
            "appointment booked"
        );
        Ok(appointment)
    }

    fn conflict(&self, employee_id: Ulid, with: Ulid) -> EngineError {
        metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
        warn!(%employee_id, %with, "booking conflict");
        EngineError::Conflict { employee_id, with }
    }

    pub async fn set_status(
        &self,
        org_id: Ulid,
        appointment_id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let updated = self
            .store
            .transition_appointment(org_id, appointment_id, status)
            .await?;
        info!(%appointment_id, status = %status, "appointment status changed");
        Ok(updated)
    }

    pub async fn confirm(&self, org_id: Ulid, appointment_id: Ulid) -> Result<Appointment, EngineError> {
        self.set_status(org_id, appointment_id, AppointmentStatus::Confirmed).await
    }

    /// Cancelled is terminal; the interval becomes bookable again.
    pub async fn cancel(&self, org_id: Ulid, appointment_id: Ulid) -> Result<Appointment, EngineError> {
        self.set_status(org_id, appointment_id, AppointmentStatus::Cancelled).await
    }
}
