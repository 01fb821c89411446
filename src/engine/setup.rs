use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{BookingEngine, EngineError};

fn check_name(what: &str, name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::validation(format!("{what} name is required")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::validation(format!("{what} name too long")));
    }
    Ok(name.to_string())
}

fn check_busy_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BUSY_SPAN_MS {
        return Err(EngineError::LimitExceeded("interval too wide"));
    }
    Ok(())
}

/// Tenant configuration writes. Each record is stamped with `org_id`.
impl BookingEngine {
    /// Route a parsed setup change through its validating operation.
    pub async fn apply_setup(&self, org_id: Ulid, change: SetupChange) -> Result<(), EngineError> {
        match change {
            SetupChange::LocationSaved(location) => self.save_location(org_id, location).await.map(drop),
            SetupChange::ServiceSaved(service) => self.save_service(org_id, service).await.map(drop),
            SetupChange::EmployeeSaved(employee) => self.save_employee(org_id, employee).await.map(drop),
            SetupChange::ServiceLinked { employee_id, service_id } => {
                self.link_service(org_id, employee_id, service_id).await
            }
            SetupChange::ServiceUnlinked { employee_id, service_id } => {
                self.unlink_service(org_id, employee_id, service_id).await
            }
            SetupChange::BusinessHoursSaved(hours) => self.save_business_hours(org_id, hours).await,
            SetupChange::AvailabilityAdded(row) => self.add_availability(org_id, row).await,
            SetupChange::AvailabilityRemoved { id } => self.remove_availability(org_id, id).await,
            SetupChange::TimeOffAdded(off) => self.add_time_off(org_id, off).await,
            SetupChange::TimeOffRemoved { id } => self.remove_time_off(org_id, id).await,
            SetupChange::BlockAdded(block) => self.add_block(org_id, block).await,
            SetupChange::BlockRemoved { id } => self.remove_block(org_id, id).await,
        }
    }

    async fn apply(&self, org_id: Ulid, change: SetupChange) -> Result<(), EngineError> {
        let label = change.label();
        self.store.apply_setup(org_id, change).await?;
        tracing::debug!(%org_id, change = label, "setup applied");
        Ok(())
    }

    pub async fn save_location(&self, org_id: Ulid, mut location: Location) -> Result<Location, EngineError> {
        location.org_id = org_id;
        location.name = check_name("location", &location.name)?;
        if location.utc_offset_min.abs() > MAX_UTC_OFFSET_MIN {
            return Err(EngineError::validation(format!(
                "utc offset {} minutes out of range",
                location.utc_offset_min
            )));
        }
        self.apply(org_id, SetupChange::LocationSaved(location.clone())).await?;
        Ok(location)
    }

    pub async fn save_service(&self, org_id: Ulid, mut service: Service) -> Result<Service, EngineError> {
        service.org_id = org_id;
        service.name = check_name("service", &service.name)?;
        if service.duration_min == 0 {
            return Err(EngineError::validation("service duration must be positive"));
        }
        if service.duration_min > MAX_SERVICE_DURATION_MIN {
            return Err(EngineError::LimitExceeded("service duration too long"));
        }
        self.apply(org_id, SetupChange::ServiceSaved(service.clone())).await?;
        Ok(service)
    }

    pub async fn save_employee(&self, org_id: Ulid, mut employee: Employee) -> Result<Employee, EngineError> {
        employee.org_id = org_id;
        employee.name = check_name("employee", &employee.name)?;
        self.apply(org_id, SetupChange::EmployeeSaved(employee.clone())).await?;
        Ok(employee)
    }

    pub async fn link_service(&self, org_id: Ulid, employee_id: Ulid, service_id: Ulid) -> Result<(), EngineError> {
        self.apply(org_id, SetupChange::ServiceLinked { employee_id, service_id }).await
    }

    pub async fn unlink_service(&self, org_id: Ulid, employee_id: Ulid, service_id: Ulid) -> Result<(), EngineError> {
        self.apply(org_id, SetupChange::ServiceUnlinked { employee_id, service_id }).await
    }

    /// Replaces any existing row for the same (location, weekday).
    pub async fn save_business_hours(&self, org_id: Ulid, mut hours: BusinessHours) -> Result<(), EngineError> {
        hours.org_id = org_id;
        if hours.open >= hours.close {
            return Err(EngineError::validation(format!(
                "business hours {}-{} are empty",
                hours.open, hours.close
            )));
        }
        self.apply(org_id, SetupChange::BusinessHoursSaved(hours)).await
    }

    pub async fn add_availability(&self, org_id: Ulid, mut row: StaffAvailability) -> Result<(), EngineError> {
        row.org_id = org_id;
        if row.start >= row.end {
            return Err(EngineError::validation(format!(
                "availability {}-{} is empty",
                row.start, row.end
            )));
        }
        self.apply(org_id, SetupChange::AvailabilityAdded(row)).await
    }

    pub async fn remove_availability(&self, org_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        self.apply(org_id, SetupChange::AvailabilityRemoved { id }).await
    }

    pub async fn add_time_off(&self, org_id: Ulid, mut off: StaffTimeOff) -> Result<(), EngineError> {
        off.org_id = org_id;
        check_busy_span(&off.span)?;
        self.apply(org_id, SetupChange::TimeOffAdded(off)).await
    }

    pub async fn remove_time_off(&self, org_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        self.apply(org_id, SetupChange::TimeOffRemoved { id }).await
    }

    pub async fn add_block(&self, org_id: Ulid, mut block: Block) -> Result<(), EngineError> {
        block.org_id = org_id;
        check_busy_span(&block.span)?;
        self.apply(org_id, SetupChange::BlockAdded(block)).await
    }

    pub async fn remove_block(&self, org_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        self.apply(org_id, SetupChange::BlockRemoved { id }).await
    }
}
