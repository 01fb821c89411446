//! Persistence boundary for one organization's booking data.
//!
//! Every read takes the organization id and returns nothing for records that
//! belong to another organization. The writes that matter for correctness
//! (`resolve_client`, `insert_appointment`, `transition_appointment`) are
//! atomic inside the store.

mod memory;

pub use memory::TenantStore;

use async_trait::async_trait;
use chrono::Weekday;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    /// The employee already has a non-cancelled appointment overlapping the new one.
    Overlap { employee_id: Ulid, with: Ulid },
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    NotFound {
        entity: &'static str,
        id: Ulid,
    },
    Duplicate {
        entity: &'static str,
        id: Ulid,
    },
    Limit(&'static str),
    /// Durable storage failed; nothing was written.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Overlap { employee_id, with } => {
                write!(f, "employee {employee_id} already booked by appointment {with}")
            }
            StoreError::InvalidTransition { from, to } => {
                write!(f, "cannot move appointment from {from} to {to}")
            }
            StoreError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            StoreError::Duplicate { entity, id } => write!(f, "{entity} already exists: {id}"),
            StoreError::Limit(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // ── Catalog ──────────────────────────────────────────────

    async fn location(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Location>>;
    async fn locations(&self, org_id: Ulid) -> StoreResult<Vec<Location>>;
    async fn service(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Service>>;
    async fn services(&self, org_id: Ulid) -> StoreResult<Vec<Service>>;
    async fn employee(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Employee>>;
    /// Active employees linked to `service_id`, in no particular order.
    async fn qualified_employees(&self, org_id: Ulid, service_id: Ulid) -> StoreResult<Vec<Employee>>;
    async fn is_qualified(&self, org_id: Ulid, employee_id: Ulid, service_id: Ulid) -> StoreResult<bool>;

    // ── Constraint sources ───────────────────────────────────

    async fn business_hours(
        &self,
        org_id: Ulid,
        location_id: Ulid,
        weekday: Weekday,
    ) -> StoreResult<Option<BusinessHours>>;
    async fn staff_availability(
        &self,
        org_id: Ulid,
        employee_id: Ulid,
        weekday: Weekday,
    ) -> StoreResult<Vec<StaffAvailability>>;
    /// Non-cancelled appointments of the employee overlapping `window`.
    async fn appointments_overlapping(
        &self,
        org_id: Ulid,
        employee_id: Ulid,
        window: Span,
    ) -> StoreResult<Vec<Appointment>>;
    async fn time_off_overlapping(
        &self,
        org_id: Ulid,
        employee_id: Ulid,
        window: Span,
    ) -> StoreResult<Vec<StaffTimeOff>>;
    /// Blocks at `location_id` that name `employee_id` or nobody.
    async fn blocks_overlapping(
        &self,
        org_id: Ulid,
        location_id: Ulid,
        employee_id: Ulid,
        window: Span,
    ) -> StoreResult<Vec<Block>>;

    // ── Clients & appointments ───────────────────────────────

    async fn appointment(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Appointment>>;
    async fn client(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Client>>;
    /// Phone match wins over email match.
    async fn client_by_contact(
        &self,
        org_id: Ulid,
        phone: Option<&str>,
        email: Option<&str>,
    ) -> StoreResult<Option<Client>>;
    /// All appointments of the client starting at or after `from`, by start.
    async fn client_appointments(&self, org_id: Ulid, client_id: Ulid, from: Ms) -> StoreResult<Vec<Appointment>>;

    /// Lookup by phone, then email, else create. Atomic per organization.
    async fn resolve_client(&self, org_id: Ulid, identity: &ClientIdentity) -> StoreResult<Client>;
    /// Insert under the employee's calendar lock, rejecting overlaps.
    async fn insert_appointment(&self, appointment: Appointment) -> StoreResult<()>;
    async fn transition_appointment(
        &self,
        org_id: Ulid,
        id: Ulid,
        next: AppointmentStatus,
    ) -> StoreResult<Appointment>;

    async fn apply_setup(&self, org_id: Ulid, change: SetupChange) -> StoreResult<()>;
}
