use chrono::Weekday;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::calendar::ClockTime;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for spans coming from outside the process.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: &Span) -> Option<Span> {
        Span::try_new(self.start.max(other.start), self.end.min(other.end))
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Tenant records ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: Ulid,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub org_id: Ulid,
    pub name: String,
    /// Fixed offset of local clock time from UTC, in minutes.
    pub utc_offset_min: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub org_id: Ulid,
    pub name: String,
    pub duration_min: u32,
    pub active: bool,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_min) * crate::calendar::MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: Ulid,
    pub org_id: Ulid,
    /// `None` = works at every location.
    pub location_id: Option<Ulid>,
    pub name: String,
    pub active: bool,
}

impl Employee {
    /// Whether this employee can serve a booking at `location`.
    /// A query without a location accepts everyone.
    pub fn serves_location(&self, location: Option<Ulid>) -> bool {
        match (location, self.location_id) {
            (None, _) | (_, None) => true,
            (Some(wanted), Some(own)) => wanted == own,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffAvailability {
    pub id: Ulid,
    pub org_id: Ulid,
    pub employee_id: Ulid,
    pub weekday: Weekday,
    pub start: ClockTime,
    pub end: ClockTime,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub org_id: Ulid,
    pub location_id: Ulid,
    pub weekday: Weekday,
    pub open: ClockTime,
    pub close: ClockTime,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffTimeOff {
    pub id: Ulid,
    pub org_id: Ulid,
    pub employee_id: Ulid,
    pub span: Span,
}

/// Operational closure. `employee_id: None` closes the whole location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub org_id: Ulid,
    pub location_id: Ulid,
    pub employee_id: Option<Ulid>,
    pub span: Span,
}

impl Block {
    pub fn applies_to(&self, location: Option<Ulid>, employee_id: Ulid) -> bool {
        location == Some(self.location_id) && self.employee_id.is_none_or(|e| e == employee_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Booked,
    Confirmed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn is_busy(self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled)
    }

    /// `booked → confirmed`, `booked | confirmed → cancelled`. Nothing else.
    pub fn can_become(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!((self, next), (Booked, Confirmed) | (Booked, Cancelled) | (Confirmed, Cancelled))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "booked" => Some(AppointmentStatus::Booked),
            "confirmed" => Some(AppointmentStatus::Confirmed),
            "cancelled" | "canceled" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub org_id: Ulid,
    pub location_id: Option<Ulid>,
    pub employee_id: Ulid,
    pub client_id: Ulid,
    pub service_id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Ulid,
    pub org_id: Ulid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Client {
    /// Where a text for this client should go: phone first, then email.
    pub fn contact(&self) -> Option<&str> {
        self.phone.as_deref().or(self.email.as_deref())
    }
}

/// How a booking names its client. At least one of phone / email is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

// ── Setup writes ─────────────────────────────────────────────────

/// Tenant configuration changes made by staff/admin flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupChange {
    LocationSaved(Location),
    ServiceSaved(Service),
    EmployeeSaved(Employee),
    ServiceLinked { employee_id: Ulid, service_id: Ulid },
    ServiceUnlinked { employee_id: Ulid, service_id: Ulid },
    BusinessHoursSaved(BusinessHours),
    AvailabilityAdded(StaffAvailability),
    AvailabilityRemoved { id: Ulid },
    TimeOffAdded(StaffTimeOff),
    TimeOffRemoved { id: Ulid },
    BlockAdded(Block),
    BlockRemoved { id: Ulid },
}

impl SetupChange {
    pub fn label(&self) -> &'static str {
        match self {
            SetupChange::LocationSaved(_) => "location_saved",
            SetupChange::ServiceSaved(_) => "service_saved",
            SetupChange::EmployeeSaved(_) => "employee_saved",
            SetupChange::ServiceLinked { .. } => "service_linked",
            SetupChange::ServiceUnlinked { .. } => "service_unlinked",
            SetupChange::BusinessHoursSaved(_) => "business_hours_saved",
            SetupChange::AvailabilityAdded(_) => "availability_added",
            SetupChange::AvailabilityRemoved { .. } => "availability_removed",
            SetupChange::TimeOffAdded(_) => "time_off_added",
            SetupChange::TimeOffRemoved { .. } => "time_off_removed",
            SetupChange::BlockAdded(_) => "block_added",
            SetupChange::BlockRemoved { .. } => "block_removed",
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OrganizationCreated(Organization),
    Setup(SetupChange),
    ClientCreated(Client),
    AppointmentBooked(Appointment),
    AppointmentStatusChanged {
        id: Ulid,
        employee_id: Ulid,
        status: AppointmentStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_intersect() {
        let a = Span::new(100, 300);
        assert_eq!(a.intersect(&Span::new(200, 400)), Some(Span::new(200, 300)));
        assert_eq!(a.intersect(&Span::new(0, 1000)), Some(a));
        assert_eq!(a.intersect(&Span::new(300, 400)), None); // touching
        assert_eq!(a.intersect(&Span::new(500, 600)), None);
    }

    #[test]
    fn span_try_new_rejects_empty() {
        assert!(Span::try_new(5, 5).is_none());
        assert!(Span::try_new(6, 5).is_none());
        assert_eq!(Span::try_new(5, 6), Some(Span::new(5, 6)));
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn status_transitions() {
        use AppointmentStatus::*;
        assert!(Booked.can_become(Confirmed));
        assert!(Booked.can_become(Cancelled));
        assert!(Confirmed.can_become(Cancelled));
        assert!(!Confirmed.can_become(Booked));
        assert!(!Cancelled.can_become(Booked));
        assert!(!Cancelled.can_become(Confirmed));
        assert!(!Booked.can_become(Booked));
        assert!(!Cancelled.is_busy());
        assert!(Confirmed.is_busy());
    }

    #[test]
    fn status_parse_accepts_both_spellings() {
        assert_eq!(AppointmentStatus::parse("Cancelled"), Some(AppointmentStatus::Cancelled));
        assert_eq!(AppointmentStatus::parse("canceled"), Some(AppointmentStatus::Cancelled));
        assert_eq!(AppointmentStatus::parse("pending"), None);
    }

    #[test]
    fn block_scope() {
        let loc = Ulid::new();
        let emp = Ulid::new();
        let everyone = Block {
            id: Ulid::new(),
            org_id: Ulid::new(),
            location_id: loc,
            employee_id: None,
            span: Span::new(0, 10),
        };
        assert!(everyone.applies_to(Some(loc), emp));
        assert!(!everyone.applies_to(Some(Ulid::new()), emp));
        assert!(!everyone.applies_to(None, emp));

        let personal = Block { employee_id: Some(emp), ..everyone.clone() };
        assert!(personal.applies_to(Some(loc), emp));
        assert!(!personal.applies_to(Some(loc), Ulid::new()));
    }

    #[test]
    fn employee_location_eligibility() {
        let loc = Ulid::new();
        let roaming = Employee {
            id: Ulid::new(),
            org_id: Ulid::new(),
            location_id: None,
            name: "Ana".into(),
            active: true,
        };
        assert!(roaming.serves_location(Some(loc)));
        assert!(roaming.serves_location(None));
        let fixed = Employee { location_id: Some(loc), ..roaming };
        assert!(fixed.serves_location(Some(loc)));
        assert!(!fixed.serves_location(Some(Ulid::new())));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked(Appointment {
            id: Ulid::new(),
            org_id: Ulid::new(),
            location_id: None,
            employee_id: Ulid::new(),
            client_id: Ulid::new(),
            service_id: Ulid::new(),
            span: Span::new(1000, 2000),
            status: AppointmentStatus::Booked,
        });
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
