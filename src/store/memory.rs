use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Weekday;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

use super::{Store, StoreError, StoreResult};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that are already queued when the first one arrives
/// join its batch and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never prefix the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

// ── Employee calendar ────────────────────────────────────

/// One employee's appointments sorted by start. Cancelled rows stay.
#[derive(Debug, Default)]
struct Calendar {
    appointments: Vec<Appointment>,
}

impl Calendar {
    fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    fn overlapping(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        // Nothing at or after `right` can start before window.end.
        let right = self.appointments.partition_point(|a| a.span.start < window.end);
        self.appointments[..right]
            .iter()
            .filter(move |a| a.span.end > window.start)
    }

    fn busy_overlapping(&self, window: &Span) -> impl Iterator<Item = &Appointment> {
        self.overlapping(window).filter(|a| a.status.is_busy())
    }

    fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    fn get_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    fn len(&self) -> usize {
        self.appointments.len()
    }
}

type SharedCalendar = Arc<RwLock<Calendar>>;

/// In-memory store for one organization, made durable by a WAL.
///
/// Lock order: `write_gate` → (`setup_lock` | `client_lock` | one calendar).
pub struct TenantStore {
    org: Organization,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    /// Shared by every write, exclusive while compaction snapshots state.
    write_gate: RwLock<()>,
    setup_lock: Mutex<()>,
    client_lock: Mutex<()>,

    locations: DashMap<Ulid, Location>,
    services: DashMap<Ulid, Service>,
    employees: DashMap<Ulid, Employee>,
    /// employee → linked services
    links: DashMap<Ulid, HashSet<Ulid>>,
    hours: DashMap<(Ulid, Weekday), BusinessHours>,
    /// employee → weekly template rows
    availability: DashMap<Ulid, Vec<StaffAvailability>>,
    availability_owner: DashMap<Ulid, Ulid>,
    /// employee → time off
    time_off: DashMap<Ulid, Vec<StaffTimeOff>>,
    time_off_owner: DashMap<Ulid, Ulid>,
    /// location → blocks
    blocks: DashMap<Ulid, Vec<Block>>,
    block_owner: DashMap<Ulid, Ulid>,

    calendars: DashMap<Ulid, SharedCalendar>,
    appointment_owner: DashMap<Ulid, Ulid>,

    clients: DashMap<Ulid, Client>,
    clients_by_phone: DashMap<String, Ulid>,
    clients_by_email: DashMap<String, Ulid>,
    client_bookings: DashMap<Ulid, Vec<Ulid>>,
}

impl TenantStore {
    /// Replay `wal_path` and start the writer task. A log without an
    /// organization record gets one for `slug` before anything else.
    pub fn open(wal_path: PathBuf, slug: &str, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let mut wal = Wal::open(&wal_path)?;

        let recorded = events.iter().find_map(|e| match e {
            Event::OrganizationCreated(org) => Some(org.clone()),
            _ => None,
        });
        let org = match recorded {
            Some(org) => org,
            None => {
                let org = Organization {
                    id: Ulid::new(),
                    slug: slug.to_string(),
                    name: slug.to_string(),
                };
                wal.append_buffered(&Event::OrganizationCreated(org.clone()))?;
                wal.flush_sync()?;
                info!(tenant = slug, org_id = %org.id, "organization created");
                org
            }
        };

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            org,
            wal_tx,
            notify,
            write_gate: RwLock::new(()),
            setup_lock: Mutex::new(()),
            client_lock: Mutex::new(()),
            locations: DashMap::new(),
            services: DashMap::new(),
            employees: DashMap::new(),
            links: DashMap::new(),
            hours: DashMap::new(),
            availability: DashMap::new(),
            availability_owner: DashMap::new(),
            time_off: DashMap::new(),
            time_off_owner: DashMap::new(),
            blocks: DashMap::new(),
            block_owner: DashMap::new(),
            calendars: DashMap::new(),
            appointment_owner: DashMap::new(),
            clients: DashMap::new(),
            clients_by_phone: DashMap::new(),
            clients_by_email: DashMap::new(),
            client_bookings: DashMap::new(),
        };

        // Calendars are built unlocked, then published.
        let mut calendars: HashMap<Ulid, Calendar> = HashMap::new();
        for event in &events {
            match event {
                Event::OrganizationCreated(_) => {}
                Event::Setup(change) => store.apply_change(change),
                Event::ClientCreated(client) => store.index_client(client),
                Event::AppointmentBooked(appointment) => {
                    store.index_appointment(appointment);
                    calendars
                        .entry(appointment.employee_id)
                        .or_default()
                        .insert(appointment.clone());
                }
                Event::AppointmentStatusChanged { id, employee_id, status } => {
                    if let Some(a) = calendars.get_mut(employee_id).and_then(|c| c.get_mut(*id)) {
                        a.status = *status;
                    }
                }
            }
        }
        for (employee_id, calendar) in calendars {
            store.calendars.insert(employee_id, Arc::new(RwLock::new(calendar)));
        }

        debug!(tenant = slug, events = events.len(), "tenant store replayed");
        Ok(store)
    }

    pub fn organization(&self) -> &Organization {
        &self.org
    }

    fn owns(&self, org_id: Ulid) -> bool {
        org_id == self.org.id
    }

    fn require_org(&self, org_id: Ulid) -> StoreResult<()> {
        if self.owns(org_id) {
            Ok(())
        } else {
            Err(StoreError::NotFound { entity: "organization", id: org_id })
        }
    }

    async fn wal_append(&self, event: &Event) -> StoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))??;
        Ok(())
    }

    fn calendar(&self, employee_id: Ulid) -> SharedCalendar {
        self.calendars.entry(employee_id).or_default().value().clone()
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact(&self) -> StoreResult<()> {
        let _gate = self.write_gate.write().await;
        let events = self.snapshot().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))??;
        Ok(())
    }

    async fn snapshot(&self) -> Vec<Event> {
        let mut events = vec![Event::OrganizationCreated(self.org.clone())];
        let setup = |change: SetupChange| Event::Setup(change);

        events.extend(self.locations.iter().map(|e| setup(SetupChange::LocationSaved(e.value().clone()))));
        events.extend(self.services.iter().map(|e| setup(SetupChange::ServiceSaved(e.value().clone()))));
        events.extend(self.employees.iter().map(|e| setup(SetupChange::EmployeeSaved(e.value().clone()))));
        for entry in self.links.iter() {
            let employee_id = *entry.key();
            events.extend(entry.value().iter().map(|&service_id| {
                setup(SetupChange::ServiceLinked { employee_id, service_id })
            }));
        }
        events.extend(self.hours.iter().map(|e| setup(SetupChange::BusinessHoursSaved(e.value().clone()))));
        for entry in self.availability.iter() {
            events.extend(entry.value().iter().cloned().map(|r| setup(SetupChange::AvailabilityAdded(r))));
        }
        for entry in self.time_off.iter() {
            events.extend(entry.value().iter().cloned().map(|t| setup(SetupChange::TimeOffAdded(t))));
        }
        for entry in self.blocks.iter() {
            events.extend(entry.value().iter().cloned().map(|b| setup(SetupChange::BlockAdded(b))));
        }
        events.extend(self.clients.iter().map(|e| Event::ClientCreated(e.value().clone())));

        let calendars: Vec<SharedCalendar> = self.calendars.iter().map(|e| e.value().clone()).collect();
        for calendar in calendars {
            let guard = calendar.read().await;
            events.extend(guard.appointments.iter().cloned().map(Event::AppointmentBooked));
        }
        events
    }

    // ── Applying records ─────────────────────────────────────

    fn index_client(&self, client: &Client) {
        if let Some(phone) = &client.phone {
            self.clients_by_phone.entry(phone.clone()).or_insert(client.id);
        }
        if let Some(email) = &client.email {
            self.clients_by_email.entry(email.clone()).or_insert(client.id);
        }
        self.clients.insert(client.id, client.clone());
    }

    fn index_appointment(&self, appointment: &Appointment) {
        self.appointment_owner.insert(appointment.id, appointment.employee_id);
        self.client_bookings
            .entry(appointment.client_id)
            .or_default()
            .push(appointment.id);
    }

    fn apply_change(&self, change: &SetupChange) {
        match change {
            SetupChange::LocationSaved(location) => {
                self.locations.insert(location.id, location.clone());
            }
            SetupChange::ServiceSaved(service) => {
                self.services.insert(service.id, service.clone());
            }
            SetupChange::EmployeeSaved(employee) => {
                self.employees.insert(employee.id, employee.clone());
            }
            SetupChange::ServiceLinked { employee_id, service_id } => {
                self.links.entry(*employee_id).or_default().insert(*service_id);
            }
            SetupChange::ServiceUnlinked { employee_id, service_id } => {
                if let Some(mut set) = self.links.get_mut(employee_id) {
                    set.remove(service_id);
                }
            }
            SetupChange::BusinessHoursSaved(hours) => {
                self.hours.insert((hours.location_id, hours.weekday), hours.clone());
            }
            SetupChange::AvailabilityAdded(row) => {
                self.availability_owner.insert(row.id, row.employee_id);
                self.availability.entry(row.employee_id).or_default().push(row.clone());
            }
            SetupChange::AvailabilityRemoved { id } => {
                if let Some((_, employee_id)) = self.availability_owner.remove(id)
                    && let Some(mut rows) = self.availability.get_mut(&employee_id)
                {
                    rows.retain(|r| r.id != *id);
                }
            }
            SetupChange::TimeOffAdded(off) => {
                self.time_off_owner.insert(off.id, off.employee_id);
                self.time_off.entry(off.employee_id).or_default().push(off.clone());
            }
            SetupChange::TimeOffRemoved { id } => {
                if let Some((_, employee_id)) = self.time_off_owner.remove(id)
                    && let Some(mut rows) = self.time_off.get_mut(&employee_id)
                {
                    rows.retain(|r| r.id != *id);
                }
            }
            SetupChange::BlockAdded(block) => {
                self.block_owner.insert(block.id, block.location_id);
                self.blocks.entry(block.location_id).or_default().push(block.clone());
            }
            SetupChange::BlockRemoved { id } => {
                if let Some((_, location_id)) = self.block_owner.remove(id)
                    && let Some(mut rows) = self.blocks.get_mut(&location_id)
                {
                    rows.retain(|r| r.id != *id);
                }
            }
        }
    }

    /// Referential and size checks for a setup change, against current state.
    fn check_change(&self, change: &SetupChange) -> StoreResult<()> {
        let employee_exists = |id: Ulid| {
            if self.employees.contains_key(&id) {
                Ok(())
            } else {
                Err(StoreError::NotFound { entity: "employee", id })
            }
        };
        let location_exists = |id: Ulid| {
            if self.locations.contains_key(&id) {
                Ok(())
            } else {
                Err(StoreError::NotFound { entity: "location", id })
            }
        };
        match change {
            SetupChange::LocationSaved(_) | SetupChange::ServiceSaved(_) => Ok(()),
            SetupChange::EmployeeSaved(employee) => {
                if !self.employees.contains_key(&employee.id)
                    && self.employees.len() >= MAX_EMPLOYEES_PER_TENANT
                {
                    return Err(StoreError::Limit("too many employees"));
                }
                if let Some(location_id) = employee.location_id {
                    location_exists(location_id)?;
                }
                Ok(())
            }
            SetupChange::ServiceLinked { employee_id, service_id } => {
                employee_exists(*employee_id)?;
                if !self.services.contains_key(service_id) {
                    return Err(StoreError::NotFound { entity: "service", id: *service_id });
                }
                Ok(())
            }
            SetupChange::ServiceUnlinked { employee_id, .. } => employee_exists(*employee_id),
            SetupChange::BusinessHoursSaved(hours) => location_exists(hours.location_id),
            SetupChange::AvailabilityAdded(row) => {
                employee_exists(row.employee_id)?;
                if self.availability_owner.contains_key(&row.id) {
                    return Err(StoreError::Duplicate { entity: "availability", id: row.id });
                }
                let rows = self.availability.get(&row.employee_id).map_or(0, |r| r.len());
                if rows >= MAX_AVAILABILITY_ROWS_PER_EMPLOYEE {
                    return Err(StoreError::Limit("too many availability rows for employee"));
                }
                Ok(())
            }
            SetupChange::AvailabilityRemoved { id } => {
                if self.availability_owner.contains_key(id) {
                    Ok(())
                } else {
                    Err(StoreError::NotFound { entity: "availability", id: *id })
                }
            }
            SetupChange::TimeOffAdded(off) => {
                employee_exists(off.employee_id)?;
                if self.time_off_owner.contains_key(&off.id) {
                    return Err(StoreError::Duplicate { entity: "time off", id: off.id });
                }
                Ok(())
            }
            SetupChange::TimeOffRemoved { id } => {
                if self.time_off_owner.contains_key(id) {
                    Ok(())
                } else {
                    Err(StoreError::NotFound { entity: "time off", id: *id })
                }
            }
            SetupChange::BlockAdded(block) => {
                location_exists(block.location_id)?;
                if let Some(employee_id) = block.employee_id {
                    employee_exists(employee_id)?;
                }
                if self.block_owner.contains_key(&block.id) {
                    return Err(StoreError::Duplicate { entity: "block", id: block.id });
                }
                Ok(())
            }
            SetupChange::BlockRemoved { id } => {
                if self.block_owner.contains_key(id) {
                    Ok(())
                } else {
                    Err(StoreError::NotFound { entity: "block", id: *id })
                }
            }
        }
    }

    fn lookup_client(&self, phone: Option<&str>, email: Option<&str>) -> Option<Client> {
        let by_phone = phone.and_then(|p| self.clients_by_phone.get(p).map(|id| *id));
        let id = by_phone.or_else(|| email.and_then(|e| self.clients_by_email.get(e).map(|id| *id)))?;
        self.clients.get(&id).map(|c| c.value().clone())
    }
}

#[async_trait]
impl Store for TenantStore {
    async fn location(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Location>> {
        Ok(self.locations.get(&id).filter(|_| self.owns(org_id)).map(|l| l.value().clone()))
    }

    async fn locations(&self, org_id: Ulid) -> StoreResult<Vec<Location>> {
        if !self.owns(org_id) {
            return Ok(Vec::new());
        }
        let mut out: Vec<Location> = self.locations.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn service(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Service>> {
        Ok(self.services.get(&id).filter(|_| self.owns(org_id)).map(|s| s.value().clone()))
    }

    async fn services(&self, org_id: Ulid) -> StoreResult<Vec<Service>> {
        if !self.owns(org_id) {
            return Ok(Vec::new());
        }
        Ok(self.services.iter().map(|e| e.value().clone()).collect())
    }

    async fn employee(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Employee>> {
        Ok(self.employees.get(&id).filter(|_| self.owns(org_id)).map(|e| e.value().clone()))
    }

    async fn qualified_employees(&self, org_id: Ulid, service_id: Ulid) -> StoreResult<Vec<Employee>> {
        if !self.owns(org_id) {
            return Ok(Vec::new());
        }
        Ok(self
            .employees
            .iter()
            .filter(|e| e.active)
            .filter(|e| self.links.get(&e.id).is_some_and(|s| s.contains(&service_id)))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn is_qualified(&self, org_id: Ulid, employee_id: Ulid, service_id: Ulid) -> StoreResult<bool> {
        Ok(self.owns(org_id) && self.links.get(&employee_id).is_some_and(|s| s.contains(&service_id)))
    }

    async fn business_hours(
        &self,
        org_id: Ulid,
        location_id: Ulid,
        weekday: Weekday,
    ) -> StoreResult<Option<BusinessHours>> {
        Ok(self
            .hours
            .get(&(location_id, weekday))
            .filter(|h| self.owns(org_id) && h.active)
            .map(|h| h.value().clone()))
    }

    async fn staff_availability(
        &self,
        org_id: Ulid,
        employee_id: Ulid,
        weekday: Weekday,
    ) -> StoreResult<Vec<StaffAvailability>> {
        if !self.owns(org_id) {
            return Ok(Vec::new());
        }
        Ok(self
            .availability
            .get(&employee_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.active && r.weekday == weekday)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn appointments_overlapping(
        &self,
        org_id: Ulid,
        employee_id: Ulid,
        window: Span,
    ) -> StoreResult<Vec<Appointment>> {
        if !self.owns(org_id) {
            return Ok(Vec::new());
        }
        let Some(calendar) = self.calendars.get(&employee_id).map(|c| c.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = calendar.read().await;
        Ok(guard.busy_overlapping(&window).cloned().collect())
    }

    async fn time_off_overlapping(
        &self,
        org_id: Ulid,
        employee_id: Ulid,
        window: Span,
    ) -> StoreResult<Vec<StaffTimeOff>> {
        if !self.owns(org_id) {
            return Ok(Vec::new());
        }
        Ok(self
            .time_off
            .get(&employee_id)
            .map(|rows| rows.iter().filter(|t| t.span.overlaps(&window)).cloned().collect())
            .unwrap_or_default())
    }

    async fn blocks_overlapping(
        &self,
        org_id: Ulid,
        location_id: Ulid,
        employee_id: Ulid,
        window: Span,
    ) -> StoreResult<Vec<Block>> {
        if !self.owns(org_id) {
            return Ok(Vec::new());
        }
        Ok(self
            .blocks
            .get(&location_id)
            .map(|rows| {
                rows.iter()
                    .filter(|b| b.applies_to(Some(location_id), employee_id) && b.span.overlaps(&window))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn appointment(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Appointment>> {
        if !self.owns(org_id) {
            return Ok(None);
        }
        let Some(employee_id) = self.appointment_owner.get(&id).map(|e| *e) else {
            return Ok(None);
        };
        let calendar = self.calendar(employee_id);
        let guard = calendar.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn client(&self, org_id: Ulid, id: Ulid) -> StoreResult<Option<Client>> {
        Ok(self.clients.get(&id).filter(|_| self.owns(org_id)).map(|c| c.value().clone()))
    }

    async fn client_by_contact(
        &self,
        org_id: Ulid,
        phone: Option<&str>,
        email: Option<&str>,
    ) -> StoreResult<Option<Client>> {
        if !self.owns(org_id) {
            return Ok(None);
        }
        Ok(self.lookup_client(phone, email))
    }

    async fn client_appointments(&self, org_id: Ulid, client_id: Ulid, from: Ms) -> StoreResult<Vec<Appointment>> {
        if !self.owns(org_id) {
            return Ok(Vec::new());
        }
        let ids = self.client_bookings.get(&client_id).map(|v| v.value().clone()).unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(appointment) = self.appointment(org_id, id).await?
                && appointment.span.start >= from
            {
                out.push(appointment);
            }
        }
        out.sort_by_key(|a| (a.span.start, a.id));
        Ok(out)
    }

    async fn resolve_client(&self, org_id: Ulid, identity: &ClientIdentity) -> StoreResult<Client> {
        self.require_org(org_id)?;
        let _gate = self.write_gate.read().await;
        let _clients = self.client_lock.lock().await;

        if let Some(existing) = self.lookup_client(identity.phone.as_deref(), identity.email.as_deref()) {
            return Ok(existing);
        }
        let client = Client {
            id: Ulid::new(),
            org_id,
            name: identity.name.clone(),
            phone: identity.phone.clone(),
            email: identity.email.clone(),
        };
        let event = Event::ClientCreated(client.clone());
        self.wal_append(&event).await?;
        self.index_client(&client);
        self.notify.send(&event);
        debug!(client_id = %client.id, "client created");
        Ok(client)
    }

    async fn insert_appointment(&self, appointment: Appointment) -> StoreResult<()> {
        self.require_org(appointment.org_id)?;
        let _gate = self.write_gate.read().await;
        let calendar = self.calendar(appointment.employee_id);
        let mut guard = calendar.write().await;

        if self.appointment_owner.contains_key(&appointment.id) {
            return Err(StoreError::Duplicate { entity: "appointment", id: appointment.id });
        }
        if guard.len() >= MAX_APPOINTMENTS_PER_EMPLOYEE {
            return Err(StoreError::Limit("too many appointments for employee"));
        }
        if appointment.status.is_busy()
            && let Some(existing) = guard.busy_overlapping(&appointment.span).next()
        {
            return Err(StoreError::Overlap { employee_id: appointment.employee_id, with: existing.id });
        }

        let event = Event::AppointmentBooked(appointment.clone());
        self.wal_append(&event).await?;
        self.index_appointment(&appointment);
        guard.insert(appointment);
        self.notify.send(&event);
        Ok(())
    }

    async fn transition_appointment(
        &self,
        org_id: Ulid,
        id: Ulid,
        next: AppointmentStatus,
    ) -> StoreResult<Appointment> {
        self.require_org(org_id)?;
        let employee_id = self
            .appointment_owner
            .get(&id)
            .map(|e| *e)
            .ok_or(StoreError::NotFound { entity: "appointment", id })?;
        let _gate = self.write_gate.read().await;
        let calendar = self.calendar(employee_id);
        let mut guard = calendar.write().await;

        let current = guard
            .get(id)
            .map(|a| a.status)
            .ok_or(StoreError::NotFound { entity: "appointment", id })?;
        if !current.can_become(next) {
            return Err(StoreError::InvalidTransition { from: current, to: next });
        }

        let event = Event::AppointmentStatusChanged { id, employee_id, status: next };
        self.wal_append(&event).await?;
        let updated = match guard.get_mut(id) {
            Some(appointment) => {
                appointment.status = next;
                appointment.clone()
            }
            None => return Err(StoreError::NotFound { entity: "appointment", id }),
        };
        self.notify.send(&event);
        Ok(updated)
    }

    async fn apply_setup(&self, org_id: Ulid, change: SetupChange) -> StoreResult<()> {
        self.require_org(org_id)?;
        let _gate = self.write_gate.read().await;
        let _setup = self.setup_lock.lock().await;

        self.check_change(&change)?;
        let event = Event::Setup(change);
        self.wal_append(&event).await?;
        if let Event::Setup(change) = &event {
            self.apply_change(change);
        }
        self.notify.send(&event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ClockTime;

    fn wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open(name: &str) -> (TenantStore, PathBuf) {
        let path = wal_path(name);
        let store = TenantStore::open(path.clone(), "acme", Arc::new(NotifyHub::new())).unwrap();
        (store, path)
    }

    async fn seed_employee(store: &TenantStore) -> Employee {
        let org_id = store.organization().id;
        let employee = Employee {
            id: Ulid::new(),
            org_id,
            location_id: None,
            name: "Ana".into(),
            active: true,
        };
        store
            .apply_setup(org_id, SetupChange::EmployeeSaved(employee.clone()))
            .await
            .unwrap();
        employee
    }

    fn appointment(org_id: Ulid, employee_id: Ulid, start: Ms, end: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            org_id,
            location_id: None,
            employee_id,
            client_id: Ulid::new(),
            service_id: Ulid::new(),
            span: Span::new(start, end),
            status: AppointmentStatus::Booked,
        }
    }

    #[test]
    fn calendar_overlapping_uses_half_open_bounds() {
        let mut cal = Calendar::default();
        let org = Ulid::new();
        let emp = Ulid::new();
        cal.insert(appointment(org, emp, 450, 600));
        cal.insert(appointment(org, emp, 100, 200));
        cal.insert(appointment(org, emp, 1000, 1100));
        let hits: Vec<_> = cal.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
        assert_eq!(cal.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(cal.appointments[0].span.start, 100);
    }

    #[tokio::test]
    async fn overlapping_insert_rejected() {
        let (store, _) = open("overlap.wal");
        let org_id = store.organization().id;
        let emp = seed_employee(&store).await;

        let first = appointment(org_id, emp.id, 1000, 2000);
        store.insert_appointment(first.clone()).await.unwrap();

        let err = store
            .insert_appointment(appointment(org_id, emp.id, 1500, 2500))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Overlap { with, .. } if with == first.id));

        // Touching is fine.
        store
            .insert_appointment(appointment(org_id, emp.id, 2000, 3000))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_appointment_frees_interval() {
        let (store, _) = open("cancel_frees.wal");
        let org_id = store.organization().id;
        let emp = seed_employee(&store).await;

        let first = appointment(org_id, emp.id, 1000, 2000);
        store.insert_appointment(first.clone()).await.unwrap();
        let cancelled = store
            .transition_appointment(org_id, first.id, AppointmentStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(cancelled.status, AppointmentStatus::Cancelled);

        store
            .insert_appointment(appointment(org_id, emp.id, 1000, 2000))
            .await
            .unwrap();
        let busy = store
            .appointments_overlapping(org_id, emp.id, Span::new(0, 5000))
            .await
            .unwrap();
        assert_eq!(busy.len(), 1);
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let (store, _) = open("bad_transition.wal");
        let org_id = store.organization().id;
        let emp = seed_employee(&store).await;
        let a = appointment(org_id, emp.id, 1000, 2000);
        store.insert_appointment(a.clone()).await.unwrap();
        store
            .transition_appointment(org_id, a.id, AppointmentStatus::Cancelled)
            .await
            .unwrap();
        let err = store
            .transition_appointment(org_id, a.id, AppointmentStatus::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: AppointmentStatus::Cancelled, to: AppointmentStatus::Confirmed }
        ));
    }

    #[tokio::test]
    async fn concurrent_overlapping_inserts_one_wins() {
        let (store, _) = open("race.wal");
        let store = Arc::new(store);
        let org_id = store.organization().id;
        let emp = seed_employee(&store).await;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let a = appointment(org_id, emp.id, 1000 + i, 2000 + i);
            handles.push(tokio::spawn(async move { store.insert_appointment(a).await }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn client_lookup_prefers_phone_then_email() {
        let (store, _) = open("clients.wal");
        let org_id = store.organization().id;

        let by_phone = store
            .resolve_client(
                org_id,
                &ClientIdentity { name: "Rui".into(), phone: Some("+351900".into()), email: None },
            )
            .await
            .unwrap();
        let by_email = store
            .resolve_client(
                org_id,
                &ClientIdentity { name: "Eva".into(), phone: None, email: Some("eva@example.com".into()) },
            )
            .await
            .unwrap();
        assert_ne!(by_phone.id, by_email.id);

        // Phone match wins even when the email belongs to someone else.
        let again = store
            .resolve_client(
                org_id,
                &ClientIdentity {
                    name: "Rui".into(),
                    phone: Some("+351900".into()),
                    email: Some("eva@example.com".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(again.id, by_phone.id);

        let email_only = store
            .resolve_client(
                org_id,
                &ClientIdentity { name: "x".into(), phone: Some("+1000".into()), email: Some("eva@example.com".into()) },
            )
            .await
            .unwrap();
        assert_eq!(email_only.id, by_email.id);
    }

    #[tokio::test]
    async fn concurrent_first_bookings_share_one_client() {
        let (store, path) = open("client_race.wal");
        let store = Arc::new(store);
        let org_id = store.organization().id;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let identity = ClientIdentity {
                name: format!("Rui {i}"),
                phone: Some("+351911222333".into()),
                email: None,
            };
            handles.push(tokio::spawn(async move { store.resolve_client(org_id, &identity).await }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.clients.len(), 1);

        let created = Wal::replay(&path)
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e, Event::ClientCreated(_)))
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn replay_restores_state() {
        let path = wal_path("replay.wal");
        let (org_id, emp_id, appt_id) = {
            let store = TenantStore::open(path.clone(), "acme", Arc::new(NotifyHub::new())).unwrap();
            let org_id = store.organization().id;
            let emp = seed_employee(&store).await;
            store
                .apply_setup(
                    org_id,
                    SetupChange::AvailabilityAdded(StaffAvailability {
                        id: Ulid::new(),
                        org_id,
                        employee_id: emp.id,
                        weekday: Weekday::Mon,
                        start: ClockTime::from_hm(9, 0).unwrap(),
                        end: ClockTime::from_hm(12, 0).unwrap(),
                        active: true,
                    }),
                )
                .await
                .unwrap();
            let a = appointment(org_id, emp.id, 1000, 2000);
            store.insert_appointment(a.clone()).await.unwrap();
            store
                .transition_appointment(org_id, a.id, AppointmentStatus::Confirmed)
                .await
                .unwrap();
            (org_id, emp.id, a.id)
        };

        let store = TenantStore::open(path, "acme", Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(store.organization().id, org_id);
        assert!(store.employee(org_id, emp_id).await.unwrap().is_some());
        assert_eq!(store.staff_availability(org_id, emp_id, Weekday::Mon).await.unwrap().len(), 1);
        let a = store.appointment(org_id, appt_id).await.unwrap().unwrap();
        assert_eq!(a.status, AppointmentStatus::Confirmed);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = wal_path("compact_state.wal");
        let (org_id, emp_id) = {
            let store = TenantStore::open(path.clone(), "acme", Arc::new(NotifyHub::new())).unwrap();
            let org_id = store.organization().id;
            let emp = seed_employee(&store).await;
            for i in 0..10 {
                let a = appointment(org_id, emp.id, i * 1000, i * 1000 + 500);
                store.insert_appointment(a.clone()).await.unwrap();
                store
                    .transition_appointment(org_id, a.id, AppointmentStatus::Cancelled)
                    .await
                    .unwrap();
            }
            store.insert_appointment(appointment(org_id, emp.id, 50_000, 51_000)).await.unwrap();
            assert!(store.appends_since_compact().await >= 21);
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
            (org_id, emp.id)
        };

        let store = TenantStore::open(path, "acme", Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(store.organization().id, org_id);
        let busy = store
            .appointments_overlapping(org_id, emp_id, Span::new(0, 100_000))
            .await
            .unwrap();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].span, Span::new(50_000, 51_000));
    }

    #[tokio::test]
    async fn foreign_org_sees_nothing() {
        let (store, _) = open("foreign.wal");
        let org_id = store.organization().id;
        let emp = seed_employee(&store).await;
        let other = Ulid::new();
        assert!(store.employee(org_id, emp.id).await.unwrap().is_some());
        assert!(store.employee(other, emp.id).await.unwrap().is_none());
        assert!(store.services(other).await.unwrap().is_empty());
        assert!(matches!(
            store.apply_setup(other, SetupChange::AvailabilityRemoved { id: Ulid::new() }).await,
            Err(StoreError::NotFound { entity: "organization", .. })
        ));
    }

    #[tokio::test]
    async fn setup_checks_references() {
        let (store, _) = open("setup_refs.wal");
        let org_id = store.organization().id;
        let err = store
            .apply_setup(
                org_id,
                SetupChange::ServiceLinked { employee_id: Ulid::new(), service_id: Ulid::new() },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "employee", .. }));

        let err = store
            .apply_setup(org_id, SetupChange::BlockRemoved { id: Ulid::new() })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "block", .. }));
    }

    #[tokio::test]
    async fn writes_are_broadcast() {
        let notify = Arc::new(NotifyHub::new());
        let mut rx = notify.subscribe();
        let store = TenantStore::open(wal_path("broadcast.wal"), "acme", notify).unwrap();
        let emp = seed_employee(&store).await;
        match rx.recv().await.unwrap() {
            Event::Setup(SetupChange::EmployeeSaved(e)) => assert_eq!(e.id, emp.id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
