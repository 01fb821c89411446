use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::engine::{BookingEngine, SlotSettings};
use crate::limits::*;
use crate::messenger::{self, Messenger};
use crate::notify::NotifyHub;
use crate::store::TenantStore;

/// File-safe tenant key for a database name.
pub fn tenant_slug(database: &str) -> std::io::Result<String> {
    if database.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }

    // Sanitize tenant name to prevent path traversal
    let slug: String = database
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if slug.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(slug)
}

/// One organization: its store, the engine over it, and its event hub.
pub struct Tenant {
    pub store: Arc<TenantStore>,
    pub engine: Arc<BookingEngine>,
    pub notify: Arc<NotifyHub>,
}

/// Manages per-tenant stores. Each tenant gets its own WAL, engine, compactor
/// and (when a messenger is set) confirmation dispatcher.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    settings: SlotSettings,
    messenger: Option<Arc<dyn Messenger>>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, settings: SlotSettings) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            compact_threshold,
            settings,
            messenger: None,
        }
    }

    /// Send booking confirmations through `messenger`.
    pub fn with_messenger(mut self, messenger: Arc<dyn Messenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    /// Get or lazily open the tenant for the given database name.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Tenant>> {
        let slug = tenant_slug(tenant)?;
        if let Some(t) = self.tenants.get(&slug) {
            return Ok(t.value().clone());
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Opened under the entry lock so one WAL never gets two writers.
        let tenant = match self.tenants.entry(slug.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let tenant = Arc::new(self.open(&slug)?);
                v.insert(tenant.clone());
                tenant
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        info!(tenant = %slug, org_id = %tenant.store.organization().id, "tenant loaded");
        Ok(tenant)
    }

    fn open(&self, slug: &str) -> std::io::Result<Tenant> {
        let wal_path = self.data_dir.join(format!("{slug}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let store = Arc::new(TenantStore::open(wal_path, slug, notify.clone())?);
        let engine = Arc::new(BookingEngine::new(store.clone(), self.settings));

        let compactor_store = store.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_store, threshold).await;
        });
        if let Some(messenger) = &self.messenger {
            let events = notify.subscribe();
            let offset = self.settings.default_utc_offset_min;
            tokio::spawn(messenger::run_dispatcher(events, store.clone(), messenger.clone(), offset));
        }

        Ok(Tenant { store, engine, notify })
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ClockTime;
    use crate::engine::{BookingRequest, EmployeeChoice, SlotQuery};
    use crate::messenger::RecordingMessenger;
    use crate::model::*;
    use chrono::{NaiveDate, Weekday};
    use std::fs;
    use std::time::Duration;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, SlotSettings::default())
    }

    /// A location open Monday 09:00-12:00 with one employee offering a 30 minute service.
    async fn seed(tenant: &Tenant, employee_id: Ulid, service_id: Ulid) -> Ulid {
        let engine = &tenant.engine;
        let org = tenant.store.organization().id;
        let hm = |h| ClockTime::from_hm(h, 0).unwrap();
        let location = engine
            .save_location(org, Location { id: Ulid::new(), org_id: org, name: "Centro".into(), utc_offset_min: 0 })
            .await
            .unwrap();
        engine
            .save_service(org, Service { id: service_id, org_id: org, name: "Corte".into(), duration_min: 30, active: true })
            .await
            .unwrap();
        engine
            .save_employee(org, Employee { id: employee_id, org_id: org, location_id: None, name: "Ana".into(), active: true })
            .await
            .unwrap();
        engine.link_service(org, employee_id, service_id).await.unwrap();
        engine
            .save_business_hours(
                org,
                BusinessHours { org_id: org, location_id: location.id, weekday: Weekday::Mon, open: hm(9), close: hm(12), active: true },
            )
            .await
            .unwrap();
        engine
            .add_availability(
                org,
                StaffAvailability {
                    id: Ulid::new(),
                    org_id: org,
                    employee_id,
                    weekday: Weekday::Mon,
                    start: hm(9),
                    end: hm(12),
                    active: true,
                },
            )
            .await
            .unwrap();
        location.id
    }

    fn query(tenant: &Tenant, location_id: Ulid, service_id: Ulid) -> SlotQuery {
        SlotQuery {
            org_id: tenant.store.organization().id,
            location_id: Some(location_id),
            service_id,
            employee: EmployeeChoice::Any,
            date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let a = tm.get_or_create("tenant_a").unwrap();
        let b = tm.get_or_create("tenant_b").unwrap();
        assert_ne!(a.store.organization().id, b.store.organization().id);

        // Same ids in both tenants; only A is configured.
        let (employee_id, service_id) = (Ulid::new(), Ulid::new());
        let location_id = seed(&a, employee_id, service_id).await;

        let report = a.engine.find_slots(&query(&a, location_id, service_id)).await.unwrap();
        assert_eq!(report.slots.len(), 11);

        // A's ids mean nothing to B.
        let err = b.engine.find_slots(&query(&b, location_id, service_id)).await;
        assert!(err.is_err());
        // Nor does A's organization id work against B's store.
        let foreign = b.engine.find_slots(&query(&a, location_id, service_id)).await;
        assert!(foreign.is_err());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());
        assert!(tm.is_empty());

        let tenant = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(tenant.store.organization().slug, "my_db");
        assert_eq!(tm.len(), 1);
    }

    #[tokio::test]
    async fn tenant_same_store_returned() {
        let dir = test_data_dir("same_store");
        let tm = manager(dir);

        let t1 = tm.get_or_create("foo").unwrap();
        let t2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&t1, &t2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        // Path traversal attempt
        let evil = tm.get_or_create("../evil").unwrap();
        // Should create "evil.wal", not "../evil.wal"
        assert!(dir.join("evil.wal").exists());
        // And share the store with the plain name.
        assert!(Arc::ptr_eq(&evil, &tm.get_or_create("evil").unwrap()));

        // Empty after sanitization
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_reopen_keeps_organization() {
        let dir = test_data_dir("reopen");
        let org_id = {
            let tm = manager(dir.clone());
            tm.get_or_create("acme").unwrap().store.organization().id
        };
        let tm = manager(dir);
        assert_eq!(tm.get_or_create("acme").unwrap().store.organization().id, org_id);
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn booking_sends_confirmation() {
        let dir = test_data_dir("confirmation");
        let recorder = Arc::new(RecordingMessenger::default());
        let tm = manager(dir).with_messenger(recorder.clone());
        let tenant = tm.get_or_create("salon").unwrap();
        let (employee_id, service_id) = (Ulid::new(), Ulid::new());
        let location_id = seed(&tenant, employee_id, service_id).await;

        tenant
            .engine
            .book(BookingRequest {
                id: None,
                org_id: tenant.store.organization().id,
                location_id: Some(location_id),
                service_id,
                employee_id,
                // 2025-03-10T09:30:00Z
                start: 1_741_599_000_000,
                client: ClientIdentity {
                    name: "Rui".into(),
                    phone: Some("+351 911 222 333".into()),
                    email: None,
                },
            })
            .await
            .unwrap();

        let mut sent = Vec::new();
        for _ in 0..100 {
            sent = recorder.sent();
            if !sent.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "351911222333");
        assert_eq!(sent[0].1, "Hi Rui, your Corte is booked for 2025-03-10 09:30.");
    }

    #[tokio::test]
    async fn offline_messenger_skips_confirmation() {
        let dir = test_data_dir("offline");
        let recorder = Arc::new(RecordingMessenger::offline());
        let tm = manager(dir).with_messenger(recorder.clone());
        let tenant = tm.get_or_create("salon").unwrap();
        let (employee_id, service_id) = (Ulid::new(), Ulid::new());
        let location_id = seed(&tenant, employee_id, service_id).await;

        let booked = tenant
            .engine
            .book(BookingRequest {
                id: None,
                org_id: tenant.store.organization().id,
                location_id: Some(location_id),
                service_id,
                employee_id,
                start: 1_741_599_000_000,
                client: ClientIdentity { name: "Rui".into(), phone: None, email: Some("rui@example.com".into()) },
            })
            .await;
        assert!(booked.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.sent().is_empty());
    }
}
