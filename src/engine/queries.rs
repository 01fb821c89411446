use ulid::Ulid;

use crate::model::*;

use super::{BookingEngine, EngineError};

impl BookingEngine {
    pub(super) async fn active_service(&self, org_id: Ulid, service_id: Ulid) -> Result<Service, EngineError> {
        self.store
            .service(org_id, service_id)
            .await?
            .filter(|s| s.active)
            .ok_or(EngineError::not_found("service", service_id))
    }

    /// Active services, by name.
    pub async fn services(&self, org_id: Ulid) -> Result<Vec<Service>, EngineError> {
        let mut services: Vec<Service> = self
            .store
            .services(org_id)
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(services)
    }

    pub async fn locations(&self, org_id: Ulid) -> Result<Vec<Location>, EngineError> {
        Ok(self.store.locations(org_id).await?)
    }

    /// Active employees linked to the service and working at `location_id`
    /// (or everywhere), by name then id.
    pub async fn roster(
        &self,
        org_id: Ulid,
        service_id: Ulid,
        location_id: Option<Ulid>,
    ) -> Result<Vec<Employee>, EngineError> {
        let mut roster: Vec<Employee> = self
            .store
            .qualified_employees(org_id, service_id)
            .await?
            .into_iter()
            .filter(|e| e.active && e.serves_location(location_id))
            .collect();
        roster.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(roster)
    }

    /// "My appointments": every appointment of the client found by phone (else
    /// email) starting at or after `from`. Unknown contact → empty.
    pub async fn client_appointments(
        &self,
        org_id: Ulid,
        phone: Option<&str>,
        email: Option<&str>,
        from: Ms,
    ) -> Result<Vec<Appointment>, EngineError> {
        let phone = phone.map(str::trim).filter(|p| !p.is_empty());
        let email = email.map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty());
        if phone.is_none() && email.is_none() {
            return Err(EngineError::validation("phone or email is required"));
        }
        let Some(client) = self.store.client_by_contact(org_id, phone, email.as_deref()).await? else {
            return Ok(Vec::new());
        };
        Ok(self.store.client_appointments(org_id, client.id, from).await?)
    }
}
