use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::model::*;
use crate::observability;
use crate::store::Store;

#[derive(Debug)]
pub struct MessengerError(pub String);

impl std::fmt::Display for MessengerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "messenger: {}", self.0)
    }
}

impl std::error::Error for MessengerError {}

/// Outbound text channel to clients.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// False while the channel is disconnected; sends are skipped.
    async fn is_ready(&self) -> bool;

    async fn send_text(&self, to: &str, text: &str) -> Result<(), MessengerError>;
}

/// Writes each message to the log instead of delivering it.
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn is_ready(&self) -> bool {
        true
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<(), MessengerError> {
        info!(to, text, "confirmation");
        Ok(())
    }
}

/// Keeps every sent message in memory.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(String, String)>>,
    offline: bool,
}

impl RecordingMessenger {
    pub fn offline() -> Self {
        Self { sent: Mutex::default(), offline: true }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn is_ready(&self) -> bool {
        !self.offline
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<(), MessengerError> {
        self.sent
            .lock()
            .map_err(|_| MessengerError("poisoned".into()))?
            .push((to.to_string(), text.to_string()));
        Ok(())
    }
}

/// Phone numbers are addressed by their digits only.
fn address(contact: &str) -> String {
    if contact.contains('@') {
        contact.to_string()
    } else {
        contact.chars().filter(char::is_ascii_digit).collect()
    }
}

fn local_time(ms: Ms, utc_offset_min: i32) -> String {
    let offset = FixedOffset::east_opt(utc_offset_min * 60).unwrap_or_else(|| Utc.fix());
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.with_timezone(&offset).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub(crate) async fn confirmation_text(
    store: &dyn Store,
    appointment: &Appointment,
    default_utc_offset_min: i32,
) -> Option<(String, String)> {
    let org_id = appointment.org_id;
    let client = store.client(org_id, appointment.client_id).await.ok()??;
    let to = address(client.contact()?);
    if to.is_empty() {
        return None;
    }
    let service = store
        .service(org_id, appointment.service_id)
        .await
        .ok()
        .flatten()
        .map_or_else(|| "appointment".to_string(), |s| s.name);
    let offset = match appointment.location_id {
        Some(location_id) => store
            .location(org_id, location_id)
            .await
            .ok()
            .flatten()
            .map_or(default_utc_offset_min, |l| l.utc_offset_min),
        None => default_utc_offset_min,
    };
    let text = format!(
        "Hi {}, your {} is booked for {}.",
        client.name,
        service,
        local_time(appointment.span.start, offset)
    );
    Some((to, text))
}

/// Forward a confirmation for every booked appointment until the hub closes.
pub async fn run_dispatcher(
    mut events: broadcast::Receiver<Event>,
    store: Arc<dyn Store>,
    messenger: Arc<dyn Messenger>,
    default_utc_offset_min: i32,
) {
    loop {
        let appointment = match events.recv().await {
            Ok(Event::AppointmentBooked(appointment)) => appointment,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "confirmation dispatcher lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if !messenger.is_ready().await {
            warn!(appointment_id = %appointment.id, "messenger not ready, confirmation skipped");
            metrics::counter!(observability::CONFIRMATIONS_TOTAL, "status" => "skipped").increment(1);
            continue;
        }
        let Some((to, text)) = confirmation_text(store.as_ref(), &appointment, default_utc_offset_min).await else {
            debug!(appointment_id = %appointment.id, "no contact for confirmation");
            continue;
        };
        match messenger.send_text(&to, &text).await {
            Ok(()) => {
                metrics::counter!(observability::CONFIRMATIONS_TOTAL, "status" => "sent").increment(1);
            }
            Err(e) => {
                metrics::counter!(observability::CONFIRMATIONS_TOTAL, "status" => "failed").increment(1);
                warn!(appointment_id = %appointment.id, "confirmation failed: {e}");
            }
        }
    }
}
