//! Availability & booking engine.
//!
//! Reads flow aggregate → slots → resolver; writes go through commit and
//! setup. The engine keeps no mutable state of its own: everything contested
//! lives behind the [`Store`].

mod aggregate;
mod commit;
mod error;
mod queries;
mod resolver;
mod setup;
pub mod slots;

pub use aggregate::DayConstraints;
pub use commit::BookingRequest;
pub use error::EngineError;
pub use resolver::{EmployeeChoice, SlotBucket, SlotQuery, SlotReport, union_slots};

use std::str::FromStr;
use std::sync::Arc;

use crate::calendar::{ClockTime, MINUTE_MS};
use crate::limits::*;
use crate::model::Ms;
use crate::store::Store;

/// What to do for a location/weekday without a business-hours row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoursPolicy {
    /// No row, no slots.
    Strict,
    /// Pretend the location is open during this window.
    Fallback { open: ClockTime, close: ClockTime },
}

impl FromStr for HoursPolicy {
    type Err = String;

    /// `strict` or `fallback:HH:MM-HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("strict") {
            return Ok(HoursPolicy::Strict);
        }
        let window = s
            .strip_prefix("fallback:")
            .ok_or_else(|| format!("unknown business hours policy {s:?}"))?;
        let (open, close) = window
            .split_once('-')
            .ok_or_else(|| format!("expected fallback:HH:MM-HH:MM, got {s:?}"))?;
        let open = ClockTime::parse(open).map_err(|e| e.to_string())?;
        let close = ClockTime::parse(close).map_err(|e| e.to_string())?;
        if open >= close {
            return Err(format!("fallback window {open}-{close} is empty"));
        }
        Ok(HoursPolicy::Fallback { open, close })
    }
}

/// Deployment-wide slot settings. Never taken from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSettings {
    pub step_min: u32,
    pub hours: HoursPolicy,
    /// Offset used for locations that have none (and for queries without one).
    pub default_utc_offset_min: i32,
}

impl Default for SlotSettings {
    fn default() -> Self {
        Self {
            step_min: 15,
            hours: HoursPolicy::Strict,
            default_utc_offset_min: 0,
        }
    }
}

impl SlotSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(MIN_SLOT_STEP_MIN..=MAX_SLOT_STEP_MIN).contains(&self.step_min) {
            return Err(format!(
                "slot step must be {MIN_SLOT_STEP_MIN}..={MAX_SLOT_STEP_MIN} minutes, got {}",
                self.step_min
            ));
        }
        if self.default_utc_offset_min.abs() > MAX_UTC_OFFSET_MIN {
            return Err(format!("utc offset {} out of range", self.default_utc_offset_min));
        }
        Ok(())
    }

    pub fn step_ms(&self) -> Ms {
        Ms::from(self.step_min) * MINUTE_MS
    }
}

pub struct BookingEngine {
    store: Arc<dyn Store>,
    settings: SlotSettings,
}

impl BookingEngine {
    pub fn new(store: Arc<dyn Store>, settings: SlotSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &SlotSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}
