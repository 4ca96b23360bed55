/// Daily quota gate
/// Caps countable generation calls per calendar day for non-premium sessions.
/// Advisory only: the counter lives in the local store and is not shared
/// between processes.
use chrono::NaiveDate;
use parking_lot::Mutex;
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::keys;
use crate::store::KeyValueStore;
use crate::{GatewayError, Result};

/// URL fragments of requests that never consume quota
const EXCLUDED_MARKERS: [&str; 4] = ["/status", "/result", "/requests/", "polling="];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub used: u32,
    pub limit: u32,
    pub reset_day: Option<NaiveDate>,
    pub premium: bool,
}

impl QuotaStatus {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

pub struct QuotaGate {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    daily_limit: u32,
    /// Serialises rollover, check and increment
    lock: Mutex<()>,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, daily_limit: u32) -> Self {
        Self {
            store,
            clock,
            daily_limit,
            lock: Mutex::new(()),
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Premium sessions bypass the gate entirely
    pub fn is_premium(&self) -> bool {
        self.store.get(keys::PREMIUM).as_deref() == Some("true")
    }

    pub fn is_quota_exceeded(&self) -> bool {
        let _guard = self.lock.lock();
        self.rollover() >= self.daily_limit
    }

    /// Only top-level POST submissions count; status, result and polling
    /// requests are free.
    pub fn should_count(&self, url: &str, method: &Method) -> bool {
        *method == Method::POST && !EXCLUDED_MARKERS.iter().any(|m| url.contains(m))
    }

    pub fn record_call(&self) {
        let _guard = self.lock.lock();
        let used = self.rollover();
        self.write_count(used.saturating_add(1));
    }

    /// Single enforcement point run before a request is sent. Countable
    /// requests from non-premium sessions are checked and recorded in one step.
    pub fn check_and_record(&self, url: &str, method: &Method, polling: bool) -> Result<()> {
        if polling || !self.should_count(url, method) || self.is_premium() {
            return Ok(());
        }

        let _guard = self.lock.lock();
        let used = self.rollover();
        if used >= self.daily_limit {
            info!("Daily quota reached ({}/{})", used, self.daily_limit);
            return Err(GatewayError::QuotaExceeded {
                used,
                limit: self.daily_limit,
            });
        }

        let used = used.saturating_add(1);
        self.write_count(used);
        debug!("Quota call recorded: {}/{}", used, self.daily_limit);
        Ok(())
    }

    pub fn status(&self) -> QuotaStatus {
        let _guard = self.lock.lock();
        let used = self.rollover();
        QuotaStatus {
            used,
            limit: self.daily_limit,
            reset_day: self.stored_day(),
            premium: self.is_premium(),
        }
    }

    /// Zero the counter. The stored day only moves forward.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.lock.lock();
        let today = self.clock.today();
        let day = self.stored_day().map_or(today, |stored| stored.max(today));
        self.store.set(keys::DAILY_CALLS, "0")?;
        self.store
            .set(keys::RESET_DATE, &day.format("%Y-%m-%d").to_string())
    }

    /// Zero the counter when the day moved forward and return the current
    /// count. The stored day never moves backwards. Caller holds the lock.
    fn rollover(&self) -> u32 {
        let today = self.clock.today();
        match self.stored_day() {
            Some(day) if day == today => self.read_count(),
            Some(day) if day > today => {
                warn!("Clock is behind stored quota day {}; keeping counter", day);
                self.read_count()
            }
            _ => {
                debug!("Quota day rolled over to {}", today);
                self.write_count(0);
                if let Err(e) = self
                    .store
                    .set(keys::RESET_DATE, &today.format("%Y-%m-%d").to_string())
                {
                    warn!("Failed to store quota day: {}", e);
                }
                0
            }
        }
    }

    fn stored_day(&self) -> Option<NaiveDate> {
        self.store
            .get(keys::RESET_DATE)
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
    }

    fn read_count(&self) -> u32 {
        self.store
            .get(keys::DAILY_CALLS)
            .and_then(|c| c.trim().parse().ok())
            .unwrap_or(0)
    }

    fn write_count(&self, count: u32) {
        if let Err(e) = self.store.set(keys::DAILY_CALLS, &count.to_string()) {
            warn!("Failed to store quota counter: {}", e);
        }
    }
}
