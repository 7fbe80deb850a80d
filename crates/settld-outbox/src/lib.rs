//! settld-outbox
//!
//! The maintenance loop: a single cooperative scheduler that drains the
//! outbox table for three tick kinds — holdback release, month close, payout
//! enqueue. An advisory lock keeps at most one tick per `(tenant, kind)`
//! running at a time; each message is idempotent on its key, so at-least-once
//! delivery is observationally exactly-once. Ticks are driven by the
//! engine's injected clock, so tests advance time manually and call
//! [`MaintenanceLoop::tick`] directly.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use settld_core::SettldError;
use settld_state::{OutboxKind, OutboxMessage, StateEngine};
use tracing::{info, warn};

/// Scheduler over one engine, for a fixed set of tenants.
pub struct MaintenanceLoop {
    engine: Arc<StateEngine>,
    tenants: Vec<String>,
    batch_size: usize,
    in_flight: Mutex<HashSet<(String, OutboxKind)>>,
}

/// Releases the advisory slot when a tick finishes, success or not.
struct TickGuard<'a> {
    owner: &'a MaintenanceLoop,
    key: (String, OutboxKind),
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .in_flight
            .lock()
            .expect("tick registry")
            .remove(&self.key);
    }
}

impl MaintenanceLoop {
    pub fn new(engine: Arc<StateEngine>, tenants: Vec<String>, batch_size: usize) -> Self {
        Self {
            engine,
            tenants,
            batch_size,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Run one tick for `(tenant, kind)`: drain up to the batch bound of due
    /// messages. Returns the number processed, or `None` when another tick
    /// for the same `(tenant, kind)` is already running.
    pub fn tick(&self, tenant: &str, kind: OutboxKind) -> Result<Option<usize>, SettldError> {
        let key = (tenant.to_string(), kind);
        {
            let mut in_flight = self.in_flight.lock().expect("tick registry");
            if !in_flight.insert(key.clone()) {
                return Ok(None);
            }
        }
        let _guard = TickGuard { owner: self, key };

        let now = self.engine.now();
        let due = self
            .engine
            .db
            .due_outbox(tenant, kind, now, self.batch_size)?;
        let mut processed = 0usize;
        for msg in due {
            match self.process(&msg) {
                Ok(()) => {
                    self.engine.db.remove_outbox(&msg)?;
                    processed += 1;
                }
                Err(e) => {
                    // Leave the message in place; the next tick retries it.
                    warn!(
                        kind = kind.as_str(),
                        message_id = %msg.message_id,
                        error = %e,
                        "outbox message failed"
                    );
                }
            }
        }
        if processed > 0 {
            info!(tenant = %tenant, kind = kind.as_str(), processed, "maintenance tick");
        }
        Ok(Some(processed))
    }

    fn process(&self, msg: &OutboxMessage) -> Result<(), SettldError> {
        // Duplicate delivery: the idempotency key has already been honoured.
        if self.engine.db.outbox_is_done(msg)? {
            return Ok(());
        }
        match msg.kind {
            OutboxKind::HoldbackRelease => {
                let gate_id = msg.payload["gateId"].as_str().ok_or_else(|| {
                    SettldError::Serialization("holdback message missing gateId".to_string())
                })?;
                self.engine.release_holdback(&msg.tenant_id, gate_id)?;
            }
            OutboxKind::MonthClose => {
                let period = msg.payload["period"].as_str().ok_or_else(|| {
                    SettldError::Serialization("month-close message missing period".to_string())
                })?;
                self.engine.close_month(&msg.tenant_id, period)?;
            }
            OutboxKind::PayoutEnqueue => {
                let gate_id = msg.payload["gateId"].as_str().ok_or_else(|| {
                    SettldError::Serialization("payout message missing gateId".to_string())
                })?;
                self.engine.enqueue_payout(&msg.tenant_id, gate_id)?;
            }
        }
        self.engine.db.mark_outbox_done(msg)?;
        Ok(())
    }

    /// One pass over every `(tenant, kind)` pair. Used by the async driver
    /// and directly by tests.
    pub fn tick_all(&self) -> Result<usize, SettldError> {
        let mut total = 0;
        for tenant in &self.tenants {
            for kind in OutboxKind::ALL {
                if let Some(n) = self.tick(tenant, kind)? {
                    total += n;
                }
            }
        }
        Ok(total)
    }

    /// Cooperative driver: tick on an interval until the task is aborted.
    /// State-change traffic never waits on this loop — when the outbox is
    /// behind, the loop catches up batch by batch.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            let this = Arc::clone(&self);
            let result = tokio::task::spawn_blocking(move || this.tick_all()).await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "maintenance pass failed"),
                Err(e) => warn!(error = %e, "maintenance task panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use settld_core::IsoMillis;
    use settld_state::{Clock, EngineConfig, ManualClock, StateDb};
    use std::sync::Arc;

    fn temp_db() -> Arc<StateDb> {
        let dir = std::env::temp_dir().join(format!(
            "settld_outbox_{}_{}",
            std::process::id(),
            rand_suffix()
        ));
        Arc::new(StateDb::open(dir).unwrap())
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos() as u64
    }

    fn engine_with_clock() -> (Arc<StateEngine>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            IsoMillis::parse("2026-08-01T00:00:00.000Z").unwrap(),
        ));
        let engine = Arc::new(StateEngine::new(
            temp_db(),
            clock.clone() as Arc<dyn Clock>,
            EngineConfig::default(),
            Arc::new(settld_crypto::KeyPair::generate()),
        ));
        (engine, clock)
    }

    fn enqueue_month_close(engine: &StateEngine, scheduled: &str, idem: &str) {
        engine
            .db
            .enqueue_outbox(&OutboxMessage {
                tenant_id: "tn".into(),
                kind: OutboxKind::MonthClose,
                message_id: format!("obx_{idem}"),
                scheduled_at: IsoMillis::parse(scheduled).unwrap(),
                idempotency_key: idem.to_string(),
                payload: serde_json::json!({ "period": "2026-07" }),
            })
            .unwrap();
    }

    #[test]
    fn tick_processes_only_due_messages() {
        let (engine, clock) = engine_with_clock();
        let looper = MaintenanceLoop::new(engine.clone(), vec!["tn".into()], 16);

        enqueue_month_close(&engine, "2026-08-01T00:00:00.000Z", "due-1");
        enqueue_month_close(&engine, "2026-08-02T00:00:00.000Z", "future-1");

        assert_eq!(looper.tick("tn", OutboxKind::MonthClose).unwrap(), Some(1));

        clock.advance_ms(2 * 86_400_000);
        assert_eq!(looper.tick("tn", OutboxKind::MonthClose).unwrap(), Some(1));
        assert_eq!(looper.tick("tn", OutboxKind::MonthClose).unwrap(), Some(0));
    }

    #[test]
    fn duplicate_idempotency_key_is_observationally_once() {
        let (engine, _clock) = engine_with_clock();
        let looper = MaintenanceLoop::new(engine.clone(), vec!["tn".into()], 16);

        enqueue_month_close(&engine, "2026-08-01T00:00:00.000Z", "same-key");
        looper.tick("tn", OutboxKind::MonthClose).unwrap();
        let events_after_first = engine.db.stream_events("tn", "ledger:tn").unwrap().len();

        // Re-deliver the same logical message.
        enqueue_month_close(&engine, "2026-08-01T00:00:00.000Z", "same-key");
        looper.tick("tn", OutboxKind::MonthClose).unwrap();
        let events_after_second = engine.db.stream_events("tn", "ledger:tn").unwrap().len();
        assert_eq!(events_after_first, events_after_second);
    }

    #[test]
    fn batch_size_bounds_one_tick() {
        let (engine, _clock) = engine_with_clock();
        let looper = MaintenanceLoop::new(engine.clone(), vec!["tn".into()], 2);
        for i in 0..5 {
            enqueue_month_close(&engine, "2026-08-01T00:00:00.000Z", &format!("k{i}"));
        }
        assert_eq!(looper.tick("tn", OutboxKind::MonthClose).unwrap(), Some(2));
        assert_eq!(looper.tick("tn", OutboxKind::MonthClose).unwrap(), Some(2));
        assert_eq!(looper.tick("tn", OutboxKind::MonthClose).unwrap(), Some(1));
    }
}
