//! Durable timer scheduling.
//!
//! The `wf.lifecycle_timer_schedule` row is the source of truth. A
//! [`TimerSubstrate`] is only a wake-up optimization: enqueue happens
//! best-effort after the owning change set commits, and anything the
//! substrate misses is picked up by due-timer polling and crash recovery.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{EntityRef, TimerSchedule, TimerStatus};
use crate::state_machine::TimerRequest;
use crate::storage::Store;

/// Pluggable delayed-wakeup backend (job queue, cron shim, in-process wheel).
#[async_trait]
pub trait TimerSubstrate: Send + Sync {
    /// Register a wake-up; returns the substrate's correlation handle.
    async fn enqueue(&self, schedule_id: Uuid, fire_at: DateTime<Utc>) -> Result<String>;

    /// Best-effort revocation. The schedule row CAS is what actually
    /// prevents a canceled timer from acting.
    async fn cancel(&self, job_id: &str) -> Result<()>;
}

/// Substrate that registers nothing. Deployments using it rely entirely on
/// [`TimerScheduler::due`] polling.
#[derive(Debug, Default)]
pub struct NullSubstrate;

#[async_trait]
impl TimerSubstrate for NullSubstrate {
    async fn enqueue(&self, schedule_id: Uuid, _fire_at: DateTime<Utc>) -> Result<String> {
        Ok(schedule_id.to_string())
    }

    async fn cancel(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Coordinates schedule rows with the substrate.
pub struct TimerScheduler {
    store: Arc<dyn Store>,
    substrate: Arc<dyn TimerSubstrate>,
}

impl TimerScheduler {
    pub fn new(store: Arc<dyn Store>, substrate: Arc<dyn TimerSubstrate>) -> Self {
        Self { store, substrate }
    }

    /// Build the schedule row for a planned timer so callers can embed the
    /// insert in the same change set as the state change that wants it.
    pub fn build_row(
        tenant_id: Uuid,
        entity: &EntityRef,
        lifecycle_id: Option<Uuid>,
        state: Option<String>,
        request: &TimerRequest,
    ) -> TimerSchedule {
        TimerSchedule {
            id: Uuid::new_v4(),
            tenant_id,
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id,
            lifecycle_id,
            state,
            timer_type: request.timer_type,
            status: TimerStatus::Scheduled,
            fire_at: request.fire_at,
            policy_snapshot: request.policy_snapshot.clone(),
            job_id: None,
            created_at: Utc::now(),
            fired_at: None,
            canceled_at: None,
        }
    }

    /// Hand a freshly committed schedule row to the substrate. Failures are
    /// logged and swallowed: the row is durable and polling will catch it.
    pub async fn notify_scheduled(&self, timer: &TimerSchedule) {
        match self.substrate.enqueue(timer.id, timer.fire_at).await {
            Ok(job_id) => {
                debug!(
                    schedule_id = %timer.id,
                    timer_type = %timer.timer_type,
                    job_id = %job_id,
                    "timer enqueued"
                );
            }
            Err(e) => {
                warn!(schedule_id = %timer.id, error = %e, "substrate enqueue failed");
            }
        }
    }

    /// Cancel every scheduled timer attached to an entity. Idempotent;
    /// returns how many rows this call actually flipped.
    pub async fn cancel_for_entity(&self, tenant_id: Uuid, entity: &EntityRef) -> Result<usize> {
        let timers = self
            .store
            .scheduled_timers_for_entity(tenant_id, entity)
            .await?;
        let mut canceled = 0;
        for timer in timers {
            let won = self
                .store
                .transition_timer(timer.id, TimerStatus::Scheduled, TimerStatus::Canceled)
                .await?;
            if !won {
                continue;
            }
            canceled += 1;
            if let Some(job_id) = &timer.job_id {
                if let Err(e) = self.substrate.cancel(job_id).await {
                    warn!(schedule_id = %timer.id, error = %e, "substrate cancel failed");
                }
            }
        }
        Ok(canceled)
    }

    /// Claim a timer for firing. Exactly one caller wins the
    /// `scheduled -> fired` flip; losers get `None` and must do nothing.
    pub async fn claim_fire(&self, schedule_id: Uuid) -> Result<Option<TimerSchedule>> {
        let won = self
            .store
            .transition_timer(schedule_id, TimerStatus::Scheduled, TimerStatus::Fired)
            .await?;
        if !won {
            debug!(schedule_id = %schedule_id, "fire claim lost, timer already settled");
            return Ok(None);
        }
        let timer = self.store.timer(schedule_id).await?;
        Ok(Some(timer))
    }

    /// Scheduled rows whose `fire_at` has passed, oldest first.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<TimerSchedule>> {
        self.store.due_timers(now).await
    }

    /// Re-enqueue scheduled rows after a restart. Past-due rows are left for
    /// the caller to fire through the normal claim path.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<Vec<TimerSchedule>> {
        let due = self.store.due_timers(now).await?;
        if !due.is_empty() {
            info!(count = due.len(), "recovered past-due timers");
        }
        Ok(due)
    }
}
