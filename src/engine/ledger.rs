use std::time::Duration;

use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::observability::{RELEASED_TICKETS_TOTAL, RESERVATIONS_TOTAL};

use super::validate::validate_quantity;
use super::{Engine, EngineError};

pub(super) type InstanceGuard = OwnedRwLockWriteGuard<SlotInstance>;

pub(super) fn record_outcome(outcome: &'static str) {
    metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Refuse a decrement that would take the counter below zero.
pub(super) fn ensure_capacity(instance: &SlotInstance, quantity: u32) -> Result<(), EngineError> {
    if instance.available_tickets < quantity {
        record_outcome("capacity");
        return Err(EngineError::CapacityExceeded {
            instance_id: instance.id,
            requested: quantity,
            available: instance.available_tickets,
        });
    }
    Ok(())
}

impl Engine {
    /// Write lock on an instance row, waiting at most `lock_wait`.
    async fn lock_instance(&self, instance_id: Ulid) -> Result<InstanceGuard, EngineError> {
        let row = self
            .store
            .instance(&instance_id)
            .ok_or(EngineError::not_found("instance", instance_id))?;
        tokio::time::timeout(self.config.lock_wait, row.write_owned())
            .await
            .map_err(|_| EngineError::ConcurrencyConflict(instance_id))
    }

    /// `lock_instance`, retrying conflicts with a short linear backoff.
    pub(super) async fn lock_instance_with_retry(
        &self,
        instance_id: Ulid,
    ) -> Result<InstanceGuard, EngineError> {
        let mut attempt = 0;
        loop {
            match self.lock_instance(instance_id).await {
                Err(EngineError::ConcurrencyConflict(_)) if attempt < self.config.conflict_retries => {
                    attempt += 1;
                    debug!(instance = %instance_id, attempt, "instance row busy, retrying");
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    /// Row lock for a decrement. A row that stays busy past every retry is
    /// reported as out of capacity, with nothing taken.
    pub(super) async fn lock_for_reserve(
        &self,
        instance_id: Ulid,
        quantity: u32,
    ) -> Result<InstanceGuard, EngineError> {
        match self.lock_instance_with_retry(instance_id).await {
            Err(EngineError::ConcurrencyConflict(_)) => {
                record_outcome("conflict");
                // The counter cannot be read while contended.
                Err(EngineError::CapacityExceeded {
                    instance_id,
                    requested: quantity,
                    available: 0,
                })
            }
            other => other,
        }
    }

    /// Take `quantity` tickets if at least that many remain. All or nothing.
    pub async fn reserve(&self, instance_id: Ulid, quantity: u32) -> Result<Availability, EngineError> {
        validate_quantity(quantity)?;
        let mut guard = self.lock_for_reserve(instance_id, quantity).await?;
        ensure_capacity(&guard, quantity)?;

        let event = Event::TicketsReserved {
            instance_id,
            quantity,
        };
        self.persist_and_apply(&mut guard, None, &event).await?;
        record_outcome("ok");
        Ok(guard.availability())
    }

    /// Give tickets back. The counter never rises above the instance's limit.
    pub async fn release(&self, instance_id: Ulid, quantity: u32) -> Result<Availability, EngineError> {
        validate_quantity(quantity)?;
        let mut guard = self.lock_instance_with_retry(instance_id).await?;
        let before = guard.available_tickets;

        let event = Event::TicketsReleased {
            instance_id,
            quantity,
        };
        self.persist_and_apply(&mut guard, None, &event).await?;
        metrics::counter!(RELEASED_TICKETS_TOTAL)
            .increment(u64::from(guard.available_tickets.saturating_sub(before)));
        Ok(guard.availability())
    }

    pub async fn query(&self, instance_id: Ulid) -> Result<Availability, EngineError> {
        Ok(self.get_instance(instance_id).await?.availability())
    }
}
