use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{HOLDS_EXPIRED_TOTAL, RELEASED_TICKETS_TOTAL};
use crate::pricing::unit_price;

use super::ledger::{ensure_capacity, record_outcome};
use super::validate::{now_ms, validate_quantity};
use super::{Engine, EngineError};

fn require(line: &CartLine, status: LineStatus, action: &'static str) -> Result<(), EngineError> {
    if line.status != status {
        return Err(EngineError::InvalidTransition {
            line_id: line.id,
            from: line.status,
            action,
        });
    }
    Ok(())
}

// Lock order everywhere below: cart line first, then its instance row.
impl Engine {
    /// Price a line, take its tickets and record the hold as one durable event.
    pub async fn add_line(
        &self,
        line_id: Ulid,
        cart_id: Ulid,
        instance_id: Ulid,
        pricing_id: Ulid,
        quantity: u32,
    ) -> Result<CartLine, EngineError> {
        validate_quantity(quantity)?;
        // Held until the line is in the store, so a racing add of the same id
        // fails here instead of taking tickets a second time.
        let Some(_claim) = self.store.claim_line(line_id) else {
            return Err(EngineError::AlreadyExists(line_id));
        };
        if self.store.cart_line_count(&cart_id) >= MAX_LINES_PER_CART {
            return Err(EngineError::LimitExceeded("too many lines in cart"));
        }

        let instance = self.get_instance(instance_id).await?;
        if !instance.pricing_ids.is_empty() && !instance.pricing_ids.contains(&pricing_id) {
            return Err(EngineError::InvalidInput(format!(
                "pricing {pricing_id} is not offered on instance {instance_id}"
            )));
        }
        let base = self
            .prices
            .base_price(pricing_id)
            .await
            .ok_or(EngineError::not_found("pricing", pricing_id))?;

        let mut guard = self.lock_for_reserve(instance_id, quantity).await?;
        ensure_capacity(&guard, quantity)?;

        let now = now_ms();
        let line = CartLine {
            id: line_id,
            cart_id,
            instance_id,
            pricing_id,
            quantity,
            unit_price: unit_price(base, guard.price_adjustment),
            status: LineStatus::Held,
            used: false,
            created_at: now,
            updated_at: now,
            expires_at: now.saturating_add(self.config.hold_ttl_ms),
        };
        let event = Event::LineHeld { line: line.clone() };
        self.persist_and_apply(&mut guard, None, &event).await?;
        if !self.store.insert_line(line.clone()) {
            warn!(line = %line_id, "line appeared while its id was claimed");
        }
        record_outcome("ok");
        Ok(line)
    }

    /// Grow or shrink a held line. Growing takes only the difference and
    /// leaves the line unchanged when it does not fit.
    pub async fn change_quantity(&self, line_id: Ulid, quantity: u32) -> Result<CartLine, EngineError> {
        validate_quantity(quantity)?;
        let row = self
            .store
            .line(&line_id)
            .ok_or(EngineError::not_found("line", line_id))?;
        let mut line = row.lock().await;
        require(&line, LineStatus::Held, "resize")?;
        if quantity == line.quantity {
            return Ok(line.clone());
        }

        let growing = quantity > line.quantity;
        let mut guard = if growing {
            let delta = quantity - line.quantity;
            let guard = self.lock_for_reserve(line.instance_id, delta).await?;
            ensure_capacity(&guard, delta)?;
            guard
        } else {
            self.lock_instance_with_retry(line.instance_id).await?
        };

        let event = Event::LineResized {
            id: line_id,
            instance_id: line.instance_id,
            from: line.quantity,
            to: quantity,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, Some(&mut *line), &event).await?;
        if growing {
            record_outcome("ok");
        }
        Ok(line.clone())
    }

    /// Release a held line's tickets and mark it released. Caller holds the line lock.
    async fn release_held(&self, line: &mut CartLine) -> Result<(), EngineError> {
        require(line, LineStatus::Held, "release")?;
        let mut guard = self.lock_instance_with_retry(line.instance_id).await?;
        let event = Event::LineReleased {
            id: line.id,
            instance_id: line.instance_id,
            quantity: line.quantity,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, Some(&mut *line), &event).await?;
        metrics::counter!(RELEASED_TICKETS_TOTAL).increment(u64::from(line.quantity));
        Ok(())
    }

    pub async fn remove_line(&self, line_id: Ulid) -> Result<CartLine, EngineError> {
        let row = self
            .store
            .line(&line_id)
            .ok_or(EngineError::not_found("line", line_id))?;
        let mut line = row.lock().await;
        self.release_held(&mut line).await?;
        Ok(line.clone())
    }

    /// Release every held line of a cart. Confirmed lines are left alone.
    pub async fn abandon_cart(&self, cart_id: Ulid) -> Result<Vec<CartLine>, EngineError> {
        let rows = self.store.cart_lines(&cart_id);
        if rows.is_empty() {
            return Err(EngineError::not_found("cart", cart_id));
        }
        let mut released = Vec::new();
        for row in rows {
            let mut line = row.lock().await;
            if line.status == LineStatus::Held {
                self.release_held(&mut line).await?;
                released.push(line.clone());
            }
        }
        Ok(released)
    }

    /// Held → Confirmed. The tickets were taken when the hold was placed.
    pub async fn confirm_line(&self, line_id: Ulid) -> Result<CartLine, EngineError> {
        let row = self
            .store
            .line(&line_id)
            .ok_or(EngineError::not_found("line", line_id))?;
        let mut line = row.lock().await;
        require(&line, LineStatus::Held, "confirm")?;
        let event = Event::LineConfirmed {
            id: line_id,
            at: now_ms(),
        };
        self.persist_line(&mut line, &event).await?;
        Ok(line.clone())
    }

    /// Confirm every held line of a cart.
    pub async fn confirm_cart(&self, cart_id: Ulid) -> Result<Vec<CartLine>, EngineError> {
        let rows = self.store.cart_lines(&cart_id);
        if rows.is_empty() {
            return Err(EngineError::not_found("cart", cart_id));
        }
        let mut confirmed = Vec::new();
        for row in rows {
            let mut line = row.lock().await;
            if line.status != LineStatus::Held {
                continue;
            }
            let event = Event::LineConfirmed {
                id: line.id,
                at: now_ms(),
            };
            self.persist_line(&mut line, &event).await?;
            confirmed.push(line.clone());
        }
        Ok(confirmed)
    }

    /// Confirmed → Cancelled, giving the tickets back. Used lines stay put.
    pub async fn cancel_line(&self, line_id: Ulid) -> Result<CartLine, EngineError> {
        let row = self
            .store
            .line(&line_id)
            .ok_or(EngineError::not_found("line", line_id))?;
        let mut line = row.lock().await;
        require(&line, LineStatus::Confirmed, "cancel")?;
        if line.used {
            return Err(EngineError::InvalidTransition {
                line_id,
                from: line.status,
                action: "cancel used",
            });
        }

        let mut guard = self.lock_instance_with_retry(line.instance_id).await?;
        let event = Event::LineCancelled {
            id: line_id,
            instance_id: line.instance_id,
            quantity: line.quantity,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, Some(&mut *line), &event).await?;
        metrics::counter!(RELEASED_TICKETS_TOTAL).increment(u64::from(line.quantity));
        Ok(line.clone())
    }

    /// Flag a confirmed line as redeemed at the gate.
    pub async fn mark_used(&self, line_id: Ulid) -> Result<CartLine, EngineError> {
        let row = self
            .store
            .line(&line_id)
            .ok_or(EngineError::not_found("line", line_id))?;
        let mut line = row.lock().await;
        require(&line, LineStatus::Confirmed, "use")?;
        if line.used {
            return Err(EngineError::InvalidTransition {
                line_id,
                from: line.status,
                action: "use again",
            });
        }
        let event = Event::LineUsed {
            id: line_id,
            at: now_ms(),
        };
        self.persist_line(&mut line, &event).await?;
        Ok(line.clone())
    }

    /// Release every held line whose deadline is at or before `now`.
    /// Returns how many were released.
    pub async fn expire_holds(&self, now: Ms) -> usize {
        let mut expired = 0;
        for row in self.store.line_rows() {
            let mut line = row.lock().await;
            if line.status != LineStatus::Held || line.expires_at > now {
                continue;
            }
            match self.release_held(&mut line).await {
                Ok(()) => expired += 1,
                Err(e) => warn!(line = %line.id, "failed to expire hold: {e}"),
            }
        }
        if expired > 0 {
            metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(expired as u64);
            info!(expired, "released expired holds");
        }
        expired
    }

    /// Drop settled lines untouched for the retention window, and the
    /// materialization locks of days already past. Each purge is logged so
    /// replay forgets the line too.
    pub async fn purge_settled_lines(&self, now: Ms) -> usize {
        let cutoff = now.saturating_sub(self.config.line_retention_ms);
        let mut purged = 0;
        for row in self.store.line_rows() {
            let line = row.lock().await;
            if !line.is_settled() || line.updated_at > cutoff {
                continue;
            }
            let event = Event::LinePurged {
                id: line.id,
                cart_id: line.cart_id,
            };
            match self.wal_append(&event).await {
                Ok(()) => {
                    self.store.apply_event(&event);
                    purged += 1;
                }
                Err(e) => warn!(line = %line.id, "failed to purge line: {e}"),
            }
        }

        let evicted = chrono::DateTime::from_timestamp_millis(now)
            .and_then(|t| t.date_naive().pred_opt())
            .map_or(0, |yesterday| self.store.evict_day_locks(yesterday));
        if purged > 0 || evicted > 0 {
            info!(purged, evicted, "dropped settled lines and stale day locks");
        }
        purged
    }

    pub async fn get_line(&self, line_id: Ulid) -> Result<CartLine, EngineError> {
        let row = self
            .store
            .line(&line_id)
            .ok_or(EngineError::not_found("line", line_id))?;
        let line = row.lock().await.clone();
        Ok(line)
    }

    /// Every line of a cart in creation order. Unknown carts have no lines.
    pub async fn cart_lines(&self, cart_id: Ulid) -> Vec<CartLine> {
        let mut lines = Vec::new();
        for row in self.store.cart_lines(&cart_id) {
            lines.push(row.lock().await.clone());
        }
        lines.sort_by_key(|l| (l.created_at, l.id));
        lines
    }
}
