use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::hours::{resolve_day, DayStatus};
use super::validate::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Ensure the date's instances exist and return all of them, sorted by start.
    ///
    /// Active templates each get one instance. Without any, the opening hours
    /// are cut into fixed blocks. Running this twice creates nothing new.
    pub async fn materialize_for_date(
        &self,
        park_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotInstance>, EngineError> {
        let park = self.get_park(park_id)?;
        let day_lock = self.store.day_lock(park_id, date);
        let _guard = day_lock.lock().await;

        let templates = self.active_templates(park_id, date)?;
        let created = if templates.is_empty() {
            self.autofill(&park, date).await?
        } else {
            self.from_templates(&templates, date).await
        };
        if created > 0 {
            info!(park = %park_id, %date, created, "materialized instances");
        }

        self.instances_for_date(park_id, date).await
    }

    async fn from_templates(&self, templates: &[TimeSlotTemplate], date: NaiveDate) -> usize {
        let mut created = 0;
        for template in templates {
            let key = InstanceKey::Template {
                template_id: template.id,
                date,
            };
            if self.store.identity_owner(&key).is_some() {
                debug!(template = %template.id, %date, "instance already present");
                continue;
            }
            let instance = SlotInstance {
                id: Ulid::new(),
                park_id: template.park_id,
                date,
                source: SlotSource::Template(template.id),
                start: template.start_time,
                end: template.end_time,
                ticket_limit: template.ticket_limit,
                available_tickets: template.ticket_limit,
                price_adjustment: template.price_adjustment,
                pricing_ids: template.pricing_ids.clone(),
                created_at: now_ms(),
            };
            match self.create_instance(instance).await {
                Ok(()) => created += 1,
                Err(e) => warn!(template = %template.id, %date, "skipped template instance: {e}"),
            }
        }
        created
    }

    async fn autofill(&self, park: &ParkProfile, date: NaiveDate) -> Result<usize, EngineError> {
        let hours = match resolve_day(park, date)? {
            DayStatus::Open(hours) => hours,
            DayStatus::Closed(reason) => {
                debug!(park = %park.id, %date, %reason, "closed, nothing to auto-fill");
                return Ok(0);
            }
        };

        let mut taken = HashSet::new();
        for row in self.store.day_instances(park.id, date) {
            let instance = row.read().await;
            taken.insert((instance.start, instance.end));
        }

        let block = self.config.autofill_block_minutes.max(1);
        let close = hours.close.minutes();
        let mut cursor = hours.open.minutes();
        let mut created = 0;
        while cursor < close {
            let next = cursor.saturating_add(block).min(close);
            let (Some(start), Some(end)) = (TimeOfDay::from_minutes(cursor), TimeOfDay::from_minutes(next))
            else {
                break;
            };
            cursor = next;

            if taken.contains(&(start, end)) {
                debug!(park = %park.id, %date, %start, %end, "block already present");
                continue;
            }
            let instance = SlotInstance {
                id: Ulid::new(),
                park_id: park.id,
                date,
                source: SlotSource::AutoFill,
                start,
                end,
                ticket_limit: self.config.autofill_ticket_limit,
                available_tickets: self.config.autofill_ticket_limit,
                price_adjustment: 0,
                pricing_ids: Vec::new(),
                created_at: now_ms(),
            };
            match self.create_instance(instance).await {
                Ok(()) => created += 1,
                Err(e) => warn!(park = %park.id, %date, %start, %end, "skipped auto-fill block: {e}"),
            }
        }
        Ok(created)
    }

    /// Insert a new instance. The store refuses a second instance with the same identity.
    async fn create_instance(&self, instance: SlotInstance) -> Result<(), EngineError> {
        if self.store.day_instance_count(instance.park_id, instance.date) >= MAX_INSTANCES_PER_DAY {
            return Err(EngineError::LimitExceeded("too many instances for one day"));
        }
        let (id, key) = (instance.id, instance.identity());
        self.store
            .claim_identity(key, id)
            .map_err(EngineError::AlreadyExists)?;

        let source = match instance.source {
            SlotSource::Template(_) => "template",
            SlotSource::AutoFill => "autofill",
        };
        let event = Event::InstanceCreated { instance };
        if let Err(e) = self.wal_append(&event).await {
            self.store.release_identity(&key, id);
            return Err(e);
        }
        self.store.apply_event(&event);
        metrics::counter!(crate::observability::INSTANCES_MATERIALIZED_TOTAL, "source" => source)
            .increment(1);
        Ok(())
    }

    /// Instances already created for the date, without creating any.
    pub async fn instances_for_date(
        &self,
        park_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotInstance>, EngineError> {
        self.get_park(park_id)?;
        let mut instances = Vec::new();
        for row in self.store.day_instances(park_id, date) {
            instances.push(row.read().await.clone());
        }
        instances.sort_by_key(|i| (i.start, i.end, i.id));
        Ok(instances)
    }

    /// What a customer can book: the park must be open, then the day is materialized.
    pub async fn bookable_slots(
        &self,
        park_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotInstance>, EngineError> {
        self.resolve_hours(park_id, date)?;
        self.materialize_for_date(park_id, date).await
    }

    pub async fn get_instance(&self, instance_id: Ulid) -> Result<SlotInstance, EngineError> {
        let row = self
            .store
            .instance(&instance_id)
            .ok_or(EngineError::not_found("instance", instance_id))?;
        let instance = row.read().await.clone();
        Ok(instance)
    }
}
